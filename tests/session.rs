mod common;

use bytemuck::Zeroable;
use std::{
    collections::HashMap,
    ffi::OsString,
    num::NonZeroUsize,
    time::Duration,
};

use fusebox::{
    client::{self, Client, RawReply},
    config::SessionConfig,
    proto::{self, InitFlags, Opcode},
    request::{Operation, Request},
    session::{Session, SessionState},
    Errno, FuseError, Ino, ProtocolError,
};

use common::{MemFs, SLOW, STUCK};

const PATIENCE: Duration = Duration::from_secs(5);

async fn connect(fs: MemFs, config: SessionConfig) -> (Client, Session<MemFs>) {
    common::init_logging();

    let (client, start) = client::pair().unwrap();
    let (session, init) = tokio::join!(start.start(fs, config), client.init());

    let init = init.unwrap();
    assert_eq!(init.errno(), None);

    match session {
        Ok(session) => (client, session),
        Err(error) => panic!("handshake failed: {}", error),
    }
}

async fn next(client: &Client) -> RawReply {
    tokio::time::timeout(PATIENCE, client.receive())
        .await
        .expect("no reply in time")
        .unwrap()
        .expect("session closed the channel")
}

async fn collect(client: &Client, count: usize) -> HashMap<u64, RawReply> {
    let mut replies = HashMap::new();
    for _ in 0..count {
        let reply = next(client).await;
        assert!(
            replies.insert(reply.unique(), reply).is_none(),
            "request answered twice"
        );
    }

    replies
}

async fn assert_silent(client: &Client) {
    let extra = tokio::time::timeout(Duration::from_millis(200), client.receive()).await;
    assert!(extra.is_err(), "unexpected reply: {:?}", extra);
}

fn lookup(name: &str) -> Operation {
    Operation::Lookup { name: name.into() }
}

fn entry_of(reply: &RawReply) -> proto::EntryOut {
    reply.body_as().expect("not an entry reply")
}

async fn mkdir(client: &Client, name: &str) -> proto::EntryOut {
    let mkdir = Operation::Mkdir {
        prefix: proto::MkdirIn {
            mode: 0o755,
            umask: 0,
        },
        name: name.into(),
    };

    let reply = client.call(Ino::ROOT, mkdir).await.unwrap();
    assert_eq!(reply.errno(), None);
    entry_of(&reply)
}

async fn create(client: &Client, name: &str) -> (proto::EntryOut, proto::OpenOut) {
    let create = Operation::Create {
        prefix: proto::CreateIn {
            flags: nix::libc::O_RDWR as u32,
            mode: 0o644,
            ..Zeroable::zeroed()
        },
        name: OsString::from(name),
    };

    let reply = client.call(Ino::ROOT, create).await.unwrap();
    assert_eq!(reply.errno(), None);

    let split = std::mem::size_of::<proto::EntryOut>();
    assert_eq!(reply.body.len(), split + std::mem::size_of::<proto::OpenOut>());

    (
        bytemuck::pod_read_unaligned(&reply.body[..split]),
        bytemuck::pod_read_unaligned(&reply.body[split..]),
    )
}

fn write(fh: u64, offset: u64, data: &[u8]) -> Operation {
    Operation::Write {
        prefix: proto::WriteIn {
            fh,
            offset,
            size: data.len() as u32,
            ..Zeroable::zeroed()
        },
        data: data.to_vec(),
    }
}

fn init(major: u32, minor: u32) -> Operation {
    Operation::Init(proto::InitIn {
        major,
        minor,
        max_readahead: 0x20000,
        flags: 0,
    })
}

#[tokio::test]
async fn handshake_negotiates_protocol() {
    common::init_logging();

    let config = SessionConfig::default();
    let (client, start) = client::pair().unwrap();
    let handle = start.handle();
    assert_eq!(handle.state(), SessionState::Unmounted);

    let (session, init) = tokio::join!(start.start(MemFs::default(), config.clone()), client.init());
    let session = session.unwrap();
    let init: proto::InitOut = init.unwrap().body_as().expect("not an init reply");

    assert_eq!(init.major, proto::MAJOR_VERSION);
    assert_eq!(init.minor, proto::TARGET_MINOR_VERSION);
    assert_eq!(init.time_gran, 1);
    assert_eq!(init.max_readahead, 0x20000);
    assert_eq!(init.max_write, config.effective_max_write());
    assert_eq!(init.max_pages, config.max_pages());

    let offered = InitFlags::ASYNC_READ
        | InitFlags::ATOMIC_O_TRUNC
        | InitFlags::BIG_WRITES
        | InitFlags::AUTO_INVAL_DATA
        | InitFlags::PARALLEL_DIROPS
        | InitFlags::MAX_PAGES;

    assert_eq!(InitFlags::from_bits_truncate(init.flags), offered);
    assert_eq!(session.proto_minor(), proto::TARGET_MINOR_VERSION);
    assert_eq!(handle.state(), SessionState::Mounted);
}

#[tokio::test]
async fn old_protocol_versions_are_refused() {
    common::init_logging();

    let (client, start) = client::pair().unwrap();
    let handle = start.handle();

    let (session, reply) = tokio::join!(
        start.start(MemFs::default(), SessionConfig::default()),
        client.call(Ino::NULL, init(7, 20))
    );

    assert_eq!(reply.unwrap().errno(), Some(Errno::EPROTONOSUPPORT));
    match session {
        Err(FuseError::Protocol(ProtocolError::Version { major: 7, minor: 20 })) => (),
        Err(error) => panic!("unexpected error: {}", error),
        Ok(_) => panic!("handshake should have failed"),
    }

    assert_eq!(handle.state(), SessionState::Unmounted);
}

#[tokio::test]
async fn newer_major_version_is_answered_with_ours() {
    common::init_logging();

    let (client, start) = client::pair().unwrap();
    let kernel = async {
        let first = client.call(Ino::NULL, init(8, 0)).await.unwrap();
        assert_eq!(first.errno(), None);
        assert_eq!(first.body_as::<u32>(), Some(proto::MAJOR_VERSION));

        client.init().await.unwrap()
    };

    let (session, second) = tokio::join!(start.start(MemFs::default(), SessionConfig::default()), kernel);

    assert_eq!(second.errno(), None);
    assert_eq!(session.unwrap().proto_minor(), proto::TARGET_MINOR_VERSION);
}

#[tokio::test]
async fn first_message_must_be_init() {
    common::init_logging();

    let (client, start) = client::pair().unwrap();
    let (session, reply) = tokio::join!(
        start.start(MemFs::default(), SessionConfig::default()),
        client.call(Ino::ROOT, Operation::Statfs)
    );

    assert_eq!(reply.unwrap().errno(), Some(Errno::EIO));
    match session {
        Err(FuseError::Protocol(ProtocolError::NotInit(Opcode::Statfs))) => (),
        Err(error) => panic!("unexpected error: {}", error),
        Ok(_) => panic!("handshake should have failed"),
    }
}

#[tokio::test]
async fn every_request_is_answered_once() {
    let (client, session) = connect(MemFs::default(), SessionConfig::default()).await;
    let dispatcher = session.dispatcher().clone();
    let run = tokio::spawn(session.run());

    let dir = Ino(mkdir(&client, "dir").await.nodeid);
    assert_eq!(dispatcher.table().lookups(dir), Some(1));

    let requests = [
        client.request(Ino::ROOT, Operation::Getattr(Zeroable::zeroed())),
        client.request(Ino::ROOT, Operation::Statfs),
        client.request(Ino::ROOT, lookup("missing")),
        client.request(Ino::ROOT, lookup("dir")),
        client.request(Ino::ROOT, Operation::Unsupported(Opcode::Getxattr)),
    ];

    for request in &requests {
        client.send(request).await.unwrap();
    }

    let replies = collect(&client, requests.len()).await;
    let errno = |index: usize| replies[&requests[index].unique()].errno();

    assert_eq!(errno(0), None);
    assert_eq!(errno(1), None);
    assert_eq!(errno(2), Some(Errno::ENOENT));
    assert_eq!(errno(3), None);
    assert_eq!(errno(4), Some(Errno::ENOSYS));
    assert_eq!(entry_of(&replies[&requests[3].unique()]).nodeid, dir.0);
    assert_eq!(dispatcher.table().lookups(dir), Some(2));

    let forget = client.request(dir, Operation::Forget(proto::ForgetIn { nlookup: 2 }));
    client.send(&forget).await.unwrap();

    let watched = &dispatcher;
    let forgotten = common::wait_for(PATIENCE, || async move {
        watched.table().lookups(dir).is_none() && !watched.fs().forgotten.lock().unwrap().is_empty()
    })
    .await;

    assert!(forgotten);
    assert_eq!(*dispatcher.fs().forgotten.lock().unwrap(), [dir]);
    assert_silent(&client).await;

    drop(client);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_frames_do_not_end_the_session() {
    let (client, session) = connect(MemFs::default(), SessionConfig::default()).await;
    let handle = session.handle();
    let run = tokio::spawn(session.run());

    // Too short to carry a request id, so there is no one to answer
    client.send_raw(&[1, 2, 3]).await.unwrap();

    let mut unknown = client.request(Ino::ROOT, Operation::Statfs).encode();
    unknown[4..8].copy_from_slice(&9999u32.to_ne_bytes());
    let unknown_unique = u64::from_ne_bytes(unknown[8..16].try_into().unwrap());
    client.send_raw(&unknown).await.unwrap();

    let reply = next(&client).await;
    assert_eq!(reply.unique(), unknown_unique);
    assert_eq!(reply.errno(), Some(Errno::EIO));

    let reply = client.call(Ino::ROOT, Operation::Statfs).await.unwrap();
    assert_eq!(reply.errno(), None);
    assert_eq!(handle.state(), SessionState::Mounted);

    drop(client);
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn writes_to_one_handle_keep_their_order() {
    let config = SessionConfig::default().workers(NonZeroUsize::new(8).unwrap());
    let (client, session) = connect(MemFs::with_slow_writes(), config).await;
    let dispatcher = session.dispatcher().clone();
    let run = tokio::spawn(session.run());

    let (_, open) = create(&client, "file").await;

    let data = b"abcdefgh";
    for (offset, byte) in data.iter().enumerate() {
        let request = client.request(Ino::NULL, write(open.fh, offset as u64, &[*byte]));
        client.send(&request).await.unwrap();
    }

    let replies = collect(&client, data.len()).await;
    assert!(replies.values().all(|reply| reply.errno().is_none()));
    assert_eq!(*dispatcher.fs().journal.lock().unwrap(), [0, 1, 2, 3, 4, 5, 6, 7]);

    let read = Operation::Read(proto::ReadIn {
        fh: open.fh,
        offset: 0,
        size: 64,
        ..Zeroable::zeroed()
    });

    let reply = client.call(Ino::NULL, read).await.unwrap();
    assert_eq!(reply.body, data);

    drop(client);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn interrupted_requests_fail_with_eintr() {
    let (client, session) = connect(MemFs::default(), SessionConfig::default()).await;
    let handle = session.handle();
    let run = tokio::spawn(session.run());

    let stuck = client.request(Ino::ROOT, lookup(STUCK));
    client.send(&stuck).await.unwrap();

    let interrupt = proto::InterruptIn {
        unique: stuck.unique(),
    };

    client
        .send(&client.request(Ino::NULL, Operation::Interrupt(interrupt)))
        .await
        .unwrap();

    let reply = next(&client).await;
    assert_eq!(reply.unique(), stuck.unique());
    assert_eq!(reply.errno(), Some(Errno::EINTR));

    assert_silent(&client).await;
    assert_eq!(handle.state(), SessionState::Mounted);

    drop(client);
    run.await.unwrap().unwrap();
}

fn interrupt(client: &Client, unique: u64) -> Request {
    client.request(Ino::NULL, Operation::Interrupt(proto::InterruptIn { unique }))
}

#[tokio::test]
async fn interrupts_reach_requests_queued_behind_a_stuck_one() {
    let (client, session) = connect(MemFs::default(), SessionConfig::default()).await;
    let dispatcher = session.dispatcher().clone();
    let run = tokio::spawn(session.run());

    let (_, open) = create(&client, "file").await;

    let fsync = Operation::Fsync(proto::FsyncIn {
        fh: open.fh,
        ..Zeroable::zeroed()
    });

    let stuck = client.request(Ino::NULL, fsync);
    let queued = client.request(Ino::NULL, write(open.fh, 0, b"a"));
    let last = client.request(Ino::NULL, write(open.fh, 1, b"b"));

    for request in [&stuck, &queued, &last] {
        client.send(request).await.unwrap();
    }

    client.send(&interrupt(&client, queued.unique())).await.unwrap();

    let reply = next(&client).await;
    assert_eq!(reply.unique(), queued.unique());
    assert_eq!(reply.errno(), Some(Errno::EINTR));

    // Still behind the stuck request
    assert_silent(&client).await;

    client.send(&interrupt(&client, stuck.unique())).await.unwrap();

    let replies = collect(&client, 2).await;
    assert_eq!(replies[&stuck.unique()].errno(), Some(Errno::EINTR));
    assert_eq!(replies[&last.unique()].errno(), None);
    assert_eq!(*dispatcher.fs().journal.lock().unwrap(), [1]);

    drop(client);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn saturated_workers_do_not_block_unmount() {
    let config = SessionConfig::default()
        .workers(NonZeroUsize::new(1).unwrap())
        .grace_period(Duration::from_millis(100));

    let (client, session) = connect(MemFs::default(), config).await;
    let handle = session.handle();
    let run = tokio::spawn(session.run());

    let stuck = client.request(Ino::ROOT, lookup(STUCK));
    client.send(&stuck).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiting = client.request(Ino::ROOT, Operation::Statfs);
    client.send(&waiting).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.unmount();

    tokio::time::timeout(Duration::from_secs(3), run)
        .await
        .expect("session ignored the unmount")
        .unwrap()
        .unwrap();

    assert_eq!(handle.state(), SessionState::Unmounted);

    let replies = collect(&client, 2).await;
    assert_eq!(replies[&stuck.unique()].errno(), Some(Errno::EINTR));
    assert_eq!(replies[&waiting.unique()].errno(), Some(Errno::EINTR));
}

#[tokio::test]
async fn saturated_workers_do_not_block_interrupts() {
    let config = SessionConfig::default()
        .workers(NonZeroUsize::new(1).unwrap())
        .grace_period(Duration::from_millis(100));

    let (client, session) = connect(MemFs::default(), config).await;
    let run = tokio::spawn(session.run());

    let stuck = client.request(Ino::ROOT, lookup(STUCK));
    client.send(&stuck).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiting = client.request(Ino::ROOT, Operation::Statfs);
    client.send(&waiting).await.unwrap();
    client.send(&interrupt(&client, stuck.unique())).await.unwrap();

    let replies = collect(&client, 2).await;
    assert_eq!(replies[&stuck.unique()].errno(), Some(Errno::EINTR));

    // The freed worker picks up the waiting request
    assert_eq!(replies[&waiting.unique()].errno(), None);

    drop(client);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn unmount_waits_for_in_flight_requests() {
    let config = SessionConfig::default().grace_period(PATIENCE);
    let (client, session) = connect(MemFs::default(), config).await;
    let dispatcher = session.dispatcher().clone();
    let handle = session.handle();
    let run = tokio::spawn(session.run());

    let slow = client.request(Ino::ROOT, lookup(SLOW));
    client.send(&slow).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.unmount();

    let reply = next(&client).await;
    assert_eq!(reply.unique(), slow.unique());
    assert_eq!(reply.errno(), Some(Errno::ENOENT));

    run.await.unwrap().unwrap();
    assert_eq!(handle.state(), SessionState::Unmounted);
    assert!(dispatcher.fs().is_destroyed());
    assert!(client.receive().await.unwrap().is_none());
}

#[tokio::test]
async fn requests_outliving_the_grace_period_are_abandoned() {
    let config = SessionConfig::default().grace_period(Duration::from_millis(100));
    let (client, session) = connect(MemFs::default(), config).await;
    let handle = session.handle();
    let run = tokio::spawn(session.run());

    let stuck = client.request(Ino::ROOT, lookup(STUCK));
    client.send(&stuck).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.unmount();

    let reply = next(&client).await;
    assert_eq!(reply.unique(), stuck.unique());
    assert_eq!(reply.errno(), Some(Errno::EINTR));

    run.await.unwrap().unwrap();
    assert_eq!(handle.state(), SessionState::Unmounted);
}

#[tokio::test]
async fn closed_channel_ends_the_session_cleanly() {
    let (client, session) = connect(MemFs::default(), SessionConfig::default()).await;
    let dispatcher = session.dispatcher().clone();
    let handle = session.handle();
    let run = tokio::spawn(session.run());

    drop(client);

    run.await.unwrap().unwrap();
    handle.wait_for(SessionState::Unmounted).await;
    assert!(dispatcher.fs().is_destroyed());
}

#[tokio::test]
async fn destroy_is_acknowledged() {
    let (client, session) = connect(MemFs::default(), SessionConfig::default()).await;
    let dispatcher = session.dispatcher().clone();
    let run = tokio::spawn(session.run());

    let destroy = client.request(Ino::NULL, Operation::Destroy);
    client.send(&destroy).await.unwrap();

    let reply = next(&client).await;
    assert_eq!(reply.unique(), destroy.unique());
    assert_eq!(reply.errno(), None);
    assert!(reply.body.is_empty());

    run.await.unwrap().unwrap();
    assert!(dispatcher.fs().is_destroyed());
    assert!(client.receive().await.unwrap().is_none());
}

//! Session lifecycle.
//!
//! A session moves through `Unmounted → Mounting → Mounted → Unmounting → Unmounted`. The
//! [`Start`] half performs the `INIT` handshake; [`Session::run()`] then reads requests until the
//! kernel sends `DESTROY`, the channel closes, or [`SessionHandle::unmount()`] is called.

use bytemuck::{bytes_of, Zeroable};
use std::{
    cmp::Ordering,
    collections::HashSet,
    io,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{
    sync::{watch, Notify},
    task::JoinSet,
};

use crate::{
    channel::Channel,
    config::SessionConfig,
    dispatch::Dispatcher,
    fs::Filesystem,
    mount::Mount,
    proto::{self, InitFlags},
    reply::{Reply, ReplyBody},
    request::{DecodeError, Operation, Request},
    util::DumbFd,
    Errno, FuseError, FuseResult, ProtocolError,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
}

/// A kernel channel that has not completed the handshake yet.
pub struct Start {
    session_fd: DumbFd,
    mount: Option<Mount>,
    shared: Arc<Shared>,
}

pub struct Session<F: Filesystem> {
    channel: Arc<Channel>,
    dispatcher: Arc<Dispatcher<F>>,
    config: SessionConfig,
    mount: Option<Mount>,
    shared: Arc<Shared>,
    proto_minor: u32,
}

/// Observes and controls a session from elsewhere.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

struct Shared {
    state: watch::Sender<SessionState>,
    unmount: Notify,
}

enum Shutdown {
    Destroy(u64),
    Unmount,
    Closed,
    Failed(FuseError),
}

type InFlight = Arc<Mutex<HashSet<u64>>>;

impl Start {
    pub(crate) fn new(session_fd: DumbFd, mount: Option<Mount>) -> Self {
        let (state, _) = watch::channel(SessionState::Unmounted);

        Start {
            session_fd,
            mount,
            shared: Arc::new(Shared {
                state,
                unmount: Notify::new(),
            }),
        }
    }

    /// Serves an already open channel, such as one end of a socket pair, with nothing to
    /// unmount afterwards.
    pub(crate) fn from_fd(session_fd: DumbFd) -> Self {
        Start::new(session_fd, None)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub async fn start<F: Filesystem>(self, fs: F, config: SessionConfig) -> FuseResult<Session<F>> {
        let Start {
            session_fd,
            mount,
            shared,
        } = self;

        shared.set(SessionState::Mounting);

        let handshake = async {
            let channel = Channel::from_fd(session_fd)?;
            let dispatcher = Dispatcher::with_workers(fs, config.worker_count());
            let proto_minor = handshake(&channel, &dispatcher, &config).await?;

            FuseResult::Ok((channel, dispatcher, proto_minor))
        };

        match handshake.await {
            Ok((channel, dispatcher, proto_minor)) => {
                shared.set(SessionState::Mounted);

                Ok(Session {
                    channel: Arc::new(channel),
                    dispatcher: Arc::new(dispatcher),
                    config,
                    mount,
                    shared,
                    proto_minor,
                })
            }

            Err(error) => {
                if let Some(mount) = mount {
                    if let Err(error) = mount.unmount() {
                        log::warn!("Failed to unmount after handshake failure: {}", error);
                    }
                }

                shared.set(SessionState::Unmounted);
                Err(error)
            }
        }
    }
}

impl<F: Filesystem> Session<F> {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn proto_minor(&self) -> u32 {
        self.proto_minor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<F>> {
        &self.dispatcher
    }

    /// Serves requests until the session ends.
    ///
    /// Returns `Ok(())` whenever the session ends through an unmount, including one performed
    /// by the kernel or another process. Only I/O failures on the channel are errors.
    pub async fn run(self) -> FuseResult<()> {
        let in_flight = InFlight::default();
        let mut tasks = JoinSet::new();

        let shutdown = self.serve(&mut tasks, &in_flight).await;
        self.shared.set(SessionState::Unmounting);

        let result = match shutdown {
            Shutdown::Destroy(unique) => {
                log::info!("Kernel requested session shutdown");
                self.drain(&mut tasks, &in_flight).await;

                let reply = Reply::ok(unique, ReplyBody::Empty);
                match send(&self.channel, &reply).await {
                    Ok(()) | Err(FuseError::ChannelClosed) => Ok(()),
                    Err(error) => Err(error),
                }
            }

            Shutdown::Unmount => {
                log::info!("Unmount requested");
                self.drain(&mut tasks, &in_flight).await;
                Ok(())
            }

            Shutdown::Closed => {
                log::info!("Kernel channel closed");
                abort(&mut tasks).await;
                Ok(())
            }

            Shutdown::Failed(error) => {
                log::error!("Session failed: {}", error);
                abort(&mut tasks).await;
                Err(error)
            }
        };

        self.dispatcher.teardown().await;

        let Session {
            channel,
            mount,
            shared,
            ..
        } = self;

        // The connection must be gone before unmounting, or the helper may block on us
        drop(channel);

        if let Some(mount) = mount {
            match tokio::task::spawn_blocking(move || mount.unmount()).await {
                Ok(Ok(())) => (),
                Ok(Err(error)) => log::warn!("Unmount failed: {}", error),
                Err(error) => log::warn!("Unmount task failed: {}", error),
            }
        }

        shared.set(SessionState::Unmounted);
        result
    }

    async fn serve(&self, tasks: &mut JoinSet<FuseResult<()>>, in_flight: &InFlight) -> Shutdown {
        let mut buffer = vec![0; self.config.buffer_size()];

        loop {
            let received = tokio::select! {
                biased;

                () = self.shared.unmount.notified() => return Shutdown::Unmount,

                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(Err(FuseError::ChannelClosed)) => return Shutdown::Closed,
                        Ok(Err(error)) => return Shutdown::Failed(error),
                        Ok(Ok(())) => (),
                        Err(error) => log::error!("Worker task failed: {}", error),
                    }

                    continue;
                }

                received = self.channel.receive(&mut buffer) => received,
            };

            let len = match received {
                Ok(len) => len,
                Err(FuseError::ChannelClosed) => return Shutdown::Closed,
                Err(error) => return Shutdown::Failed(error),
            };

            let request = match Request::decode(&buffer[..len]) {
                Ok(request) => request,

                Err(DecodeError {
                    unique: Some(unique),
                    error,
                }) => {
                    log::error!("Bad request #{}: {}", unique, error);
                    match send(&self.channel, &Reply::fail(unique, Errno::EIO)).await {
                        Ok(()) => continue,
                        Err(FuseError::ChannelClosed) => return Shutdown::Closed,
                        Err(error) => return Shutdown::Failed(error),
                    }
                }

                Err(DecodeError {
                    unique: None,
                    error,
                }) => {
                    log::error!("Discarding unidentifiable frame of {} bytes: {}", len, error);
                    continue;
                }
            };

            log::debug!("{}", request);
            match request.operation() {
                Operation::Destroy => return Shutdown::Destroy(request.unique()),

                Operation::Interrupt(interrupt) => {
                    self.dispatcher.interrupt(interrupt.unique);
                    continue;
                }

                _ => (),
            }

            let unique = request.unique();
            let job = self.dispatcher.admit(request);

            let dispatcher = Arc::clone(&self.dispatcher);
            let channel = Arc::clone(&self.channel);
            let in_flight = Arc::clone(in_flight);

            lock(&in_flight).insert(unique);
            // Waits for a free worker inside, so the loop keeps reading interrupts and unmounts
            tasks.spawn(async move {
                let reply = dispatcher.serve(job).await;
                let result = send(&channel, &reply).await;

                lock(&in_flight).remove(&unique);
                result
            });
        }
    }

    /// Waits for in-flight work up to the grace period. Whatever is left is abandoned and
    /// answered with `EINTR`.
    async fn drain(&self, tasks: &mut JoinSet<FuseResult<()>>, in_flight: &InFlight) {
        let grace = self.config.grace();
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => (),
                    Ok(Err(error)) => log::warn!("Reply failed during shutdown: {}", error),
                    Err(error) => log::error!("Worker task failed: {}", error),
                }
            }
        })
        .await;

        if finished.is_ok() {
            return;
        }

        log::warn!(
            "{} requests still running after {:?}, abandoning them",
            tasks.len(),
            grace
        );

        abort(tasks).await;

        let abandoned: Vec<u64> = lock(in_flight).drain().collect();
        for unique in abandoned {
            if let Err(error) = send(&self.channel, &Reply::fail(unique, Errno::EINTR)).await {
                log::debug!("Could not answer abandoned request #{}: {}", unique, error);
                break;
            }
        }
    }
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Resolves once the session is in `state`.
    pub async fn wait_for(&self, state: SessionState) {
        let mut receiver = self.shared.state.subscribe();

        while *receiver.borrow_and_update() != state {
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    /// Asks the session to stop reading requests, finish in-flight work and unmount.
    pub fn unmount(&self) {
        self.shared.unmount.notify_one();
    }
}

impl Shared {
    fn set(&self, state: SessionState) {
        log::debug!("Session state: {:?}", state);
        self.state.send_replace(state);
    }
}

async fn handshake<F: Filesystem>(
    channel: &Channel,
    dispatcher: &Dispatcher<F>,
    config: &SessionConfig,
) -> FuseResult<u32> {
    let mut buffer = vec![0; config.buffer_size()];

    loop {
        let len = channel.receive(&mut buffer).await?;
        let request = match Request::decode(&buffer[..len]) {
            Ok(request) => request,
            Err(error) => {
                if let Some(unique) = error.unique {
                    send(channel, &Reply::fail(unique, Errno::EIO)).await?;
                }

                return Err(error.error.into());
            }
        };

        let unique = request.unique();
        let init = match request.operation() {
            Operation::Init(init) => *init,

            _ => {
                log::error!("First message from kernel is not Init, but {}", request);
                send(channel, &Reply::fail(unique, Errno::EIO)).await?;

                return Err(ProtocolError::NotInit(request.opcode()).into());
            }
        };

        let supported = match init.major.cmp(&proto::MAJOR_VERSION) {
            Ordering::Less => false,
            Ordering::Equal => init.minor >= proto::REQUIRED_MINOR_VERSION,

            Ordering::Greater => {
                // The kernel retries with our major version
                let major = bytes_of(&proto::MAJOR_VERSION).to_vec();
                send(channel, &Reply::ok(unique, ReplyBody::Data(major))).await?;

                continue;
            }
        };

        if !supported {
            log::error!(
                "Unsupported protocol {}.{}; this build requires \
                 {major}.{}..={major}.{} (or a greater version \
                 through compatibility)",
                init.major,
                init.minor,
                proto::REQUIRED_MINOR_VERSION,
                proto::TARGET_MINOR_VERSION,
                major = proto::MAJOR_VERSION
            );

            send(channel, &Reply::fail(unique, Errno::EPROTONOSUPPORT)).await?;
            return Err(ProtocolError::Version {
                major: init.major,
                minor: init.minor,
            }
            .into());
        }

        if let Err(error) = dispatcher.fs().init().await {
            log::error!("Filesystem init failed: {}", error);

            let errno = error.errno();
            send(channel, &Reply::fail(unique, errno)).await?;

            return Err(io::Error::from(errno).into());
        }

        let supported = InitFlags::ASYNC_READ
            | InitFlags::ATOMIC_O_TRUNC
            | InitFlags::BIG_WRITES
            | InitFlags::AUTO_INVAL_DATA
            | InitFlags::PARALLEL_DIROPS
            | InitFlags::MAX_PAGES;

        let flags = InitFlags::from_bits_truncate(init.flags) & supported;
        let minor = init.minor.min(proto::TARGET_MINOR_VERSION);

        let reply = proto::InitOut {
            major: proto::MAJOR_VERSION,
            minor,
            max_readahead: init.max_readahead,
            flags: flags.bits(),
            max_write: config.effective_max_write(),
            time_gran: 1,
            max_pages: config.max_pages(),
            ..Zeroable::zeroed()
        };

        send(channel, &Reply::ok(unique, ReplyBody::Init(reply))).await?;
        log::info!(
            "Handshake complete, protocol {}.{}, flags {:?}",
            proto::MAJOR_VERSION,
            minor,
            flags
        );

        break Ok(minor);
    }
}

async fn send(channel: &Channel, reply: &Reply) -> FuseResult<()> {
    match reply.frame() {
        Some(frame) => channel.send(&frame).await,
        None => Ok(()),
    }
}

async fn abort(tasks: &mut JoinSet<FuseResult<()>>) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
}

fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashSet<u64>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

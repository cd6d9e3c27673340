// Serves a read-only directory with a single greeting file in it.
//
// Unmounts on Ctrl-C or when unmounted from outside, exiting with status 0 either way.

use async_trait::async_trait;
use std::{
    ffi::{OsStr, OsString},
    path::Path,
    time::{Duration, SystemTime},
};

use fusebox::{
    config::SessionConfig,
    fs::Filesystem,
    io::{Attrs, Context, DirEntry, Entry, EntryType, Mode, OpenFlags, Opened},
    mount::{mount_sync, Options},
    nix::unistd::{getegid, geteuid},
    Errno, Ino, OpError, OpResult, Timestamp, Ttl,
};

use clap::{App, Arg};
use tokio::runtime::Runtime;

const GREETING: &[u8] = b"Hello, world!\n";
const FILE_NAME: &str = "hello";
const FILE_INO: Ino = Ino(2);

enum Node {
    Root,
    Greeting,
}

struct Hello {
    mounted_at: Timestamp,
}

impl Hello {
    fn attrs(&self, node: &Node) -> Attrs {
        let attrs = match node {
            Node::Root => Attrs::new(EntryType::Directory)
                .mode(Mode::from_bits_truncate(0o555))
                .links(2),

            Node::Greeting => Attrs::new(EntryType::File)
                .mode(Mode::from_bits_truncate(0o444))
                .size(GREETING.len() as u64),
        };

        let time = self.mounted_at;
        attrs.owner(geteuid(), getegid()).times(time, time, time)
    }

    fn ttl() -> Ttl {
        Duration::from_secs(1).into()
    }
}

#[async_trait]
impl Filesystem for Hello {
    type Inode = Node;
    type Handle = ();

    fn root(&self) -> Node {
        Node::Root
    }

    async fn lookup(&self, _ctx: Context, parent: &Node, name: &OsStr) -> OpResult<Entry<Node>> {
        match parent {
            Node::Root if name == FILE_NAME => Ok(Entry {
                ino: FILE_INO,
                attrs: self.attrs(&Node::Greeting),
                inode: Node::Greeting,
                entry_ttl: Self::ttl(),
                attr_ttl: Self::ttl(),
            }),

            Node::Root => Err(OpError::NotFound),
            Node::Greeting => Err(Errno::ENOTDIR.into()),
        }
    }

    async fn getattr(&self, _ctx: Context, _ino: Ino, inode: &Node) -> OpResult<(Attrs, Ttl)> {
        Ok((self.attrs(inode), Self::ttl()))
    }

    async fn open(&self, _ctx: Context, inode: &Node, flags: OpenFlags) -> OpResult<Opened<()>> {
        match inode {
            Node::Root => Err(Errno::EISDIR.into()),
            Node::Greeting if flags.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR) => {
                Err(Errno::EROFS.into())
            }

            Node::Greeting => Ok(Opened::new(()).keep_cache()),
        }
    }

    async fn read(
        &self,
        _ctx: Context,
        _inode: &Node,
        _handle: &(),
        offset: u64,
        size: u32,
    ) -> OpResult<Vec<u8>> {
        let start = (offset as usize).min(GREETING.len());
        let end = start.saturating_add(size as usize).min(GREETING.len());

        Ok(GREETING[start..end].to_vec())
    }

    async fn readdir(
        &self,
        _ctx: Context,
        inode: &Node,
        _handle: &(),
        offset: u64,
    ) -> OpResult<Vec<DirEntry>> {
        if let Node::Greeting = inode {
            return Err(Errno::ENOTDIR.into());
        }

        let entries = [
            (".", Ino::ROOT, EntryType::Directory),
            ("..", Ino::ROOT, EntryType::Directory),
            (FILE_NAME, FILE_INO, EntryType::File),
        ];

        Ok(entries
            .into_iter()
            .zip(1..)
            .skip(offset as usize)
            .map(|((name, ino, kind), offset)| DirEntry {
                ino,
                offset,
                kind,
                name: OsString::from(name),
            })
            .collect())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hello")
        .about("read-only FUSE filesystem with a single file")
        .arg(Arg::from_usage("[mount_options] -o <options>... 'See fuse(8)'").number_of_values(1))
        .arg(Arg::from_usage("<mountpoint> 'Filesystem mountpoint'"))
        .get_matches();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let start = {
        let mountpoint = Path::new(matches.value_of_os("mountpoint").unwrap());

        let mut options = Options::default();
        options
            .fs_name("hello")
            .push_key_value("subtype", "hello")
            .read_only()
            .extend(matches.values_of_os("mount_options").into_iter().flatten());

        mount_sync(mountpoint, &options)?
    };

    let hello = Hello {
        mounted_at: SystemTime::now().into(),
    };

    Runtime::new()?.block_on(async move {
        let handle = start.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.unmount();
            }
        });

        let session = start.start(hello, SessionConfig::default()).await?;
        session.run().await
    })?;

    Ok(())
}

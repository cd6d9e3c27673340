#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    ffi::{OsStr, OsString},
    future::Future,
    path::Path,
    process::Child,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::{Duration, SystemTime},
};

use fusebox::{
    fs::Filesystem,
    io::{Attrs, Context, DirEntry, Entry, EntryType, FsInfo, Mode, OpenFlags, Opened, SetAttrs},
    mount,
    nix::unistd::{getegid, geteuid},
    Errno, Ino, OpError, OpResult, Timestamp, Ttl,
};

/// Lookups of this name never complete.
pub const STUCK: &str = "stuck";

/// Lookups of this name take a while and then fail.
pub const SLOW: &str = "slow";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` until it holds, giving up after `timeout`.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    false
}

const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);
const MOUNT_POLL: Duration = Duration::from_millis(100);

/// Waits until `path` is mounted by `child`. Fails early if the child exits first.
pub fn wait_for_mount(child: &mut Child, path: &Path) -> Result<(), String> {
    let deadline = std::time::Instant::now() + MOUNT_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if let Some(status) = child.try_wait().map_err(|error| error.to_string())? {
            return Err(format!("exited before mounting: {}", status));
        }

        if mount::is_mounted(path).unwrap_or(false) {
            return Ok(());
        }

        std::thread::sleep(MOUNT_POLL);
    }

    Err(format!("{} was not mounted in time", path.display()))
}

/// Unmounts `path` and asserts that `child` then exits cleanly.
pub fn umount(child: &mut Child, path: &Path) {
    mount::unmount_sync(path).unwrap();

    let deadline = std::time::Instant::now() + MOUNT_TIMEOUT;
    while std::time::Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            assert_eq!(status.code(), Some(0), "unexpected exit: {}", status);
            return;
        }

        std::thread::sleep(MOUNT_POLL);
    }

    panic!("still running after {} was unmounted", path.display());
}

/// Best effort teardown for tests that failed halfway.
pub fn cleanup(child: &mut Child, path: &Path) {
    if mount::is_mounted(path).unwrap_or(false) {
        let _ = mount::unmount_sync(path);
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[derive(Default)]
pub struct MemFs {
    tree: Mutex<Tree>,
    slow_writes: bool,
    pub journal: Mutex<Vec<u64>>,
    pub forgotten: Mutex<Vec<Ino>>,
    pub destroyed: AtomicBool,
}

struct Tree {
    next_ino: u64,
    nodes: HashMap<Ino, Node>,
}

struct Node {
    kind: Kind,
    mode: Mode,
    created: Timestamp,
}

enum Kind {
    Directory(BTreeMap<OsString, Ino>),
    File(Vec<u8>),
}

impl MemFs {
    /// Writes sleep for longer the lower their offset is.
    pub fn with_slow_writes() -> Self {
        MemFs {
            slow_writes: true,
            ..Default::default()
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn entry(&self, tree: &Tree, ino: Ino) -> OpResult<Entry<Ino>> {
        let node = tree.nodes.get(&ino).ok_or(OpError::NotFound)?;

        Ok(Entry {
            ino,
            inode: ino,
            attrs: node.attrs(),
            entry_ttl: Ttl::NULL,
            attr_ttl: Ttl::NULL,
        })
    }

    fn insert(&self, parent: Ino, name: &OsStr, kind: Kind, mode: Mode) -> OpResult<Entry<Ino>> {
        let mut tree = self.tree.lock().unwrap();
        let ino = Ino(tree.next_ino);

        match &mut tree.nodes.get_mut(&parent).ok_or(OpError::NotFound)?.kind {
            Kind::Directory(children) if children.contains_key(name) => {
                return Err(Errno::EEXIST.into())
            }

            Kind::Directory(children) => {
                children.insert(name.to_owned(), ino);
            }

            Kind::File(_) => return Err(Errno::ENOTDIR.into()),
        }

        tree.next_ino += 1;
        tree.nodes.insert(
            ino,
            Node {
                kind,
                mode,
                created: SystemTime::now().into(),
            },
        );

        self.entry(&tree, ino)
    }
}

impl Default for Tree {
    fn default() -> Self {
        let root = Node {
            kind: Kind::Directory(BTreeMap::new()),
            mode: Mode::from_bits_truncate(0o755),
            created: SystemTime::now().into(),
        };

        Tree {
            next_ino: 2,
            nodes: std::iter::once((Ino::ROOT, root)).collect(),
        }
    }
}

impl Node {
    fn attrs(&self) -> Attrs {
        let (kind, size) = match &self.kind {
            Kind::Directory(_) => (EntryType::Directory, 0),
            Kind::File(data) => (EntryType::File, data.len() as u64),
        };

        Attrs::new(kind)
            .mode(self.mode)
            .size(size)
            .owner(geteuid(), getegid())
            .times(self.created, self.created, self.created)
    }
}

#[async_trait]
impl Filesystem for MemFs {
    type Inode = Ino;
    type Handle = ();

    fn root(&self) -> Self::Inode {
        Ino::ROOT
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }

    async fn lookup(&self, _ctx: Context, parent: &Ino, name: &OsStr) -> OpResult<Entry<Ino>> {
        match name.to_str() {
            Some(STUCK) => futures_util::future::pending().await,

            Some(SLOW) => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Err(OpError::NotFound)
            }

            _ => {
                let tree = self.tree.lock().unwrap();
                let child = match &tree.nodes.get(parent).ok_or(OpError::NotFound)?.kind {
                    Kind::Directory(children) => *children.get(name).ok_or(OpError::NotFound)?,
                    Kind::File(_) => return Err(Errno::ENOTDIR.into()),
                };

                self.entry(&tree, child)
            }
        }
    }

    async fn forget(&self, ino: Ino, _inode: &Ino) {
        self.forgotten.lock().unwrap().push(ino);
    }

    async fn getattr(&self, _ctx: Context, _ino: Ino, inode: &Ino) -> OpResult<(Attrs, Ttl)> {
        let tree = self.tree.lock().unwrap();
        let node = tree.nodes.get(inode).ok_or(OpError::NotFound)?;

        Ok((node.attrs(), Ttl::NULL))
    }

    async fn setattr(
        &self,
        _ctx: Context,
        _ino: Ino,
        inode: &Ino,
        changes: SetAttrs,
    ) -> OpResult<(Attrs, Ttl)> {
        let mut tree = self.tree.lock().unwrap();
        let node = tree.nodes.get_mut(inode).ok_or(OpError::NotFound)?;

        if let Some(mode) = changes.mode {
            node.mode = mode;
        }

        if let Some(size) = changes.size {
            match &mut node.kind {
                Kind::File(data) => data.resize(size as usize, 0),
                Kind::Directory(_) => return Err(Errno::EISDIR.into()),
            }
        }

        Ok((node.attrs(), Ttl::NULL))
    }

    async fn mkdir(
        &self,
        _ctx: Context,
        parent: &Ino,
        name: &OsStr,
        mode: Mode,
    ) -> OpResult<Entry<Ino>> {
        self.insert(*parent, name, Kind::Directory(BTreeMap::new()), mode)
    }

    async fn create(
        &self,
        _ctx: Context,
        parent: &Ino,
        name: &OsStr,
        mode: Mode,
        _flags: OpenFlags,
    ) -> OpResult<(Entry<Ino>, Opened<()>)> {
        let entry = self.insert(*parent, name, Kind::File(Vec::new()), mode)?;
        Ok((entry, Opened::default()))
    }

    async fn unlink(&self, _ctx: Context, parent: &Ino, name: &OsStr) -> OpResult<()> {
        let mut tree = self.tree.lock().unwrap();
        match &mut tree.nodes.get_mut(parent).ok_or(OpError::NotFound)?.kind {
            Kind::Directory(children) => {
                children.remove(name).ok_or(OpError::NotFound)?;
                Ok(())
            }

            Kind::File(_) => Err(Errno::ENOTDIR.into()),
        }
    }

    async fn rmdir(&self, ctx: Context, parent: &Ino, name: &OsStr) -> OpResult<()> {
        self.unlink(ctx, parent, name).await
    }

    async fn read(
        &self,
        _ctx: Context,
        inode: &Ino,
        _handle: &(),
        offset: u64,
        size: u32,
    ) -> OpResult<Vec<u8>> {
        let tree = self.tree.lock().unwrap();
        match &tree.nodes.get(inode).ok_or(OpError::NotFound)?.kind {
            Kind::File(data) => Ok(data
                .iter()
                .skip(offset as usize)
                .take(size as usize)
                .copied()
                .collect()),

            Kind::Directory(_) => Err(Errno::EISDIR.into()),
        }
    }

    async fn write(
        &self,
        _ctx: Context,
        inode: &Ino,
        _handle: &(),
        offset: u64,
        data: &[u8],
    ) -> OpResult<u32> {
        if self.slow_writes {
            let delay = 50u64.saturating_sub(offset * 5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut tree = self.tree.lock().unwrap();
        match &mut tree.nodes.get_mut(inode).ok_or(OpError::NotFound)?.kind {
            Kind::File(contents) => {
                let end = offset as usize + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }

                contents[offset as usize..end].copy_from_slice(data);
            }

            Kind::Directory(_) => return Err(Errno::EISDIR.into()),
        }

        self.journal.lock().unwrap().push(offset);
        Ok(data.len() as u32)
    }

    /// Never completes.
    async fn fsync(&self, _ctx: Context, _inode: &Ino, _handle: &(), _datasync: bool) -> OpResult<()> {
        futures_util::future::pending().await
    }

    async fn readdir(
        &self,
        _ctx: Context,
        inode: &Ino,
        _handle: &(),
        offset: u64,
    ) -> OpResult<Vec<DirEntry>> {
        let tree = self.tree.lock().unwrap();
        let children = match &tree.nodes.get(inode).ok_or(OpError::NotFound)?.kind {
            Kind::Directory(children) => children,
            Kind::File(_) => return Err(Errno::ENOTDIR.into()),
        };

        let dots = [(".", *inode), ("..", Ino::ROOT)]
            .into_iter()
            .map(|(name, ino)| (OsString::from(name), ino, EntryType::Directory));

        let children = children.iter().map(|(name, ino)| {
            let kind = match tree.nodes.get(ino).map(|node| &node.kind) {
                Some(Kind::Directory(_)) => EntryType::Directory,
                _ => EntryType::File,
            };

            (name.clone(), *ino, kind)
        });

        Ok(dots
            .chain(children)
            .zip(1..)
            .skip(offset as usize)
            .map(|((name, ino, kind), offset)| DirEntry {
                ino,
                offset,
                kind,
                name,
            })
            .collect())
    }

    async fn statfs(&self, _ctx: Context, _inode: &Ino) -> OpResult<FsInfo> {
        let files = self.tree.lock().unwrap().nodes.len() as u64;

        Ok(FsInfo::default()
            .blocks(4096, 1024, 1024, 1024)
            .inodes(files + 1024, 1024)
            .max_filename(255))
    }
}

//! Request routing.
//!
//! The [`Dispatcher`] owns the inode/handle table and turns each decoded request into exactly
//! one [`Reply`]. Ordering and interruption are arranged in two steps: [`Dispatcher::admit()`]
//! runs on the read loop, in arrival order, and [`Dispatcher::serve()`] runs on a worker.

use futures_util::FutureExt;
use std::{
    collections::{HashMap, VecDeque},
    os::unix::ffi::OsStringExt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{oneshot, Semaphore};

use crate::{
    fs::Filesystem,
    io::{kind_of, AccessFlags, Context, Entry, FsyncFlags, Mode, OpenFlags, SetAttrs},
    proto,
    reply::{make_attr, make_entry, DirBuffer, Reply, ReplyBody},
    request::{Operation, Request},
    table::{Released, Table},
    Errno, Ino, OpError, OpResult,
};

pub struct Dispatcher<F: Filesystem> {
    fs: Arc<F>,
    table: Table<F::Inode, F::Handle>,
    queue: HandleQueue,
    workers: Semaphore,
    interrupts: Mutex<Interrupts>,
}

/// A request that has been admitted and may be served on any worker.
pub struct Job {
    request: Request,
    turn: Option<Turn>,
    interrupt: oneshot::Receiver<()>,
}

#[derive(Default)]
struct Interrupts {
    pending: HashMap<u64, oneshot::Sender<()>>,

    // Interrupts that overtook the request they target
    early: VecDeque<u64>,
}

const EARLY_INTERRUPTS: usize = 64;

/// Keeps requests against the same handle in submission order.
#[derive(Default)]
pub struct HandleQueue {
    tails: Mutex<HashMap<u64, oneshot::Receiver<()>>>,
}

pub struct Turn {
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl<F: Filesystem> Dispatcher<F> {
    /// A dispatcher that serves any number of requests at the same time.
    pub fn new(fs: F) -> Self {
        Self::with_workers(fs, Semaphore::MAX_PERMITS)
    }

    /// A dispatcher that runs at most `workers` filesystem operations at the same time. Requests
    /// beyond that wait, but can still be interrupted.
    pub fn with_workers(fs: F, workers: usize) -> Self {
        let table = Table::new(fs.root());

        Dispatcher {
            fs: Arc::new(fs),
            table,
            queue: HandleQueue::default(),
            workers: Semaphore::new(workers.clamp(1, Semaphore::MAX_PERMITS)),
            interrupts: Mutex::default(),
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn table(&self) -> &Table<F::Inode, F::Handle> {
        &self.table
    }

    /// Must be called in the order requests were read.
    pub fn admit(&self, request: Request) -> Job {
        let closes = matches!(
            request.operation(),
            Operation::Release(_) | Operation::Releasedir(_)
        );

        // Requests on unknown handles fail right away and must not leave a queue behind
        let turn = request
            .handle()
            .filter(|fh| self.table.handle(*fh).is_ok())
            .map(|fh| self.queue.enqueue(fh, closes));

        let unique = request.unique();
        let (cancel, interrupt) = oneshot::channel();

        let mut interrupts = self.interrupts();
        match interrupts.early.iter().position(|early| *early == unique) {
            Some(position) => {
                interrupts.early.remove(position);
                let _ = cancel.send(());
            }

            None => {
                interrupts.pending.insert(unique, cancel);
            }
        }

        Job {
            request,
            turn,
            interrupt,
        }
    }

    /// Waits for the job's turn and serves it. Always yields a reply, even if the filesystem
    /// panics or the kernel interrupts the request.
    pub async fn serve(&self, job: Job) -> Reply {
        let Job {
            request,
            turn,
            interrupt,
        } = job;

        let unique = request.unique();
        let header = *request.header();

        let work = async {
            let _turn = match turn {
                Some(mut turn) => {
                    turn.ready().await;
                    Some(turn)
                }

                None => None,
            };

            // Ok unless the semaphore is closed, which never happens
            let _permit = self.workers.acquire().await.ok();
            AssertUnwindSafe(self.dispatch(request)).catch_unwind().await
        };

        let reply = tokio::select! {
            biased;

            result = work => match result {
                Ok(reply) => reply,
                Err(_) => {
                    log::error!("Filesystem panicked while serving {}", header);
                    Reply::fail(unique, Errno::EIO)
                }
            },

            () = interrupted(interrupt) => {
                log::debug!("Request {} interrupted", header);
                Reply::fail(unique, Errno::EINTR)
            }
        };

        self.interrupts().pending.remove(&unique);
        reply
    }

    pub async fn dispatch(&self, request: Request) -> Reply {
        let unique = request.unique();
        let header = *request.header();

        match self.route(request).await {
            Ok(body) => Reply::ok(unique, body),

            Err(error) => {
                let errno = error.errno();
                match error {
                    OpError::Io(_) | OpError::StaleHandle(_) => {
                        log::warn!("{} failed: {}", header, error)
                    }

                    _ => log::debug!("{} failed: {}", header, error),
                }

                Reply::fail(unique, errno)
            }
        }
    }

    pub fn interrupt(&self, unique: u64) {
        let mut interrupts = self.interrupts();
        match interrupts.pending.remove(&unique) {
            Some(cancel) => {
                let _ = cancel.send(());
            }

            // Either already answered or not read yet
            None => {
                if interrupts.early.len() == EARLY_INTERRUPTS {
                    interrupts.early.pop_front();
                }

                interrupts.early.push_back(unique);
            }
        }
    }

    /// Drops all remaining kernel references and runs the filesystem's destroy hook.
    pub async fn teardown(&self) {
        let released = self.table.force_release();
        if !released.handles.is_empty() {
            log::warn!(
                "Dropping {} handles left open at unmount",
                released.handles.len()
            );
        }

        for (ino, state) in released.inodes {
            self.fs.forget(ino, &state).await;
        }

        self.fs.destroy().await;
    }

    async fn route(&self, request: Request) -> OpResult<ReplyBody> {
        use Operation::*;

        let ino = request.ino();
        let ctx = request.context();

        let body = match request.into_operation() {
            Lookup { name } => {
                let parent = self.inode(ino)?;
                let entry = self.fs.lookup(ctx, &parent, &name).await?;
                ReplyBody::Entry(self.remember(entry))
            }

            Forget(forget) => {
                self.forget(ino, forget.nlookup).await;
                ReplyBody::None
            }

            BatchForget { forgets } => {
                for forget in forgets {
                    self.forget(Ino(forget.ino), forget.nlookup).await;
                }

                ReplyBody::None
            }

            Getattr(_) => {
                let inode = self.inode(ino)?;
                let (attrs, ttl) = self.fs.getattr(ctx, ino, &inode).await?;
                ReplyBody::Attr(make_attr(ino, &attrs, ttl))
            }

            Setattr(setattr) => {
                let inode = self.inode(ino)?;
                let changes = SetAttrs::from_wire(&setattr);
                let (attrs, ttl) = self.fs.setattr(ctx, ino, &inode, changes).await?;
                ReplyBody::Attr(make_attr(ino, &attrs, ttl))
            }

            Readlink => {
                let inode = self.inode(ino)?;
                let target = self.fs.readlink(ctx, &inode).await?;
                ReplyBody::Data(target.into_vec())
            }

            Symlink { name, target } => {
                let parent = self.inode(ino)?;
                let entry = self.fs.symlink(ctx, &parent, &name, &target).await?;
                ReplyBody::Entry(self.remember(entry))
            }

            Mknod { prefix, name } => {
                let parent = self.inode(ino)?;
                let kind = kind_of(prefix.mode).ok_or(Errno::EINVAL)?;
                let mode = Mode::from_bits_truncate(prefix.mode);

                let entry = self
                    .fs
                    .mknod(ctx, &parent, &name, kind, mode, prefix.device)
                    .await?;

                ReplyBody::Entry(self.remember(entry))
            }

            Mkdir { prefix, name } => {
                let parent = self.inode(ino)?;
                let mode = Mode::from_bits_truncate(prefix.mode);
                let entry = self.fs.mkdir(ctx, &parent, &name, mode).await?;
                ReplyBody::Entry(self.remember(entry))
            }

            Unlink { name } => {
                let parent = self.inode(ino)?;
                self.fs.unlink(ctx, &parent, &name).await?;
                ReplyBody::Empty
            }

            Rmdir { name } => {
                let parent = self.inode(ino)?;
                self.fs.rmdir(ctx, &parent, &name).await?;
                ReplyBody::Empty
            }

            Rename { prefix, old, new } => {
                let parent = self.inode(ino)?;
                let new_parent = self.inode(Ino(prefix.new_dir))?;

                self.fs
                    .rename(ctx, &parent, &old, &new_parent, &new)
                    .await?;

                ReplyBody::Empty
            }

            Link { prefix, name } => {
                let inode = self.inode(Ino(prefix.old_ino))?;
                let new_parent = self.inode(ino)?;
                let entry = self.fs.link(ctx, &inode, &new_parent, &name).await?;
                ReplyBody::Entry(self.remember(entry))
            }

            Open(open) => {
                let inode = self.inode(ino)?;
                let flags = OpenFlags::from_bits_truncate(open.flags as i32);
                let opened = self.fs.open(ctx, &inode, flags).await?;

                let fh = self.table.open_handle(ino, open.flags, opened.handle)?;
                ReplyBody::Open(proto::OpenOut {
                    fh,
                    open_flags: opened.flags.bits(),
                    padding: 0,
                })
            }

            Read(read) => {
                let handle = self.table.handle(read.fh)?;
                let inode = self.inode(handle.ino)?;

                let mut data = self
                    .fs
                    .read(ctx, &inode, &handle.state, read.offset, read.size)
                    .await?;

                data.truncate(read.size as usize);
                ReplyBody::Data(data)
            }

            Write { prefix, data } => {
                let handle = self.table.handle(prefix.fh)?;
                let inode = self.inode(handle.ino)?;

                let size = self
                    .fs
                    .write(ctx, &inode, &handle.state, prefix.offset, &data)
                    .await?;

                ReplyBody::Write(proto::WriteOut { size, padding: 0 })
            }

            Statfs => {
                let inode = self.inode(ino)?;
                let info = self.fs.statfs(ctx, &inode).await?;
                ReplyBody::Statfs(info.into())
            }

            Release(release) => {
                let flags = proto::ReleaseFlags::from_bits_truncate(release.release_flags);
                let flushed = if flags.contains(proto::ReleaseFlags::FLUSH) {
                    self.flush(ctx, release.fh).await
                } else {
                    Ok(())
                };

                // The handle goes away even if the final flush failed
                self.close(ctx, release.fh, false).await?;
                flushed?;

                ReplyBody::Empty
            }

            Fsync(fsync) => {
                let handle = self.table.handle(fsync.fh)?;
                let inode = self.inode(handle.ino)?;
                let datasync = FsyncFlags::from_bits_truncate(fsync.fsync_flags)
                    .contains(FsyncFlags::FDATASYNC);

                self.fs
                    .fsync(ctx, &inode, &handle.state, datasync)
                    .await?;

                ReplyBody::Empty
            }

            Flush(flush) => {
                self.flush(ctx, flush.fh).await?;
                ReplyBody::Empty
            }

            Init(_) => {
                log::error!("Received a second Init after the handshake");
                return Err(OpError::Errno(Errno::EPROTO));
            }

            Opendir(open) => {
                let inode = self.inode(ino)?;
                let flags = OpenFlags::from_bits_truncate(open.flags as i32);
                let opened = self.fs.opendir(ctx, &inode, flags).await?;

                let fh = self.table.open_handle(ino, open.flags, opened.handle)?;

                ReplyBody::Open(proto::OpenOut {
                    fh,
                    open_flags: opened.flags.bits(),
                    padding: 0,
                })
            }

            Readdir(read) => {
                let handle = self.table.handle(read.fh)?;
                let inode = self.inode(handle.ino)?;

                let entries = self
                    .fs
                    .readdir(ctx, &inode, &handle.state, read.offset)
                    .await?;

                let mut buffer = DirBuffer::new(read.size as usize);
                for entry in &entries {
                    if !buffer.push(entry) {
                        break;
                    }
                }

                if buffer.is_empty() && !entries.is_empty() {
                    log::error!("Buffer for readdir of handle {} is too small", read.fh);
                    return Err(OpError::Errno(Errno::ENOBUFS));
                }

                if let Some(offset) = buffer.last_offset() {
                    self.table.set_cursor(read.fh, offset)?;
                }

                ReplyBody::Data(buffer.into_bytes())
            }

            Releasedir(release) => {
                self.close(ctx, release.fh, true).await?;
                ReplyBody::Empty
            }

            Fsyncdir(fsync) => {
                let handle = self.table.handle(fsync.fh)?;
                let inode = self.inode(handle.ino)?;
                let datasync = FsyncFlags::from_bits_truncate(fsync.fsync_flags)
                    .contains(FsyncFlags::FDATASYNC);

                self.fs
                    .fsyncdir(ctx, &inode, &handle.state, datasync)
                    .await?;

                ReplyBody::Empty
            }

            Access(access) => {
                let inode = self.inode(ino)?;
                let mask = AccessFlags::from_bits_truncate(access.mask as i32);
                self.fs.access(ctx, &inode, mask).await?;
                ReplyBody::Empty
            }

            Create { prefix, name } => {
                let parent = self.inode(ino)?;
                let mode = Mode::from_bits_truncate(prefix.mode);
                let flags = OpenFlags::from_bits_truncate(prefix.flags as i32);

                let (entry, opened) = self.fs.create(ctx, &parent, &name, mode, flags).await?;
                let created = entry.ino;
                let entry = self.remember(entry);

                let fh = self
                    .table
                    .open_handle(created, prefix.flags, opened.handle)?;

                let open = proto::OpenOut {
                    fh,
                    open_flags: opened.flags.bits(),
                    padding: 0,
                };

                ReplyBody::Create(entry, open)
            }

            Interrupt(interrupt) => {
                self.interrupt(interrupt.unique);
                ReplyBody::None
            }

            Destroy => ReplyBody::Empty,

            Unsupported(opcode) => {
                log::debug!("Unsupported operation {}", opcode);
                return Err(OpError::Unimplemented);
            }
        };

        Ok(body)
    }

    fn interrupts(&self) -> MutexGuard<'_, Interrupts> {
        self.interrupts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inode(&self, ino: Ino) -> OpResult<Arc<F::Inode>> {
        self.table.get(ino).ok_or(OpError::NotFound)
    }

    fn remember(&self, entry: Entry<F::Inode>) -> proto::EntryOut {
        let Entry {
            ino,
            inode,
            attrs,
            entry_ttl,
            attr_ttl,
        } = entry;

        self.table.lookup_or_create(ino, || inode);
        make_entry(ino, &attrs, entry_ttl, attr_ttl)
    }

    async fn flush(&self, ctx: Context, fh: u64) -> OpResult<()> {
        let handle = self.table.handle(fh)?;
        let inode = self.inode(handle.ino)?;
        self.fs.flush(ctx, &inode, &handle.state).await
    }

    async fn close(&self, ctx: Context, fh: u64, is_dir: bool) -> OpResult<()> {
        let closed = self.table.close_handle(fh)?;
        let ino = closed.handle.ino;

        let inode = match &closed.removed {
            Some(state) => Arc::clone(state),
            None => self.inode(ino)?,
        };

        let result = if is_dir {
            self.fs.releasedir(ctx, &inode, &closed.handle.state).await
        } else {
            self.fs.release(ctx, &inode, &closed.handle.state).await
        };

        if let Some(state) = closed.removed {
            self.fs.forget(ino, &state).await;
        }

        result
    }

    async fn forget(&self, ino: Ino, count: u64) {
        match self.table.release(ino, count) {
            Ok(Released::Removed(state)) => self.fs.forget(ino, &state).await,
            Ok(_) => (),
            Err(error) => log::warn!("Rejected forget of inode {}: {}", ino, error),
        }
    }
}

impl Job {
    pub fn request(&self) -> &Request {
        &self.request
    }
}

impl HandleQueue {
    /// Appends a request to the queue of `fh`. A request that `closes` the handle ends it.
    pub fn enqueue(&self, fh: u64, closes: bool) -> Turn {
        let (done, next) = oneshot::channel();
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);

        let previous = if closes {
            tails.remove(&fh)
        } else {
            tails.insert(fh, next)
        };

        Turn {
            previous,
            done: Some(done),
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.tails.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

impl Turn {
    /// Resolves once every earlier request on the same handle has finished. The next request
    /// is released when the turn is dropped.
    pub async fn ready(&mut self) {
        if let Some(previous) = self.previous.as_mut() {
            // Err only means the predecessor was dropped, which also ends its turn
            let _ = previous.await;
        }

        self.previous = None;
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        // Abandoned while still waiting: successors must keep waiting for the predecessor
        if let (Some(previous), Some(done)) = (self.previous.take(), self.done.take()) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = previous.await;
                    drop(done);
                });
            }
        }
    }
}

async fn interrupted(interrupt: oneshot::Receiver<()>) {
    if interrupt.await.is_err() {
        futures_util::future::pending::<()>().await;
    }
}

//! The filesystem implementation interface.
//!
//! Inode and handle state are owned by the session's [`crate::table::Table`]. Methods receive
//! borrowed state, so an implementation never has to track kernel reference counts itself.

use async_trait::async_trait;
use std::ffi::{OsStr, OsString};

use crate::{
    io::{
        AccessFlags, Attrs, Context, DirEntry, Entry, EntryType, FsInfo, Mode, OpenFlags, Opened,
        SetAttrs,
    },
    Ino, OpError, OpResult, Ttl,
};

#[async_trait]
pub trait Filesystem: Send + Sync + 'static {
    type Inode: Send + Sync + 'static;
    type Handle: Default + Send + Sync + 'static;

    /// State of the root inode, which is known to the kernel from the start.
    fn root(&self) -> Self::Inode;

    /// Runs before the handshake is answered. An error fails the mount.
    async fn init(&self) -> OpResult<()> {
        Ok(())
    }

    /// Runs once the session has stopped and every handle and inode has been released.
    async fn destroy(&self) {}

    async fn lookup(
        &self,
        _ctx: Context,
        _parent: &Self::Inode,
        _name: &OsStr,
    ) -> OpResult<Entry<Self::Inode>> {
        Err(OpError::Unimplemented)
    }

    /// The kernel no longer references this inode and its state has left the table.
    async fn forget(&self, _ino: Ino, _inode: &Self::Inode) {}

    async fn getattr(
        &self,
        _ctx: Context,
        _ino: Ino,
        _inode: &Self::Inode,
    ) -> OpResult<(Attrs, Ttl)> {
        Err(OpError::Unimplemented)
    }

    async fn setattr(
        &self,
        _ctx: Context,
        _ino: Ino,
        _inode: &Self::Inode,
        _changes: SetAttrs,
    ) -> OpResult<(Attrs, Ttl)> {
        Err(OpError::Unimplemented)
    }

    async fn readlink(&self, _ctx: Context, _inode: &Self::Inode) -> OpResult<OsString> {
        Err(OpError::Unimplemented)
    }

    async fn symlink(
        &self,
        _ctx: Context,
        _parent: &Self::Inode,
        _name: &OsStr,
        _target: &OsStr,
    ) -> OpResult<Entry<Self::Inode>> {
        Err(OpError::Unimplemented)
    }

    async fn mknod(
        &self,
        _ctx: Context,
        _parent: &Self::Inode,
        _name: &OsStr,
        _kind: EntryType,
        _mode: Mode,
        _device: u32,
    ) -> OpResult<Entry<Self::Inode>> {
        Err(OpError::Unimplemented)
    }

    async fn mkdir(
        &self,
        _ctx: Context,
        _parent: &Self::Inode,
        _name: &OsStr,
        _mode: Mode,
    ) -> OpResult<Entry<Self::Inode>> {
        Err(OpError::Unimplemented)
    }

    async fn unlink(&self, _ctx: Context, _parent: &Self::Inode, _name: &OsStr) -> OpResult<()> {
        Err(OpError::Unimplemented)
    }

    async fn rmdir(&self, _ctx: Context, _parent: &Self::Inode, _name: &OsStr) -> OpResult<()> {
        Err(OpError::Unimplemented)
    }

    async fn rename(
        &self,
        _ctx: Context,
        _parent: &Self::Inode,
        _name: &OsStr,
        _new_parent: &Self::Inode,
        _new_name: &OsStr,
    ) -> OpResult<()> {
        Err(OpError::Unimplemented)
    }

    async fn link(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _new_parent: &Self::Inode,
        _new_name: &OsStr,
    ) -> OpResult<Entry<Self::Inode>> {
        Err(OpError::Unimplemented)
    }

    async fn open(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _flags: OpenFlags,
    ) -> OpResult<Opened<Self::Handle>> {
        Ok(Opened::new(Default::default()))
    }

    async fn read(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
        _offset: u64,
        _size: u32,
    ) -> OpResult<Vec<u8>> {
        Err(OpError::Unimplemented)
    }

    /// Returns how many bytes were written.
    async fn write(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
        _offset: u64,
        _data: &[u8],
    ) -> OpResult<u32> {
        Err(OpError::Unimplemented)
    }

    async fn flush(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
    ) -> OpResult<()> {
        Ok(())
    }

    /// The handle has already left the table when this runs.
    async fn release(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
    ) -> OpResult<()> {
        Ok(())
    }

    async fn fsync(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
        _datasync: bool,
    ) -> OpResult<()> {
        Err(OpError::Unimplemented)
    }

    async fn opendir(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _flags: OpenFlags,
    ) -> OpResult<Opened<Self::Handle>> {
        Ok(Opened::new(Default::default()))
    }

    /// Lists entries that follow `offset` in the directory stream, where `offset` is either zero
    /// or the [`DirEntry::offset`] of an entry returned earlier. Entries that do not fit in the
    /// kernel's buffer are discarded and requested again later.
    async fn readdir(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
        _offset: u64,
    ) -> OpResult<Vec<DirEntry>> {
        Err(OpError::Unimplemented)
    }

    async fn releasedir(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
    ) -> OpResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _handle: &Self::Handle,
        _datasync: bool,
    ) -> OpResult<()> {
        Err(OpError::Unimplemented)
    }

    async fn statfs(&self, _ctx: Context, _inode: &Self::Inode) -> OpResult<FsInfo> {
        Ok(FsInfo::default())
    }

    async fn access(
        &self,
        _ctx: Context,
        _inode: &Self::Inode,
        _mask: AccessFlags,
    ) -> OpResult<()> {
        Err(OpError::Unimplemented)
    }

    async fn create(
        &self,
        _ctx: Context,
        _parent: &Self::Inode,
        _name: &OsStr,
        _mode: Mode,
        _flags: OpenFlags,
    ) -> OpResult<(Entry<Self::Inode>, Opened<Self::Handle>)> {
        Err(OpError::Unimplemented)
    }
}

use bytemuck::Zeroable;
use nix::sys::stat::SFlag;
use std::ffi::OsString;

use crate::{proto, Ino, Timestamp, Ttl};

#[doc(no_inline)]
pub use nix::{
    dir::Type as EntryType,
    fcntl::OFlag as OpenFlags,
    sys::stat::Mode,
    unistd::{AccessFlags, Gid, Pid, Uid},
};

pub use proto::{FsyncFlags, OpenOutFlags};

/// Credentials of the process that caused a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Context {
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) pid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attrs(proto::Attrs);

/// Result of any operation that makes a new name known to the kernel.
pub struct Entry<I> {
    pub ino: Ino,
    pub inode: I,
    pub attrs: Attrs,
    pub entry_ttl: Ttl,
    pub attr_ttl: Ttl,
}

pub struct Opened<H> {
    pub handle: H,
    pub flags: OpenOutFlags,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: Ino,
    pub offset: u64,
    pub kind: EntryType,
    pub name: OsString,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetTime {
    Now,
    At(Timestamp),
}

/// Attribute changes requested by `setattr`. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttrs {
    pub mode: Option<Mode>,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
    pub ctime: Option<Timestamp>,
    pub handle: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FsInfo(proto::StatfsOut);

impl Context {
    pub fn new(uid: Uid, gid: Gid, pid: Pid) -> Self {
        Context {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            pid: pid.as_raw() as u32,
        }
    }

    pub fn uid(&self) -> Uid {
        Uid::from_raw(self.uid)
    }

    pub fn gid(&self) -> Gid {
        Gid::from_raw(self.gid)
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}

impl Attrs {
    pub fn new(kind: EntryType) -> Self {
        let attrs = Attrs(proto::Attrs {
            mode: type_bits(kind).bits(),
            ..Zeroable::zeroed()
        });

        attrs.links(1)
    }

    pub fn kind(&self) -> Option<EntryType> {
        kind_of(self.0.mode)
    }

    pub fn file_size(&self) -> u64 {
        self.0.size
    }

    pub fn permissions(&self) -> Mode {
        Mode::from_bits_truncate(self.0.mode & !SFlag::S_IFMT.bits())
    }

    #[must_use]
    pub fn size(self, size: u64) -> Self {
        Attrs(proto::Attrs { size, ..self.0 })
    }

    #[must_use]
    pub fn owner(self, uid: Uid, gid: Gid) -> Self {
        Attrs(proto::Attrs {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            ..self.0
        })
    }

    /// Permission bits. The file type given to [`Attrs::new()`] is kept.
    #[must_use]
    pub fn mode(self, mode: Mode) -> Self {
        let kind = self.0.mode & SFlag::S_IFMT.bits();

        Attrs(proto::Attrs {
            mode: kind | (mode.bits() & !SFlag::S_IFMT.bits()),
            ..self.0
        })
    }

    #[must_use]
    pub fn blocks(self, blocks: u64) -> Self {
        Attrs(proto::Attrs { blocks, ..self.0 })
    }

    #[must_use]
    pub fn block_size(self, block_size: u32) -> Self {
        Attrs(proto::Attrs {
            blksize: block_size,
            ..self.0
        })
    }

    #[must_use]
    pub fn device(self, device: u32) -> Self {
        Attrs(proto::Attrs {
            rdev: device,
            ..self.0
        })
    }

    #[must_use]
    pub fn times(self, access: Timestamp, modify: Timestamp, change: Timestamp) -> Self {
        Attrs(proto::Attrs {
            atime: access.seconds() as _,
            mtime: modify.seconds() as _,
            ctime: change.seconds() as _,
            atimensec: access.nanoseconds(),
            mtimensec: modify.nanoseconds(),
            ctimensec: change.nanoseconds(),
            ..self.0
        })
    }

    #[must_use]
    pub fn links(self, links: u32) -> Self {
        Attrs(proto::Attrs {
            nlink: links,
            ..self.0
        })
    }

    pub(crate) fn finish(&self, Ino(ino): Ino) -> proto::Attrs {
        proto::Attrs { ino, ..self.0 }
    }
}

impl SetAttrs {
    pub(crate) fn from_wire(setattr: &proto::SetattrIn) -> Self {
        use proto::SetattrValid as Valid;

        let valid = Valid::from_bits_truncate(setattr.valid);
        let when = |set: Valid, now: Valid, seconds: u64, nanoseconds: u32| {
            if valid.contains(now) {
                Some(SetTime::Now)
            } else if valid.contains(set) {
                Some(SetTime::At(Timestamp::new(seconds as i64, nanoseconds)))
            } else {
                None
            }
        };

        SetAttrs {
            mode: valid
                .contains(Valid::MODE)
                .then(|| Mode::from_bits_truncate(setattr.mode)),
            uid: valid
                .contains(Valid::UID)
                .then(|| Uid::from_raw(setattr.uid)),
            gid: valid
                .contains(Valid::GID)
                .then(|| Gid::from_raw(setattr.gid)),
            size: valid.contains(Valid::SIZE).then(|| setattr.size),
            atime: when(Valid::ATIME, Valid::ATIME_NOW, setattr.atime, setattr.atimensec),
            mtime: when(Valid::MTIME, Valid::MTIME_NOW, setattr.mtime, setattr.mtimensec),
            ctime: valid
                .contains(Valid::CTIME)
                .then(|| Timestamp::new(setattr.ctime as i64, setattr.ctimensec)),
            handle: valid.contains(Valid::FH).then(|| setattr.fh),
        }
    }
}

impl FsInfo {
    #[must_use]
    pub fn blocks(self, size: u32, total: u64, free: u64, available: u64) -> Self {
        FsInfo(proto::StatfsOut {
            bsize: size,
            frsize: size,
            blocks: total,
            bfree: free,
            bavail: available,
            ..self.0
        })
    }

    #[must_use]
    pub fn inodes(self, total: u64, free: u64) -> Self {
        FsInfo(proto::StatfsOut {
            files: total,
            ffree: free,
            ..self.0
        })
    }

    #[must_use]
    pub fn max_filename(self, max: u32) -> Self {
        FsInfo(proto::StatfsOut {
            namelen: max,
            ..self.0
        })
    }
}

impl Default for FsInfo {
    fn default() -> Self {
        FsInfo(Zeroable::zeroed())
    }
}

impl From<FsInfo> for proto::StatfsOut {
    fn from(FsInfo(statfs): FsInfo) -> proto::StatfsOut {
        statfs
    }
}

impl Default for Opened<()> {
    fn default() -> Self {
        Opened {
            handle: (),
            flags: OpenOutFlags::empty(),
        }
    }
}

impl<H> Opened<H> {
    pub fn new(handle: H) -> Self {
        Opened {
            handle,
            flags: OpenOutFlags::empty(),
        }
    }

    #[must_use]
    pub fn direct_io(mut self) -> Self {
        self.flags |= OpenOutFlags::DIRECT_IO;
        self
    }

    #[must_use]
    pub fn keep_cache(mut self) -> Self {
        self.flags |= OpenOutFlags::KEEP_CACHE;
        self
    }
}

pub(crate) fn kind_of(mode: u32) -> Option<EntryType> {
    use nix::libc;

    let kind = match mode & libc::S_IFMT {
        libc::S_IFIFO => EntryType::Fifo,
        libc::S_IFCHR => EntryType::CharacterDevice,
        libc::S_IFDIR => EntryType::Directory,
        libc::S_IFBLK => EntryType::BlockDevice,
        libc::S_IFREG => EntryType::File,
        libc::S_IFLNK => EntryType::Symlink,
        libc::S_IFSOCK => EntryType::Socket,
        _ => return None,
    };

    Some(kind)
}

pub(crate) fn type_bits(kind: EntryType) -> SFlag {
    match kind {
        EntryType::Fifo => SFlag::S_IFIFO,
        EntryType::CharacterDevice => SFlag::S_IFCHR,
        EntryType::Directory => SFlag::S_IFDIR,
        EntryType::BlockDevice => SFlag::S_IFBLK,
        EntryType::File => SFlag::S_IFREG,
        EntryType::Symlink => SFlag::S_IFLNK,
        EntryType::Socket => SFlag::S_IFSOCK,
    }
}

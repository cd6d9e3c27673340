use nix::errno::Errno;
use quick_error::quick_error;

use crate::{probe::Unavailable, proto::Opcode};

pub type FuseResult<T> = Result<T, FuseError>;
pub type OpResult<T> = Result<T, OpError>;

quick_error! {
    /// Failures that end a session.
    #[derive(Debug)]
    #[non_exhaustive]
    pub enum FuseError {
        Io(err: std::io::Error) {
            from()
            source(err)
            display("I/O error: {}", err)
        }

        Protocol(err: ProtocolError) {
            from()
            source(err)
            display("fuse protocol error: {}", err)
        }

        Mount(err: MountError) {
            from()
            source(err)
            display("mount failed: {}", err)
        }

        ChannelClosed {
            display("fuse channel closed by the kernel")
        }
    }
}

quick_error! {
    /// Malformed or unexpected wire data.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ProtocolError {
        Truncated {
            display("fuse request truncated")
        }

        BadLength {
            display("bad length in fuse request")
        }

        BadOpcode(opcode: u32) {
            display("unknown fuse operation {}", opcode)
        }

        NotInit(opcode: Opcode) {
            display("first message from kernel is {} instead of Init", opcode)
        }

        Version { major: u32, minor: u32 } {
            display("unsupported fuse protocol {}.{}", major, minor)
        }
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum MountError {
        Io(err: std::io::Error) {
            from()
            source(err)
            display("I/O error during mount: {}", err)
        }

        Fusermount {
            display("fusermount failed")
        }

        Unavailable(err: Unavailable) {
            from()
            source(err)
            display("FUSE is not available: {}", err)
        }
    }
}

quick_error! {
    /// Failure of a single filesystem operation. These are always turned into an error reply.
    #[derive(Debug)]
    pub enum OpError {
        NotFound {
            display("no such entry")
        }

        PermissionDenied {
            display("permission denied")
        }

        Unimplemented {
            display("operation not implemented")
        }

        StaleHandle(fh: u64) {
            display("stale handle {}", fh)
        }

        Errno(errno: Errno) {
            from()
            display("{}", errno)
        }

        Io(err: std::io::Error) {
            from()
            source(err)
            display("{}", err)
        }
    }
}

quick_error! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TableError {
        UnknownInode(ino: u64) {
            display("inode {} is not known to the kernel", ino)
        }

        Underflow { ino: u64, lookups: u64, count: u64 } {
            display("releasing {} references of inode {} which only has {}", count, ino, lookups)
        }

        StaleHandle(fh: u64) {
            display("handle {} is not open", fh)
        }
    }
}

impl OpError {
    pub fn errno(&self) -> Errno {
        match self {
            OpError::NotFound => Errno::ENOENT,
            OpError::PermissionDenied => Errno::EACCES,
            OpError::Unimplemented => Errno::ENOSYS,
            OpError::StaleHandle(_) => Errno::EBADF,
            OpError::Errno(errno) => *errno,
            OpError::Io(error) => error
                .raw_os_error()
                .map(Errno::from_i32)
                .unwrap_or(Errno::EIO),
        }
    }
}

impl From<TableError> for OpError {
    fn from(error: TableError) -> Self {
        match error {
            TableError::UnknownInode(_) => OpError::NotFound,
            TableError::StaleHandle(fh) => OpError::StaleHandle(fh),
            TableError::Underflow { .. } => OpError::Errno(Errno::EINVAL),
        }
    }
}

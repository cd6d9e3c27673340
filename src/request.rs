//! Kernel requests.
//!
//! [`Request::decode()`] turns one raw frame into an owned request that can be moved to a worker
//! task. [`Request::encode()`] is its inverse and is what the [`crate::client`] uses to play the
//! kernel's role.

use bytemuck::{bytes_of, Pod};
use bytes::BufMut;
use std::{
    convert::TryFrom,
    ffi::{OsStr, OsString},
    fmt,
    os::unix::ffi::{OsStrExt, OsStringExt},
};

use crate::{
    io::Context,
    proto::{self, InHeader, Opcode, IN_HEADER_LEN},
    Ino, ProtocolError,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    header: InHeader,
    operation: Operation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Lookup {
        name: OsString,
    },
    Forget(proto::ForgetIn),
    BatchForget {
        forgets: Vec<proto::ForgetOne>,
    },
    Getattr(proto::GetattrIn),
    Setattr(proto::SetattrIn),
    Readlink,
    Symlink {
        name: OsString,
        target: OsString,
    },
    Mknod {
        prefix: proto::MknodIn,
        name: OsString,
    },
    Mkdir {
        prefix: proto::MkdirIn,
        name: OsString,
    },
    Unlink {
        name: OsString,
    },
    Rmdir {
        name: OsString,
    },
    Rename {
        prefix: proto::RenameIn,
        old: OsString,
        new: OsString,
    },
    Link {
        prefix: proto::LinkIn,
        name: OsString,
    },
    Open(proto::OpenIn),
    Read(proto::ReadIn),
    Write {
        prefix: proto::WriteIn,
        data: Vec<u8>,
    },
    Statfs,
    Release(proto::ReleaseIn),
    Fsync(proto::FsyncIn),
    Flush(proto::FlushIn),
    Init(proto::InitIn),
    Opendir(proto::OpenIn),
    Readdir(proto::ReadIn),
    Releasedir(proto::ReleaseIn),
    Fsyncdir(proto::FsyncIn),
    Access(proto::AccessIn),
    Create {
        prefix: proto::CreateIn,
        name: OsString,
    },
    Interrupt(proto::InterruptIn),
    Destroy,

    /// A valid opcode this crate does not serve. The body is not parsed.
    Unsupported(Opcode),
}

/// A frame that could not be decoded. `unique` is known whenever the header was intact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeError {
    pub unique: Option<u64>,
    pub error: ProtocolError,
}

impl Request {
    pub fn new(unique: u64, ino: Ino, context: Context, operation: Operation) -> Self {
        let header = InHeader {
            len: 0, // Set by encode()
            opcode: operation.opcode() as u32,
            unique,
            ino: ino.as_raw(),
            uid: context.uid,
            gid: context.gid,
            pid: context.pid,
            padding: 0,
        };

        Request { header, operation }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < IN_HEADER_LEN {
            return Err(DecodeError {
                unique: None,
                error: ProtocolError::Truncated,
            });
        }

        let header: InHeader = bytemuck::pod_read_unaligned(&bytes[..IN_HEADER_LEN]);
        let fail = |error| DecodeError {
            unique: Some(header.unique),
            error,
        };

        if header.len as usize != bytes.len() {
            return Err(fail(ProtocolError::BadLength));
        }

        let opcode = Opcode::try_from(header.opcode)
            .map_err(|_| fail(ProtocolError::BadOpcode(header.opcode)))?;

        let operation = Operation::decode(opcode, &bytes[IN_HEADER_LEN..]).map_err(fail)?;
        Ok(Request { header, operation })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.operation.encode(&mut body);

        let header = InHeader {
            len: (IN_HEADER_LEN + body.len()) as u32,
            ..self.header
        };

        let mut frame = Vec::with_capacity(header.len as usize);
        frame.put_slice(bytes_of(&header));
        frame.put_slice(&body);

        frame
    }

    pub fn header(&self) -> &InHeader {
        &self.header
    }

    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    pub fn opcode(&self) -> Opcode {
        self.operation.opcode()
    }

    pub fn ino(&self) -> Ino {
        Ino(self.header.ino)
    }

    pub fn context(&self) -> Context {
        Context {
            uid: self.header.uid,
            gid: self.header.gid,
            pid: self.header.pid,
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn into_operation(self) -> Operation {
        self.operation
    }

    /// Open handle this request acts on, if requests against it must be kept in order.
    pub fn handle(&self) -> Option<u64> {
        use Operation::*;

        match &self.operation {
            Read(read) | Readdir(read) => Some(read.fh),
            Write { prefix, .. } => Some(prefix.fh),
            Flush(flush) => Some(flush.fh),
            Release(release) | Releasedir(release) => Some(release.fh),
            Fsync(fsync) | Fsyncdir(fsync) => Some(fsync.fh),
            _ => None,
        }
    }

    /// Requests the kernel never expects an answer to.
    pub fn is_unanswered(&self) -> bool {
        matches!(
            self.operation,
            Operation::Forget(_) | Operation::BatchForget { .. } | Operation::Interrupt(_)
        )
    }
}

impl fmt::Display for Request {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.header, fmt)
    }
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        use Operation::*;

        match self {
            Lookup { .. } => Opcode::Lookup,
            Forget(_) => Opcode::Forget,
            BatchForget { .. } => Opcode::BatchForget,
            Getattr(_) => Opcode::Getattr,
            Setattr(_) => Opcode::Setattr,
            Readlink => Opcode::Readlink,
            Symlink { .. } => Opcode::Symlink,
            Mknod { .. } => Opcode::Mknod,
            Mkdir { .. } => Opcode::Mkdir,
            Unlink { .. } => Opcode::Unlink,
            Rmdir { .. } => Opcode::Rmdir,
            Rename { .. } => Opcode::Rename,
            Link { .. } => Opcode::Link,
            Open(_) => Opcode::Open,
            Read(_) => Opcode::Read,
            Write { .. } => Opcode::Write,
            Statfs => Opcode::Statfs,
            Release(_) => Opcode::Release,
            Fsync(_) => Opcode::Fsync,
            Flush(_) => Opcode::Flush,
            Init(_) => Opcode::Init,
            Opendir(_) => Opcode::Opendir,
            Readdir(_) => Opcode::Readdir,
            Releasedir(_) => Opcode::Releasedir,
            Fsyncdir(_) => Opcode::Fsyncdir,
            Access(_) => Opcode::Access,
            Create { .. } => Opcode::Create,
            Interrupt(_) => Opcode::Interrupt,
            Destroy => Opcode::Destroy,
            Unsupported(opcode) => *opcode,
        }
    }

    fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self, ProtocolError> {
        use ProtocolError::*;

        let mut body = Body(bytes);
        let operation = match opcode {
            Opcode::Lookup => Operation::Lookup { name: body.name()? },
            Opcode::Forget => Operation::Forget(body.prefix()?),
            Opcode::BatchForget => {
                let prefix: proto::BatchForgetIn = body.prefix()?;
                let forgets = body.rest();

                const ONE: usize = std::mem::size_of::<proto::ForgetOne>();
                if forgets.len() != prefix.count as usize * ONE {
                    return Err(BadLength);
                }

                let forgets = forgets
                    .chunks_exact(ONE)
                    .map(bytemuck::pod_read_unaligned)
                    .collect();

                Operation::BatchForget { forgets }
            }
            Opcode::Getattr => Operation::Getattr(body.prefix()?),
            Opcode::Setattr => Operation::Setattr(body.prefix()?),
            Opcode::Readlink => Operation::Readlink,
            Opcode::Symlink => Operation::Symlink {
                name: body.name()?,
                target: body.name()?,
            },
            Opcode::Mknod => Operation::Mknod {
                prefix: body.prefix()?,
                name: body.name()?,
            },
            Opcode::Mkdir => Operation::Mkdir {
                prefix: body.prefix()?,
                name: body.name()?,
            },
            Opcode::Unlink => Operation::Unlink { name: body.name()? },
            Opcode::Rmdir => Operation::Rmdir { name: body.name()? },
            Opcode::Rename => Operation::Rename {
                prefix: body.prefix()?,
                old: body.name()?,
                new: body.name()?,
            },
            Opcode::Link => Operation::Link {
                prefix: body.prefix()?,
                name: body.name()?,
            },
            Opcode::Open => Operation::Open(body.prefix()?),
            Opcode::Read => Operation::Read(body.prefix()?),
            Opcode::Write => {
                let prefix: proto::WriteIn = body.prefix()?;
                let data = body.rest();

                if prefix.size as usize != data.len() {
                    return Err(BadLength);
                }

                Operation::Write {
                    prefix,
                    data: data.to_vec(),
                }
            }
            Opcode::Statfs => Operation::Statfs,
            Opcode::Release => Operation::Release(body.prefix()?),
            Opcode::Fsync => Operation::Fsync(body.prefix()?),
            Opcode::Flush => Operation::Flush(body.prefix()?),
            Opcode::Init => {
                // Newer kernels append fields that this protocol level does not know about
                let init = body.prefix()?;
                body.rest();

                Operation::Init(init)
            }
            Opcode::Opendir => Operation::Opendir(body.prefix()?),
            Opcode::Readdir => Operation::Readdir(body.prefix()?),
            Opcode::Releasedir => Operation::Releasedir(body.prefix()?),
            Opcode::Fsyncdir => Operation::Fsyncdir(body.prefix()?),
            Opcode::Access => Operation::Access(body.prefix()?),
            Opcode::Create => Operation::Create {
                prefix: body.prefix()?,
                name: body.name()?,
            },
            Opcode::Interrupt => Operation::Interrupt(body.prefix()?),
            Opcode::Destroy => Operation::Destroy,

            unsupported => {
                body.rest();
                Operation::Unsupported(unsupported)
            }
        };

        if body.0.is_empty() {
            Ok(operation)
        } else {
            Err(BadLength)
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        use Operation::*;

        fn name(out: &mut Vec<u8>, name: &OsStr) {
            out.put_slice(name.as_bytes());
            out.put_u8(b'\0');
        }

        match self {
            Readlink | Statfs | Destroy | Unsupported(_) => (),

            Lookup { name: entry } | Unlink { name: entry } | Rmdir { name: entry } => {
                name(out, entry)
            }

            Forget(forget) => out.put_slice(bytes_of(forget)),
            BatchForget { forgets } => {
                let prefix = proto::BatchForgetIn {
                    count: forgets.len() as u32,
                    dummy: 0,
                };

                out.put_slice(bytes_of(&prefix));
                forgets
                    .iter()
                    .for_each(|forget| out.put_slice(bytes_of(forget)));
            }

            Getattr(getattr) => out.put_slice(bytes_of(getattr)),
            Setattr(setattr) => out.put_slice(bytes_of(setattr)),

            Symlink {
                name: entry,
                target,
            } => {
                name(out, entry);
                name(out, target);
            }

            Mknod {
                prefix,
                name: entry,
            } => {
                out.put_slice(bytes_of(prefix));
                name(out, entry);
            }

            Mkdir {
                prefix,
                name: entry,
            } => {
                out.put_slice(bytes_of(prefix));
                name(out, entry);
            }

            Rename { prefix, old, new } => {
                out.put_slice(bytes_of(prefix));
                name(out, old);
                name(out, new);
            }

            Link {
                prefix,
                name: entry,
            } => {
                out.put_slice(bytes_of(prefix));
                name(out, entry);
            }

            Create {
                prefix,
                name: entry,
            } => {
                out.put_slice(bytes_of(prefix));
                name(out, entry);
            }

            Write { prefix, data } => {
                out.put_slice(bytes_of(prefix));
                out.put_slice(data);
            }

            Open(open) | Opendir(open) => out.put_slice(bytes_of(open)),
            Read(read) | Readdir(read) => out.put_slice(bytes_of(read)),
            Release(release) | Releasedir(release) => out.put_slice(bytes_of(release)),
            Fsync(fsync) | Fsyncdir(fsync) => out.put_slice(bytes_of(fsync)),
            Flush(flush) => out.put_slice(bytes_of(flush)),
            Init(init) => out.put_slice(bytes_of(init)),
            Access(access) => out.put_slice(bytes_of(access)),
            Interrupt(interrupt) => out.put_slice(bytes_of(interrupt)),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unique {
            Some(unique) => write!(fmt, "req#{}: {}", unique, self.error),
            None => write!(fmt, "unidentifiable request: {}", self.error),
        }
    }
}

impl std::error::Error for DecodeError {}

struct Body<'a>(&'a [u8]);

impl<'a> Body<'a> {
    fn prefix<T: Pod>(&mut self) -> Result<T, ProtocolError> {
        let size = std::mem::size_of::<T>();
        if self.0.len() < size {
            return Err(ProtocolError::Truncated);
        }

        let (prefix, rest) = self.0.split_at(size);
        self.0 = rest;

        Ok(bytemuck::pod_read_unaligned(prefix))
    }

    fn name(&mut self) -> Result<OsString, ProtocolError> {
        let nul = self
            .0
            .iter()
            .position(|byte| *byte == b'\0')
            .ok_or(ProtocolError::Truncated)?;

        let (name, rest) = self.0.split_at(nul);
        self.0 = &rest[1..];

        Ok(OsString::from_vec(name.to_vec()))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.0)
    }
}

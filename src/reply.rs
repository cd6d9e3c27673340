//! Replies to kernel requests.
//!
//! A [`Reply`] is produced for every decoded request, including those the kernel does not expect
//! an answer to. The latter carry [`ReplyBody::None`] and produce no frame at all.

use bytemuck::bytes_of;
use bytes::BufMut;
use smallvec::{smallvec, SmallVec};
use std::os::unix::ffi::OsStrExt;

use crate::{
    io::{type_bits, Attrs, DirEntry},
    proto::{self, OutHeader, OUT_HEADER_LEN},
    Errno, Ino, Ttl,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    unique: u64,
    result: Result<ReplyBody, Errno>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyBody {
    /// Nothing is written back.
    None,

    /// Success without a payload.
    Empty,

    Init(proto::InitOut),
    Entry(proto::EntryOut),
    Attr(proto::AttrOut),
    Open(proto::OpenOut),
    Create(proto::EntryOut, proto::OpenOut),
    Write(proto::WriteOut),
    Statfs(proto::StatfsOut),

    /// Raw payload, used by read, readlink and readdir.
    Data(Vec<u8>),
}

/// A reply ready to be written, as a header followed by borrowed body segments.
pub struct Frame<'a> {
    pub header: OutHeader,
    pub body: SmallVec<[&'a [u8]; 2]>,
}

/// Accumulates directory entries in the kernel's dirent layout, up to a size limit.
pub struct DirBuffer {
    max: usize,
    buffer: Vec<u8>,
    last_offset: Option<u64>,
}

impl Reply {
    pub fn new(unique: u64, result: Result<ReplyBody, Errno>) -> Self {
        Reply { unique, result }
    }

    pub fn ok(unique: u64, body: ReplyBody) -> Self {
        Reply::new(unique, Ok(body))
    }

    pub fn fail(unique: u64, errno: Errno) -> Self {
        Reply::new(unique, Err(errno))
    }

    pub fn unique(&self) -> u64 {
        self.unique
    }

    pub fn result(&self) -> &Result<ReplyBody, Errno> {
        &self.result
    }

    /// Whether this reply produces a frame on the channel.
    pub fn is_sent(&self) -> bool {
        !matches!(self.result, Ok(ReplyBody::None))
    }

    pub fn frame(&self) -> Option<Frame<'_>> {
        let (error, body): (i32, SmallVec<[&[u8]; 2]>) = match &self.result {
            Ok(ReplyBody::None) => return None,
            Ok(body) => (0, body.segments()),

            Err(errno) => {
                // Zero would be read as success, which the kernel then fails to parse
                let errno = match *errno as i32 {
                    errno if errno > 0 => errno,
                    _ => Errno::ENOMSG as i32,
                };

                (-errno, SmallVec::new())
            }
        };

        let len = OUT_HEADER_LEN + body.iter().map(|segment| segment.len()).sum::<usize>();
        let header = OutHeader {
            len: len as u32,
            error,
            unique: self.unique,
        };

        Some(Frame { header, body })
    }

    /// Serializes this reply into a single contiguous frame.
    pub fn encode(&self) -> Option<Vec<u8>> {
        self.frame().map(|frame| {
            let mut bytes = Vec::with_capacity(frame.header.len as usize);
            bytes.put_slice(bytes_of(&frame.header));
            frame
                .body
                .iter()
                .for_each(|segment| bytes.put_slice(segment));

            bytes
        })
    }
}

impl ReplyBody {
    fn segments(&self) -> SmallVec<[&[u8]; 2]> {
        match self {
            ReplyBody::None | ReplyBody::Empty => SmallVec::new(),
            ReplyBody::Init(init) => smallvec![bytes_of(init)],
            ReplyBody::Entry(entry) => smallvec![bytes_of(entry)],
            ReplyBody::Attr(attr) => smallvec![bytes_of(attr)],
            ReplyBody::Open(open) => smallvec![bytes_of(open)],
            ReplyBody::Create(entry, open) => smallvec![bytes_of(entry), bytes_of(open)],
            ReplyBody::Write(write) => smallvec![bytes_of(write)],
            ReplyBody::Statfs(statfs) => smallvec![bytes_of(statfs)],
            ReplyBody::Data(data) => smallvec![&data[..]],
        }
    }
}

impl DirBuffer {
    pub fn new(max: usize) -> Self {
        DirBuffer {
            max,
            buffer: Vec::new(),
            last_offset: None,
        }
    }

    /// Appends an entry. Returns `false` without writing anything if the entry does not fit.
    pub fn push(&mut self, entry: &DirEntry) -> bool {
        let name = entry.name.as_bytes();
        let header_len = std::mem::size_of::<proto::Dirent>();
        let padding_len = dirent_pad_bytes(header_len + name.len());

        let record_len = header_len + name.len() + padding_len;
        if self.buffer.len() + record_len > self.max {
            return false;
        }

        let dirent = proto::Dirent {
            ino: entry.ino.as_raw(),
            off: entry.offset,
            namelen: name.len() as u32,
            entry_type: type_bits(entry.kind).bits() >> 12,
        };

        self.buffer.put_slice(bytes_of(&dirent));
        self.buffer.put_slice(name);
        self.buffer.put_slice(&[0; 7][..padding_len]);

        self.last_offset = Some(entry.offset);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Offset of the last entry that was written, which is where the next readdir resumes.
    pub fn last_offset(&self) -> Option<u64> {
        self.last_offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

pub(crate) fn make_entry(
    Ino(ino): Ino,
    attrs: &Attrs,
    entry_ttl: Ttl,
    attr_ttl: Ttl,
) -> proto::EntryOut {
    proto::EntryOut {
        nodeid: ino,
        generation: 0,
        entry_valid: entry_ttl.seconds(),
        attr_valid: attr_ttl.seconds(),
        entry_valid_nsec: entry_ttl.nanoseconds(),
        attr_valid_nsec: attr_ttl.nanoseconds(),
        attr: attrs.finish(Ino(ino)),
    }
}

pub(crate) fn make_attr(ino: Ino, attrs: &Attrs, ttl: Ttl) -> proto::AttrOut {
    proto::AttrOut {
        attr_valid: ttl.seconds(),
        attr_valid_nsec: ttl.nanoseconds(),
        dummy: 0,
        attr: attrs.finish(ino),
    }
}

fn dirent_pad_bytes(entry_len: usize) -> usize {
    const ALIGN_MASK: usize = (1 << proto::DIRENT_ALIGNMENT_BITS) - 1;
    ((entry_len + ALIGN_MASK) & !ALIGN_MASK) - entry_len
}

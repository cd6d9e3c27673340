//! FUSE client.
//!
//! Usually, a kernel module or other OS component takes the role of the FUSE client. This module
//! is a client-wise counterpart to the rest of the API: [`pair()`] connects a [`Client`] to a
//! session over a socket pair, so that sessions can be exercised without mounting anything.

use bytemuck::Pod;
use std::{
    io,
    os::unix::io::AsRawFd,
    sync::atomic::{AtomicU64, Ordering},
};

use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::socket::{socketpair, AddressFamily, SockFlag, SockType},
    unistd::{read, write},
};

use tokio::io::unix::AsyncFd;

use crate::{
    io::Context,
    proto::{self, OutHeader, OUT_HEADER_LEN},
    request::{Operation, Request},
    session::Start,
    util::DumbFd,
    Errno, Ino,
};

pub struct Client {
    fd: AsyncFd<DumbFd>,
    next_unique: AtomicU64,
    context: Context,
}

#[derive(Clone, Debug)]
pub struct RawReply {
    pub header: OutHeader,
    pub body: Vec<u8>,
}

const RECEIVE_BUFFER: usize = 1 << 20;

/// Creates a connected client and an unstarted session.
pub fn pair() -> io::Result<(Client, Start)> {
    let (client_fd, session_fd) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let (client_fd, session_fd) = (DumbFd(client_fd), DumbFd(session_fd));
    fcntl(client_fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(io::Error::from)?;

    let client = Client {
        fd: AsyncFd::new(client_fd)?,
        next_unique: AtomicU64::new(1),
        context: Context {
            uid: 0,
            gid: 0,
            pid: std::process::id(),
        },
    };

    Ok((client, Start::from_fd(session_fd)))
}

impl Client {
    /// Request ids are allocated in increasing order, starting at 1.
    pub fn next_unique(&self) -> u64 {
        self.next_unique.fetch_add(1, Ordering::Relaxed)
    }

    pub fn request(&self, ino: Ino, operation: Operation) -> Request {
        Request::new(self.next_unique(), ino, self.context, operation)
    }

    pub async fn send(&self, request: &Request) -> io::Result<()> {
        self.send_raw(&request.encode()).await
    }

    /// Sends bytes as one frame, whether or not they form a valid request.
    pub async fn send_raw(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut writable = self.fd.writable().await?;
            match writable.try_io(|fd| write(fd.as_raw_fd(), frame).map_err(io::Error::from)) {
                Ok(result) => break result.map(drop),
                Err(_would_block) => continue,
            }
        }
    }

    /// Next reply from the session, or `None` once the session has closed its end.
    pub async fn receive(&self) -> io::Result<Option<RawReply>> {
        let mut buffer = vec![0; RECEIVE_BUFFER];

        let len = loop {
            let mut readable = self.fd.readable().await?;
            match readable.try_io(|fd| read(fd.as_raw_fd(), &mut buffer).map_err(io::Error::from)) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };

        if len == 0 {
            return Ok(None);
        }

        if len < OUT_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply of {} bytes is shorter than its header", len),
            ));
        }

        let header: OutHeader = bytemuck::pod_read_unaligned(&buffer[..OUT_HEADER_LEN]);
        if header.len as usize != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("reply header claims {} bytes, got {}", header.len, len),
            ));
        }

        buffer.truncate(len);
        buffer.drain(..OUT_HEADER_LEN);

        Ok(Some(RawReply {
            header,
            body: buffer,
        }))
    }

    /// Sends a request and waits for the next reply. Only meaningful when nothing else is in
    /// flight.
    pub async fn call(&self, ino: Ino, operation: Operation) -> io::Result<RawReply> {
        let request = self.request(ino, operation);
        self.send(&request).await?;

        let reply = self.receive().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "session closed the channel")
        })?;

        if reply.header.unique != request.unique() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "expected a reply to #{}, got #{}",
                    request.unique(),
                    reply.header.unique
                ),
            ));
        }

        Ok(reply)
    }

    /// Performs the `INIT` handshake the way a current kernel would.
    pub async fn init(&self) -> io::Result<RawReply> {
        let init = proto::InitIn {
            major: proto::MAJOR_VERSION,
            minor: proto::TARGET_MINOR_VERSION,
            max_readahead: 0x20000,
            flags: proto::InitFlags::all().bits(),
        };

        self.call(Ino::NULL, Operation::Init(init)).await
    }
}

impl RawReply {
    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    pub fn errno(&self) -> Option<Errno> {
        match self.header.error {
            0 => None,
            error => Some(Errno::from_i32(-error)),
        }
    }

    /// Reads a fixed-size reply body, if it has exactly that size.
    pub fn body_as<T: Pod>(&self) -> Option<T> {
        (self.body.len() == std::mem::size_of::<T>())
            .then(|| bytemuck::pod_read_unaligned(&self.body))
    }
}

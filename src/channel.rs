//! The kernel channel: a `/dev/fuse` descriptor (or anything that frames messages the same way).

use bytemuck::bytes_of;
use smallvec::SmallVec;
use std::{
    io,
    os::unix::io::{AsRawFd, RawFd},
};

use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::uio::{writev, IoVec},
    unistd::read,
};

use tokio::io::unix::AsyncFd;

use crate::{reply::Frame, util::DumbFd, Errno, FuseError, FuseResult};

pub struct Channel {
    fd: AsyncFd<DumbFd>,
}

impl Channel {
    pub fn from_fd(fd: DumbFd) -> io::Result<Self> {
        let flags = OFlag::O_NONBLOCK | OFlag::O_LARGEFILE;
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;

        Ok(Channel {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Reads one complete frame into `buffer` and returns its length.
    pub async fn receive(&self, buffer: &mut [u8]) -> FuseResult<usize> {
        let mut filled = 0;

        loop {
            let bytes = match self.read(&mut buffer[filled..]).await {
                Ok(0) => return Err(FuseError::ChannelClosed),
                Ok(bytes) => bytes,

                // The kernel dropped an interrupted request before we got to it
                Err(error) if is(&error, Errno::ENOENT) && filled == 0 => continue,

                Err(error) if is(&error, Errno::ENODEV) => return Err(FuseError::ChannelClosed),
                Err(error) => return Err(error.into()),
            };

            filled += bytes;
            match declared_len(&buffer[..filled]) {
                Some(len) if len > filled && len <= buffer.len() => {
                    log::debug!("Short read of {} out of {} bytes", filled, len);
                }

                _ => break Ok(filled),
            }
        }
    }

    pub async fn send(&self, frame: &Frame<'_>) -> FuseResult<()> {
        let header = [bytes_of(&frame.header)];
        let segments: SmallVec<[&[u8]; 4]> = header
            .iter()
            .chain(frame.body.iter())
            .copied()
            .filter(|segment| !segment.is_empty())
            .collect();

        let unique = frame.header.unique;
        let total = frame.header.len as usize;
        let mut written = 0;

        while written < total {
            match self.write(&segments, written).await {
                Ok(0) => return Err(FuseError::ChannelClosed),
                Ok(bytes) => written += bytes,

                Err(error) if is(&error, Errno::ENOENT) => {
                    log::debug!("Reply to req#{} dropped: request was interrupted", unique);
                    return Ok(());
                }

                Err(error) if is(&error, Errno::ENODEV) || is(&error, Errno::EPIPE) => {
                    return Err(FuseError::ChannelClosed)
                }

                Err(error) => return Err(error.into()),
            }

            if written < total {
                log::debug!("Short write to req#{}, {} of {} bytes", unique, written, total);
            }
        }

        Ok(())
    }

    async fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut readable = self.fd.readable().await?;
            let result = readable.try_io(|fd| {
                read(fd.as_raw_fd(), buffer).map_err(io::Error::from)
            });

            match result {
                Ok(Err(error)) if is(&error, Errno::EINTR) => continue,
                Ok(result) => break result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Writes whatever remains of `segments` past the first `skip` bytes.
    async fn write(&self, segments: &[&[u8]], skip: usize) -> io::Result<usize> {
        loop {
            let mut writable = self.fd.writable().await?;
            let result = writable.try_io(|fd| {
                let iovecs: SmallVec<[IoVec<&[u8]>; 4]> =
                    tail(segments, skip).map(IoVec::from_slice).collect();

                writev(fd.as_raw_fd(), &iovecs).map_err(io::Error::from)
            });

            match result {
                Ok(Err(error)) if is(&error, Errno::EINTR) => continue,
                Ok(result) => break result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

fn is(error: &io::Error, errno: Errno) -> bool {
    error.raw_os_error() == Some(errno as i32)
}

fn declared_len(frame: &[u8]) -> Option<usize> {
    let len = frame.get(..4)?;
    Some(u32::from_ne_bytes([len[0], len[1], len[2], len[3]]) as usize)
}

/// Segments that remain after skipping the first `skip` bytes.
fn tail<'a>(segments: &'a [&'a [u8]], mut skip: usize) -> impl Iterator<Item = &'a [u8]> {
    segments.iter().filter_map(move |segment| {
        if skip >= segment.len() {
            skip -= segment.len();
            None
        } else {
            let rest = &segment[skip..];
            skip = 0;
            Some(rest)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_resumes_inside_a_segment() {
        let segments: [&[u8]; 3] = [b"head", b"er", b"body"];

        let rest: Vec<&[u8]> = tail(&segments, 5).collect();
        assert_eq!(rest, [&b"r"[..], &b"body"[..]]);

        assert_eq!(tail(&segments, 0).count(), 3);
        assert_eq!(tail(&segments, 10).count(), 0);
    }

    #[test]
    fn declared_length_needs_four_bytes() {
        assert_eq!(declared_len(&[1, 2, 3]), None);
        assert_eq!(declared_len(&64u32.to_ne_bytes()), Some(64));
    }

    fn assert_send<T: Send>(value: T) -> T {
        value
    }

    #[tokio::test]
    async fn replies_can_be_sent_from_spawned_tasks() {
        use crate::reply::{Reply, ReplyBody};
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        use std::sync::Arc;

        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();

        let channel = Arc::new(Channel::from_fd(DumbFd(ours)).unwrap());
        let theirs = DumbFd(theirs);

        let sender = Arc::clone(&channel);
        let sent = tokio::spawn(assert_send(async move {
            let reply = Reply::ok(7, ReplyBody::Data(b"hello".to_vec()));
            let result = match reply.frame() {
                Some(frame) => sender.send(&frame).await,
                None => Ok(()),
            };
            result
        }));

        sent.await.unwrap().unwrap();

        let mut buffer = [0; 64];
        let len = read(theirs.as_raw_fd(), &mut buffer).unwrap();
        assert_eq!(len, crate::proto::OUT_HEADER_LEN + 5);
        assert_eq!(declared_len(&buffer[..len]), Some(len));
        assert_eq!(&buffer[crate::proto::OUT_HEADER_LEN..len], b"hello");
    }
}

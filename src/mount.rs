//! Mounting through the setuid `fusermount3` helper.

use std::{
    ffi::{OsStr, OsString},
    fs, io,
    os::unix::{
        ffi::{OsStrExt, OsStringExt},
        io::{AsRawFd, IntoRawFd, RawFd},
        net::UnixStream,
    },
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use nix::{
    self, cmsg_space,
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::socket::{recvmsg, ControlMessageOwned, MsgFlags},
};

use crate::{probe, session::Start, util::DumbFd, MountError};

#[derive(Clone, Debug, Default)]
pub struct Options(OsString);

/// A live mount. The helper's end of the control socket is kept open for as long as the mount.
#[derive(Debug)]
pub struct Mount {
    mountpoint: PathBuf,
    _fusermount_fd: DumbFd,
}

impl Options {
    pub fn fs_name<O: AsRef<OsStr>>(&mut self, fs_name: O) -> &mut Self {
        self.push_key_value("fsname", fs_name)
    }

    pub fn read_only(&mut self) -> &mut Self {
        self.push("ro")
    }

    pub fn push<O: AsRef<OsStr>>(&mut self, option: O) -> &mut Self {
        self.push_parts(&[option.as_ref()])
    }

    pub fn push_key_value<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let (key, value) = (key.as_ref(), value.as_ref());

        let assert_valid = |part: &OsStr| {
            let bytes = part.as_bytes();
            assert!(
                !bytes.is_empty() && bytes.iter().all(|b| !matches!(*b, b',' | b'=')),
                "invalid key or value: {}",
                part.to_string_lossy()
            );
        };

        assert_valid(key);
        assert_valid(value);

        self.push_parts(&[key, OsStr::new("="), value])
    }

    pub fn as_os_str(&self) -> &OsStr {
        &self.0
    }

    fn push_parts(&mut self, segment: &[&OsStr]) -> &mut Self {
        if !self.0.is_empty() {
            self.0.push(",");
        }

        let start = self.0.as_bytes().len();
        segment.iter().for_each(|part| self.0.push(part));

        let bytes = self.0.as_bytes();
        assert!(
            bytes.len() > start && bytes[start] != b',' && bytes[bytes.len() - 1] != b',',
            "invalid option string: {}",
            OsStr::from_bytes(&bytes[start..]).to_string_lossy()
        );

        self
    }
}

impl<O: AsRef<OsStr>> Extend<O> for Options {
    fn extend<I: IntoIterator<Item = O>>(&mut self, iter: I) {
        iter.into_iter().for_each(|option| {
            self.push(option);
        });
    }
}

impl Mount {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Lazily detaches the mount unless the kernel already dropped it.
    pub fn unmount(&self) -> Result<(), MountError> {
        match is_mounted(&self.mountpoint) {
            Ok(false) => Ok(()),
            _ => unmount_sync(&self.mountpoint),
        }
    }
}

pub fn mount_sync<M>(mountpoint: M, options: &Options) -> Result<Start, MountError>
where
    M: AsRef<Path>,
{
    let helper = probe::check()?;

    // Resolving the path once the mount is up would block on the not yet started session
    let mountpoint = fs::canonicalize(mountpoint)?;
    let mountpoint = mountpoint.as_path();

    let (left_side, right_side) = UnixStream::pair()?;

    // The fusermount protocol requires us to preserve right_fd across execve()
    let right_fd = right_side.as_raw_fd();
    let fd_flags = fcntl(right_fd, FcntlArg::F_GETFD).map_err(io::Error::from)?;
    fcntl(
        right_fd,
        FcntlArg::F_SETFD(FdFlag::from_bits_truncate(fd_flags) & !FdFlag::FD_CLOEXEC),
    )
    .map_err(io::Error::from)?;

    let mut command = Command::new(&helper);
    let options = options.as_os_str();
    if !options.is_empty() {
        command.args(&[OsStr::new("-o"), options, mountpoint.as_os_str()]);
    } else {
        command.arg(mountpoint);
    };

    log::debug!("Mounting {} through {}", mountpoint.display(), helper.display());
    let mut fusermount = command.env("_FUSE_COMMFD", right_fd.to_string()).spawn()?;

    // recvmsg() should fail if fusermount exits (last open fd is closed)
    drop(right_side);

    let session_fd = (|| {
        let mut buffer = cmsg_space!(RawFd);
        let message = recvmsg(
            left_side.as_raw_fd(),
            &[],
            Some(&mut buffer),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        let session_fd = match message.cmsgs().next() {
            Some(ControlMessageOwned::ScmRights(fds)) => fds.into_iter().next(),
            _ => None,
        };

        session_fd.ok_or(MountError::Fusermount)
    })();

    match session_fd {
        Ok(session_fd) => {
            let session_fd = DumbFd(session_fd);
            if !fusermount.wait()?.success() {
                return Err(MountError::Fusermount);
            }

            let mount = Mount {
                mountpoint: mountpoint.to_owned(),
                _fusermount_fd: DumbFd(left_side.into_raw_fd()),
            };

            Ok(Start::new(session_fd, Some(mount)))
        }

        Err(error) => {
            drop(left_side);
            fusermount.wait()?;
            Err(error)
        }
    }
}

/// Runs `fusermount3 -u -z` on `mountpoint`.
pub fn unmount_sync<M: AsRef<Path>>(mountpoint: M) -> Result<(), MountError> {
    let helper = probe::fusermount().ok_or(probe::Unavailable::NoHelper)?;
    let mountpoint = mountpoint.as_ref();

    log::debug!("Unmounting {}", mountpoint.display());
    let status = Command::new(helper)
        .args(&[OsStr::new("-u"), OsStr::new("-z"), mountpoint.as_os_str()])
        .stdout(Stdio::null())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        Err(MountError::Fusermount)
    }
}

/// Whether `path` is currently a mount point of this process' mount namespace.
pub fn is_mounted<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    let path = path.as_ref();

    // A dead FUSE mount can't be resolved, so fall back to the path as given
    let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());

    let table = fs::read("/proc/self/mounts")?;
    let mounted = table
        .split(|byte| *byte == b'\n')
        .filter_map(|line| line.split(|byte| *byte == b' ').nth(1))
        .any(|target| Path::new(&unescape(target)) == path);

    Ok(mounted)
}

/// Decodes the octal escapes (`\040` and friends) of a mount table field.
fn unescape(field: &[u8]) -> OsString {
    let mut decoded = Vec::with_capacity(field.len());
    let mut rest = field;

    while let Some((&byte, tail)) = rest.split_first() {
        let octal = match tail {
            [a, b, c, ..] if byte == b'\\' => {
                let digits = [*a, *b, *c];
                if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                    Some(digits.iter().fold(0u8, |acc, d| (acc << 3) | (d - b'0')))
                } else {
                    None
                }
            }

            _ => None,
        };

        match octal {
            Some(value) => {
                decoded.push(value);
                rest = &tail[3..];
            }

            None => {
                decoded.push(byte);
                rest = tail;
            }
        }
    }

    OsString::from_vec(decoded)
}

//! Whether FUSE can be used by this process at all.
//!
//! Integration tests and programs that want a friendly error call [`check()`] before mounting.

use nix::{
    fcntl::OFlag,
    sys::stat::Mode,
    unistd::{geteuid, Uid},
};

use quick_error::quick_error;
use std::{
    env,
    ffi::OsStr,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use crate::util::DumbFd;

pub const DEVICE: &str = "/dev/fuse";

const HELPERS: [&str; 2] = ["fusermount3", "fusermount"];

quick_error! {
    #[derive(Debug)]
    pub enum Unavailable {
        NoHelper {
            display("can't find a fusermount3 or fusermount executable in PATH")
        }

        NoDevice {
            display("{} does not exist, the fuse kernel module does not seem to be loaded", DEVICE)
        }

        NotSetuid(helper: PathBuf) {
            display("{} is not setuid, and we are not root", helper.display())
        }

        Device(err: io::Error) {
            source(err)
            display("unable to open {}: {}", DEVICE, err)
        }
    }
}

/// Runs every availability check in order and reports the first that fails.
pub fn check() -> Result<PathBuf, Unavailable> {
    let helper = fusermount().ok_or(Unavailable::NoHelper)?;

    if !Path::new(DEVICE).exists() {
        return Err(Unavailable::NoDevice);
    }

    if geteuid() != Uid::from_raw(0) {
        let mode = std::fs::metadata(&helper)
            .map_err(Unavailable::Device)?
            .permissions()
            .mode();

        if mode & nix::libc::S_ISUID == 0 {
            return Err(Unavailable::NotSetuid(helper));
        }
    }

    nix::fcntl::open(DEVICE, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
        .map(DumbFd)
        .map_err(|errno| Unavailable::Device(errno.into()))?;

    Ok(helper)
}

/// Locates the mount helper, preferring `fusermount3`.
pub fn fusermount() -> Option<PathBuf> {
    HELPERS.iter().find_map(|helper| which(helper))
}

fn which<S: AsRef<OsStr>>(program: S) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;

    env::split_paths(&path)
        .map(|dir| dir.join(program.as_ref()))
        .find(|candidate| {
            std::fs::metadata(candidate)
                .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

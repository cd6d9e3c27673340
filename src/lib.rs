//! An asynchronous session core for the Filesystem in Userspace protocol.
//!
//! `fusebox` owns the kernel channel of a single mount. Requests are read by one task, decoded
//! into owned [`request::Request`] values and handed to a bounded pool of workers which route
//! them to a [`fs::Filesystem`] implementation. Every request is answered exactly once, and
//! requests that target the same open handle are served in the order the kernel sent them.

#![forbid(unsafe_code)]

#[cfg(not(target_os = "linux"))]
compile_error!("Unsupported OS");

use std::{fmt, time::Duration};

pub use self::error::{FuseError, FuseResult, MountError, OpError, OpResult, ProtocolError};

#[doc(no_inline)]
pub use nix::{self, errno::Errno};

pub mod channel;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod io;
pub mod mount;
pub mod probe;
pub mod proto;
pub mod reply;
pub mod request;
pub mod session;
pub mod table;

mod util;

/// Inode number, as seen by the kernel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ino(pub u64);

/// Validity period of a cached entry or attribute set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Ttl {
    seconds: u64,
    nanoseconds: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Timestamp {
    seconds: i64,
    nanoseconds: u32,
}

impl Ino {
    pub const NULL: Self = Ino(0);
    pub const ROOT: Self = Ino(proto::ROOT_ID);

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ino {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

impl Ttl {
    pub const NULL: Self = Ttl {
        seconds: 0,
        nanoseconds: 0,
    };

    pub const MAX: Self = Ttl {
        seconds: u64::MAX,
        nanoseconds: u32::MAX,
    };

    pub fn new(seconds: u64, nanoseconds: u32) -> Ttl {
        assert!(nanoseconds < 1_000_000_000);

        Ttl {
            seconds,
            nanoseconds,
        }
    }

    pub fn seconds(self) -> u64 {
        self.seconds
    }

    pub fn nanoseconds(self) -> u32 {
        self.nanoseconds
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Ttl {
            seconds: duration.as_secs(),
            nanoseconds: duration.subsec_nanos(),
        }
    }
}

impl Timestamp {
    pub fn new(seconds: i64, nanoseconds: u32) -> Self {
        Timestamp {
            seconds,
            nanoseconds,
        }
    }

    pub fn seconds(self) -> i64 {
        self.seconds
    }

    pub fn nanoseconds(self) -> u32 {
        self.nanoseconds
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(time: std::time::SystemTime) -> Self {
        match time.duration_since(std::time::UNIX_EPOCH) {
            Ok(after) => Timestamp {
                seconds: after.as_secs() as i64,
                nanoseconds: after.subsec_nanos(),
            },

            Err(before) => {
                let before = before.duration();
                let (seconds, nanoseconds) = match before.subsec_nanos() {
                    0 => (-(before.as_secs() as i64), 0),
                    nanos => (-(before.as_secs() as i64) - 1, 1_000_000_000 - nanos),
                };

                Timestamp {
                    seconds,
                    nanoseconds,
                }
            }
        }
    }
}

use std::{num::NonZeroUsize, time::Duration};

use crate::{proto, util::page_size};

/// Tunables of a [`crate::session::Session`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    workers: NonZeroUsize,
    grace_period: Duration,
    max_write: Option<u32>,

    // Size of each request buffer
    buffer_pages: NonZeroUsize,
}

impl SessionConfig {
    /// Upper bound of requests being served at the same time. One makes the session serve
    /// requests strictly one after another.
    #[must_use]
    pub fn workers(self, workers: NonZeroUsize) -> Self {
        SessionConfig { workers, ..self }
    }

    /// How long an unmount waits for in-flight requests before abandoning them.
    #[must_use]
    pub fn grace_period(self, grace_period: Duration) -> Self {
        SessionConfig {
            grace_period,
            ..self
        }
    }

    /// Largest write the kernel may send. Capped by what fits in a request buffer.
    #[must_use]
    pub fn max_write(self, max_write: u32) -> Self {
        SessionConfig {
            max_write: Some(max_write),
            ..self
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.get()
    }

    pub fn grace(&self) -> Duration {
        self.grace_period
    }

    pub fn buffer_size(&self) -> usize {
        (self.buffer_pages.get() * page_size()).max(proto::MIN_READ_SIZE)
    }

    /// Write size negotiated at handshake time.
    pub fn effective_max_write(&self) -> u32 {
        let overhead = proto::IN_HEADER_LEN + std::mem::size_of::<proto::WriteIn>();
        let fits = (self.buffer_size() - overhead) as u32;

        self.max_write.map_or(fits, |max_write| max_write.min(fits))
    }

    /// Pages per request the kernel may use, derived from the maximum write size.
    pub fn max_pages(&self) -> u16 {
        let page_size = page_size();
        let pages = (self.effective_max_write() as usize + page_size - 1) / page_size;

        pages.clamp(1, u16::MAX as usize) as u16
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            workers: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            grace_period: Duration::from_secs(30),
            max_write: None,

            // 128KiB of write payload plus a page for headers
            buffer_pages: NonZeroUsize::new(33).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

//! Inode and handle bookkeeping.
//!
//! The kernel holds a lookup count for every inode it knows about and a file handle for every
//! open. An inode leaves the table only once the kernel has forgotten every lookup *and* every
//! handle on it has been released. The root inode is pinned for the lifetime of the session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{error::TableError, Ino};

pub struct Table<I, H> {
    inner: Mutex<Inner<I, H>>,
}

#[derive(Debug)]
pub struct HandleEntry<H> {
    pub ino: Ino,
    pub flags: u32,
    pub cursor: u64,
    pub state: Arc<H>,
}

/// Outcome of [`Table::release()`].
#[derive(Debug)]
pub enum Released<I> {
    /// The kernel still holds this many lookups.
    Retained(u64),

    /// No lookups remain, but open handles keep the inode alive.
    Deferred,

    Removed(Arc<I>),
}

#[derive(Debug)]
pub struct Closed<I, H> {
    pub handle: HandleEntry<H>,

    /// Set if this was the last reference to an already forgotten inode.
    pub removed: Option<Arc<I>>,
}

pub struct ForceReleased<I, H> {
    pub handles: Vec<(u64, HandleEntry<H>)>,
    pub inodes: Vec<(Ino, Arc<I>)>,
}

struct Inner<I, H> {
    inodes: HashMap<Ino, InodeEntry<I>>,
    handles: HashMap<u64, HandleEntry<H>>,
    next_fh: u64,
}

struct InodeEntry<I> {
    state: Arc<I>,
    lookups: u64,
    open: u64,
}

impl<I, H> Table<I, H> {
    pub fn new(root: I) -> Self {
        let mut inodes = HashMap::new();
        inodes.insert(
            Ino::ROOT,
            InodeEntry {
                state: Arc::new(root),
                lookups: 1,
                open: 0,
            },
        );

        Table {
            inner: Mutex::new(Inner {
                inodes,
                handles: HashMap::new(),
                next_fh: 1,
            }),
        }
    }

    pub fn get(&self, ino: Ino) -> Option<Arc<I>> {
        self.lock()
            .inodes
            .get(&ino)
            .map(|entry| Arc::clone(&entry.state))
    }

    pub fn lookups(&self, ino: Ino) -> Option<u64> {
        self.lock().inodes.get(&ino).map(|entry| entry.lookups)
    }

    /// Records one more kernel reference to `ino`, creating the entry if it is new.
    pub fn lookup_or_create<F>(&self, ino: Ino, make: F) -> Arc<I>
    where
        F: FnOnce() -> I,
    {
        let mut inner = self.lock();
        let entry = inner.inodes.entry(ino).or_insert_with(|| InodeEntry {
            state: Arc::new(make()),
            lookups: 0,
            open: 0,
        });

        entry.lookups += 1;
        Arc::clone(&entry.state)
    }

    pub fn retain(&self, ino: Ino) -> Result<u64, TableError> {
        let mut inner = self.lock();
        let entry = inner
            .inodes
            .get_mut(&ino)
            .ok_or(TableError::UnknownInode(ino.as_raw()))?;

        entry.lookups += 1;
        Ok(entry.lookups)
    }

    pub fn release(&self, ino: Ino, count: u64) -> Result<Released<I>, TableError> {
        let mut inner = self.lock();
        let entry = inner
            .inodes
            .get_mut(&ino)
            .ok_or(TableError::UnknownInode(ino.as_raw()))?;

        if count > entry.lookups {
            return Err(TableError::Underflow {
                ino: ino.as_raw(),
                lookups: entry.lookups,
                count,
            });
        }

        entry.lookups -= count;
        match (entry.lookups, entry.open) {
            (0, 0) if ino != Ino::ROOT => {
                let removed = inner.inodes.remove(&ino).map(|entry| entry.state);
                Ok(removed.map_or(Released::Retained(0), Released::Removed))
            }

            (0, _) if ino != Ino::ROOT => Ok(Released::Deferred),
            (lookups, _) => Ok(Released::Retained(lookups)),
        }
    }

    pub fn open_handle(&self, ino: Ino, flags: u32, state: H) -> Result<u64, TableError> {
        let mut inner = self.lock();
        let entry = inner
            .inodes
            .get_mut(&ino)
            .ok_or(TableError::UnknownInode(ino.as_raw()))?;

        entry.open += 1;

        let fh = inner.next_fh;
        inner.next_fh += 1;

        inner.handles.insert(
            fh,
            HandleEntry {
                ino,
                flags,
                cursor: 0,
                state: Arc::new(state),
            },
        );

        Ok(fh)
    }

    pub fn handle(&self, fh: u64) -> Result<HandleEntry<H>, TableError> {
        self.lock()
            .handles
            .get(&fh)
            .cloned()
            .ok_or(TableError::StaleHandle(fh))
    }

    pub fn set_cursor(&self, fh: u64, offset: u64) -> Result<(), TableError> {
        let mut inner = self.lock();
        let handle = inner
            .handles
            .get_mut(&fh)
            .ok_or(TableError::StaleHandle(fh))?;

        handle.cursor = offset;
        Ok(())
    }

    pub fn close_handle(&self, fh: u64) -> Result<Closed<I, H>, TableError> {
        let mut inner = self.lock();
        let handle = inner
            .handles
            .remove(&fh)
            .ok_or(TableError::StaleHandle(fh))?;

        let ino = handle.ino;
        let unreferenced = match inner.inodes.get_mut(&ino) {
            Some(entry) => {
                entry.open -= 1;
                entry.open == 0 && entry.lookups == 0 && ino != Ino::ROOT
            }

            None => false,
        };

        let removed = if unreferenced {
            inner.inodes.remove(&ino).map(|entry| entry.state)
        } else {
            None
        };

        Ok(Closed { handle, removed })
    }

    /// Drops every handle and every inode except the root.
    pub fn force_release(&self) -> ForceReleased<I, H> {
        let mut inner = self.lock();

        let handles = inner.handles.drain().collect();
        let inodes = inner
            .inodes
            .drain()
            .map(|(ino, entry)| (ino, entry.state))
            .collect::<Vec<_>>();

        let mut released = ForceReleased {
            handles,
            inodes: Vec::with_capacity(inodes.len()),
        };

        for (ino, state) in inodes {
            if ino == Ino::ROOT {
                inner.inodes.insert(
                    ino,
                    InodeEntry {
                        state,
                        lookups: 1,
                        open: 0,
                    },
                );
            } else {
                released.inodes.push((ino, state));
            }
        }

        released
    }

    pub fn inode_count(&self) -> usize {
        self.lock().inodes.len()
    }

    pub fn handle_count(&self) -> usize {
        self.lock().handles.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<I, H>> {
        // No operation leaves Inner half-updated across a panic point
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<H> Clone for HandleEntry<H> {
    fn clone(&self) -> Self {
        HandleEntry {
            ino: self.ino,
            flags: self.flags,
            cursor: self.cursor,
            state: Arc::clone(&self.state),
        }
    }
}

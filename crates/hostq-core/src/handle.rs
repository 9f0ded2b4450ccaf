//! Opaque handles for binding layers.
//!
//! A C-style API hands out raw integers and must reject handles that were released or that name
//! the wrong kind of object. The registry stores weak references only; registering an object does
//! not keep it alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::command::CommandInner;
use crate::error::{QueueError, Result};
use crate::queue::{CommandQueue, QueueShared};
use crate::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Command,
    CommandQueue,
}

/// Raw handle value. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }
}

enum Entry {
    Command(Weak<CommandInner>),
    Queue(Weak<QueueShared>),
}

impl Entry {
    fn is_live(&self) -> bool {
        match self {
            Entry::Command(weak) => weak.strong_count() > 0,
            Entry::Queue(weak) => weak.strong_count() > 0,
        }
    }
}

pub struct HandleRegistry {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_command(&self, command: &Command) -> Handle {
        self.insert(Entry::Command(command.downgrade()))
    }

    pub fn register_queue(&self, queue: &CommandQueue) -> Handle {
        self.insert(Entry::Queue(Arc::downgrade(queue.shared())))
    }

    /// Resolve `handle` to a live command.
    pub fn command(&self, handle: Handle) -> Result<Command> {
        match self.lock().get(&handle.0) {
            Some(Entry::Command(weak)) => weak
                .upgrade()
                .map(Command::from_inner)
                .ok_or(QueueError::InvalidCommand("handle refers to a released command")),
            Some(Entry::Queue(_)) => Err(QueueError::InvalidCommand(
                "handle refers to a command queue",
            )),
            None => Err(QueueError::InvalidCommand("unknown handle")),
        }
    }

    /// Resolve `handle` to a live command queue.
    pub fn queue(&self, handle: Handle) -> Result<CommandQueue> {
        match self.lock().get(&handle.0) {
            Some(Entry::Queue(weak)) => weak
                .upgrade()
                .map(CommandQueue::from_shared)
                .ok_or(QueueError::InvalidCommandQueue),
            _ => Err(QueueError::InvalidCommandQueue),
        }
    }

    /// Kind of the object behind `handle`, if it is still alive.
    pub fn kind(&self, handle: Handle) -> Option<ObjectKind> {
        let entries = self.lock();
        let entry = entries.get(&handle.0).filter(|entry| entry.is_live())?;
        Some(match entry {
            Entry::Command(_) => ObjectKind::Command,
            Entry::Queue(_) => ObjectKind::CommandQueue,
        })
    }

    pub fn unregister(&self, handle: Handle) -> bool {
        self.lock().remove(&handle.0).is_some()
    }

    /// Forget every handle whose object is gone. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, entry: Entry) -> Handle {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(raw, entry);
        Handle(raw)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

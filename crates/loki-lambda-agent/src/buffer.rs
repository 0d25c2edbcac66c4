//! Bounded in-memory buffer of captured log entries.
//!
//! This module is the hand-off point between every producer in the agent
//! (the telemetry receiver, the agent's own logger) and the single consumer
//! (the lifecycle flush loop).
//!
//! # Batching Strategy
//!
//! Entries are held in arrival order until the flush loop pulls them:
//! 1. **Count-capped**: [`LogBuffer::flush`] takes up to N head entries
//! 2. **Byte-capped**: [`LogBuffer::flush_by_size`] additionally stops at a
//!    byte budget
//! 3. **Terminal**: [`LogBuffer::drain`] empties and closes the buffer at
//!    shutdown
//!
//! # Memory Management
//!
//! The buffer is bounded at construction. When full, the oldest entry is
//! evicted (dropped) so producers are never blocked and memory stays flat
//! under sustained log volume. Byte accounting tracks the exact sum of
//! [`LogEntry::size`] over the queued entries at all times.
//!
//! # Ready Signal
//!
//! Producers raise an edge-triggered, single-slot ready signal after an
//! enqueue. The signal carries no data and stores at most one pending edge;
//! a missed edge is recovered by the flush loop's periodic timer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

/// Classification of a captured log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Lambda platform events (start, runtimeDone, report, ...).
    Platform,
    /// Output written by the function's runtime.
    Function,
    /// Output written by an extension process.
    Extension,
}

impl EntryKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Platform => "platform",
            EntryKind::Function => "function",
            EntryKind::Extension => "extension",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single normalised log entry flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch. Converted to nanoseconds only at
    /// wire-format assembly time.
    pub timestamp: i64,
    /// The log line itself, UTF-8.
    pub message: String,
    /// Event classification.
    pub kind: EntryKind,
    /// Lambda request id for grouping, possibly empty.
    pub request_id: String,
}

impl LogEntry {
    /// Approximate byte size of the entry, used for all downstream byte
    /// accounting. The fixed 8 covers the timestamp.
    #[must_use]
    pub fn size(&self) -> usize {
        self.message.len() + self.kind.as_str().len() + self.request_id.len() + 8
    }
}

struct Inner {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    byte_size: usize,
    closed: bool,
}

impl Inner {
    // Drop-oldest discipline shared by add and add_batch.
    fn push(&mut self, entry: LogEntry) -> bool {
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                self.byte_size -= oldest.size();
            }
        }
        self.byte_size += entry.size();
        self.entries.push_back(entry);
        self.entries.len() >= self.capacity
    }
}

/// Thread-safe bounded FIFO of [`LogEntry`] with byte accounting.
///
/// All operations serialize on one internal lock; the ready signal lives
/// outside it. Once closed by [`LogBuffer::drain`], every mutation becomes a
/// no-op rather than an error.
pub struct LogBuffer {
    inner: Mutex<Inner>,
    ready: Notify,
}

impl LogBuffer {
    /// Creates a buffer holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                byte_size: 0,
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds one entry, evicting the oldest entry when at capacity.
    ///
    /// Returns `true` when the buffer is at capacity after the append, and
    /// `false` without side effect on a closed buffer.
    pub fn add(&self, entry: LogEntry) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        inner.push(entry)
    }

    /// Adds entries in order under a single lock acquisition, then raises
    /// one ready edge. No-op on a closed buffer.
    pub fn add_batch(&self, entries: Vec<LogEntry>) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            for entry in entries {
                inner.push(entry);
            }
        }
        self.ready.notify_one();
    }

    /// Removes and returns up to `batch_size` entries from the head, in
    /// insertion order.
    pub fn flush(&self, batch_size: usize) -> Vec<LogEntry> {
        let mut inner = self.lock();
        let count = batch_size.min(inner.entries.len());
        let batch: Vec<LogEntry> = inner.entries.drain(..count).collect();
        inner.byte_size -= batch.iter().map(LogEntry::size).sum::<usize>();
        batch
    }

    /// Removes head entries while both the count and byte budgets hold.
    ///
    /// A first entry that alone exceeds `max_bytes` is still taken, so one
    /// oversized entry cannot wedge the pipeline.
    pub fn flush_by_size(&self, batch_size: usize, max_bytes: usize) -> Vec<LogEntry> {
        let mut inner = self.lock();
        let mut count = 0;
        let mut bytes = 0;
        for entry in inner.entries.iter().take(batch_size) {
            let entry_size = entry.size();
            if bytes + entry_size > max_bytes && count > 0 {
                break;
            }
            bytes += entry_size;
            count += 1;
        }
        let batch: Vec<LogEntry> = inner.entries.drain(..count).collect();
        inner.byte_size -= bytes;
        batch
    }

    /// Returns every remaining entry in order and closes the buffer.
    /// Idempotent; later calls return an empty batch.
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.byte_size = 0;
        inner.entries.drain(..).collect()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of [`LogEntry::size`] over the queued entries.
    pub fn byte_size(&self) -> usize {
        self.lock().byte_size
    }

    /// Consumer end of the ready signal. `notify_one` stores at most one
    /// permit, giving the single-slot edge semantics the flush loop expects.
    #[must_use]
    pub fn ready(&self) -> &Notify {
        &self.ready
    }

    /// Raises the ready edge without blocking. Used by producers outside
    /// [`LogBuffer::add_batch`], e.g. the agent logger after a single entry.
    pub fn signal_ready(&self) {
        self.ready.notify_one();
    }
}

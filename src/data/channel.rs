//! Bounded sample channel between one producer and one consumer.
//!
//! A [`DataChannel`] assigns every pushed sample a channel-local sequence
//! number and hands samples out strictly in that order. Capacity is fixed at
//! construction, and so is the [`OverflowPolicy`]:
//!
//! - [`OverflowPolicy::Block`] (backpressure mode): `push` waits until the
//!   consumer makes room. Nothing is ever lost.
//! - [`OverflowPolicy::DropOldest`] (lossy mode): `push` never waits; the oldest
//!   unread sample is discarded and counted in [`DataChannel::dropped`].
//!
//! Fan-out is not the channel's job. A worker feeding a plot and a persistence
//! worker pushes the same `Arc<Sample>` into two channels.
//!
//! # Example
//!
//! ```rust
//! use spectro_daq::core::Sample;
//! use spectro_daq::data::{DataChannel, OverflowPolicy};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let live = DataChannel::new("live", 10, OverflowPolicy::DropOldest);
//! for i in 0..15 {
//!     live.push(Arc::new(Sample::scalar("cryo", i as f64))).await?;
//! }
//! assert_eq!(live.dropped(), 5);
//! let batch = live.pop_batch(100);
//! assert_eq!(batch.first().map(|s| s.seq), Some(5));
//! # Ok::<(), spectro_daq::error::DaqError>(())
//! # }).unwrap();
//! ```

use crate::core::{Sequenced, SharedSample};
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

/// What `push` does when the channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the producer until the consumer drains.
    #[default]
    Block,
    /// Discard the oldest unread sample and count the drop.
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Block => f.write_str("block"),
            OverflowPolicy::DropOldest => f.write_str("drop_oldest"),
        }
    }
}

/// Point-in-time counters of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Channel name.
    pub name: String,
    /// Fixed capacity.
    pub capacity: usize,
    /// Samples currently buffered.
    pub len: usize,
    /// Samples accepted since creation.
    pub pushed: u64,
    /// Samples discarded under [`OverflowPolicy::DropOldest`].
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Sequenced>,
    next_seq: u64,
    dropped: u64,
    closed: bool,
}

/// Bounded FIFO of sequenced samples.
pub struct DataChannel {
    name: String,
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

impl DataChannel {
    /// Create a channel. A capacity of zero is raised to one.
    pub fn new(name: impl Into<String>, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            policy,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                ..Inner::default()
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Append a sample and return its sequence number.
    ///
    /// Under [`OverflowPolicy::Block`] this waits for room. Fails with
    /// [`DaqError::ChannelClosed`] once the channel is closed, including while
    /// waiting.
    pub async fn push(&self, sample: SharedSample) -> AppResult<u64> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(DaqError::ChannelClosed(self.name.clone()));
                }
                let full = inner.queue.len() >= self.capacity;
                if !full || self.policy == OverflowPolicy::DropOldest {
                    if full {
                        if let Some(lost) = inner.queue.pop_front() {
                            inner.dropped += 1;
                            trace!(channel = %self.name, seq = lost.seq, "Dropped oldest sample");
                        }
                    }
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.queue.push_back(Sequenced { seq, sample });
                    drop(inner);
                    self.readable.notify_waiters();
                    return Ok(seq);
                }
            }

            notified.await;
        }
    }

    /// Remove up to `max_n` samples without waiting.
    pub fn pop_batch(&self, max_n: usize) -> Vec<Sequenced> {
        let batch: Vec<Sequenced> = {
            let mut inner = self.inner.lock();
            let n = max_n.min(inner.queue.len());
            inner.queue.drain(..n).collect()
        };
        if !batch.is_empty() {
            self.writable.notify_waiters();
        }
        batch
    }

    /// Wait for at least one sample and remove up to `max_n`.
    ///
    /// Returns an empty batch when `cancel` becomes `true`, or when the channel
    /// is closed and fully drained.
    pub async fn recv_batch(
        &self,
        max_n: usize,
        cancel: &mut watch::Receiver<bool>,
    ) -> Vec<Sequenced> {
        if max_n == 0 {
            return Vec::new();
        }
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.pop_batch(max_n);
            if !batch.is_empty() || self.is_closed() || *cancel.borrow() {
                return batch;
            }

            let cancelled = tokio::select! {
                _ = &mut notified => false,
                changed = cancel.wait_for(|stop| *stop) => changed.is_ok(),
            };
            if cancelled {
                return Vec::new();
            }
            if cancel.has_changed().is_err() {
                // Cancel sender is gone; only data or close can wake us now.
                notified.await;
            }
        }
    }

    /// Close the channel and wake every waiter. Buffered samples stay readable.
    pub fn close(&self) {
        let was_open = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        if was_open {
            debug!(channel = %self.name, "Channel closed");
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy chosen at construction.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Samples currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples discarded by the lossy policy.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ChannelStats {
        let inner = self.inner.lock();
        ChannelStats {
            name: self.name.clone(),
            capacity: self.capacity,
            len: inner.queue.len(),
            pushed: inner.next_seq,
            dropped: inner.dropped,
        }
    }
}

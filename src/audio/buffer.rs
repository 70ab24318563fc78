//! Buffers between the audio devices and the network loops
//!
//! - [`CaptureQueue`]: capture thread -> async send loop
//! - [`JitterAccumulator`]: per-sender payloads collected during one mix window
//! - [`PlaybackQueue`]: mixed frames -> playback thread, gated by a fill threshold

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Bounded queue of raw capture chunks. When full, the oldest chunk is
/// dropped so the sender always ships recent audio.
pub struct CaptureQueue {
    queue: ArrayQueue<Bytes>,
    notify: Notify,
    dropped: AtomicUsize,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Called from the capture thread
    pub fn push(&self, chunk: Bytes) {
        if self.queue.force_push(chunk).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.queue.pop()
    }

    /// Wait until a chunk may be available
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Payloads received during the current mix window, grouped by sender
#[derive(Debug, Default)]
pub struct JitterAccumulator {
    buckets: HashMap<SocketAddr, Vec<Bytes>>,
}

impl JitterAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, from: SocketAddr, payload: Bytes) {
        self.buckets.entry(from).or_default().push(payload);
    }

    /// Keep only senders accepted by `keep`
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&SocketAddr) -> bool,
    {
        self.buckets.retain(|addr, _| keep(addr));
    }

    /// Take every pending payload, leaving the accumulator empty
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.buckets
            .drain()
            .flat_map(|(_, payloads)| payloads)
            .collect()
    }

    pub fn senders(&self) -> usize {
        self.buckets.len()
    }

    pub fn pending(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Bounded FIFO of mixed frames. Playback only starts once `threshold`
/// frames are queued; after that it drains freely. A full queue drops its
/// oldest frame.
pub struct PlaybackQueue {
    queue: ArrayQueue<Bytes>,
    threshold: usize,
    started: AtomicBool,
    overflows: AtomicUsize,
}

impl PlaybackQueue {
    pub fn new(capacity: usize, threshold: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: ArrayQueue::new(capacity),
            threshold: threshold.min(capacity),
            started: AtomicBool::new(false),
            overflows: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, frame: Bytes) {
        if self.queue.force_push(frame).is_some() {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        if !self.started.load(Ordering::Relaxed) && self.queue.len() >= self.threshold {
            self.started.store(true, Ordering::Release);
            tracing::debug!("Playback buffer primed with {} frames", self.threshold);
        }
    }

    /// Next frame to play, or `None` while still priming or empty
    pub fn pop(&self) -> Option<Bytes> {
        if !self.is_started() {
            return None;
        }
        self.queue.pop()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflows(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }
}

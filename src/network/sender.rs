//! Audio send path
//!
//! A capture thread fills the [`CaptureQueue`]; an async loop drains it,
//! stamps each chunk with the offset-corrected clock and sends it to every
//! confirmed peer.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::CaptureQueue;
use crate::audio::device::CaptureSource;
use crate::network::clock::ClockOffset;
use crate::network::udp::TransportSocket;
use crate::protocol::AudioFrame;
use crate::session::state::PeerState;
use crate::session::StopSignal;

/// Read chunks from `source` into `queue` until `stop` is set.
/// Failed reads skip the chunk.
pub fn spawn_capture_loop(
    mut source: Box<dyn CaptureSource>,
    queue: Arc<CaptureQueue>,
    stop: StopSignal,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("capture-loop".into())
        .spawn(move || {
            tracing::debug!("Audio capture started");
            while !stop.is_stopped() {
                match source.read_chunk() {
                    Ok(chunk) if !chunk.is_empty() => queue.push(chunk),
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Skipped capture chunk: {}", e),
                }
            }
            tracing::info!("Audio capture stopped");
        })
}

/// Queue-to-network half of the send path
pub struct AudioSender {
    socket: Arc<TransportSocket>,
    peers: Arc<PeerState>,
    queue: Arc<CaptureQueue>,
    clock: ClockOffset,
    username: String,
    /// Upper bound between stop checks while the queue is idle
    idle_wait: Duration,
    frames_sent: AtomicU64,
}

impl AudioSender {
    pub fn new(
        socket: Arc<TransportSocket>,
        peers: Arc<PeerState>,
        queue: Arc<CaptureQueue>,
        clock: ClockOffset,
        username: impl Into<String>,
        idle_wait: Duration,
    ) -> Self {
        Self {
            socket,
            peers,
            queue,
            clock,
            username: username.into(),
            idle_wait,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Stamp one chunk and send it to every confirmed peer but ourselves.
    /// Returns the number of peers it went out to.
    pub async fn send_chunk(&self, chunk: Bytes) -> usize {
        let targets = self.peers.audio_targets(&self.username);
        if targets.is_empty() {
            return 0;
        }

        let wire = AudioFrame::new(self.clock.now(), chunk).serialize();
        let mut delivered = 0;
        for addr in targets {
            match self.socket.send(&wire, addr).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Audio to {} not sent: {}", addr, e),
            }
        }
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Drain the capture queue until the socket's stop signal is set
    pub async fn run(self: Arc<Self>) {
        let stop = self.socket.stop_signal().clone();
        tracing::debug!("Audio send loop started");

        while !stop.is_stopped() {
            match self.queue.pop() {
                Some(chunk) => {
                    self.send_chunk(chunk).await;
                }
                None => {
                    let _ = tokio::time::timeout(self.idle_wait, self.queue.notified()).await;
                }
            }
        }

        tracing::info!("Audio send stopped");
    }
}

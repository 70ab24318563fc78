//! Audio receive path: the single reader of the session socket
//!
//! Every datagram is classified once. Control tokens are answered and routed
//! to handshake tasks, audio from confirmed peers is accumulated per sender
//! and mixed into the playback queue once per mix window.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::{JitterAccumulator, PlaybackQueue};
use crate::audio::mix::mix;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::network::clock::{wall_clock, ClockOffset, LatencyGauge};
use crate::network::handshake::{handle_control, ControlRouter};
use crate::network::udp::{Received, TransportSocket};
use crate::protocol::{ControlToken, Datagram};
use crate::session::state::PeerState;

/// What one received datagram turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Timeout, nothing arrived
    Idle,
    Control { from: SocketAddr, token: ControlToken },
    /// Audio accepted into the accumulator
    Audio,
    /// Malformed, or audio from a sender we have no handshake with
    Discarded,
}

/// Receive-side state that does not touch the socket
pub struct ReceiveState {
    accumulator: JitterAccumulator,
    window: Duration,
    last_flush: Instant,
    clock: ClockOffset,
    latency: Arc<LatencyGauge>,
}

impl ReceiveState {
    pub fn new(window: Duration, clock: ClockOffset, latency: Arc<LatencyGauge>) -> Self {
        Self {
            accumulator: JitterAccumulator::new(),
            window,
            last_flush: Instant::now(),
            clock,
            latency,
        }
    }

    /// Classify a datagram and accumulate it if it is acceptable audio
    pub fn ingest(&mut self, received: Received, peers: &PeerState) -> Inbound {
        let Some(from) = received.addr else {
            return Inbound::Idle;
        };

        match Datagram::decode(received.payload) {
            Datagram::Empty => Inbound::Idle,
            Datagram::Control(token) => Inbound::Control { from, token },
            Datagram::Malformed { len } => {
                tracing::warn!("Discarding {} byte datagram from {}", len, from);
                Inbound::Discarded
            }
            Datagram::Audio(frame) => {
                if !peers.is_confirmed_addr(&from) {
                    tracing::debug!("Audio from unconfirmed sender {}", from);
                    return Inbound::Discarded;
                }
                let latency = self.clock.latency(frame.timestamp, wall_clock());
                tracing::trace!("Latency {}: {:.2} ms", from, latency * 1000.0);
                self.latency.record(latency);
                self.accumulator.push(from, frame.payload);
                Inbound::Audio
            }
        }
    }

    /// Once per window: drop buckets of senders that lost confirmation, mix
    /// the rest. `None` when the window has not elapsed or nothing was mixed.
    pub fn flush_if_due(&mut self, now: Instant, peers: &PeerState) -> Option<Bytes> {
        if now.duration_since(self.last_flush) < self.window {
            return None;
        }
        self.last_flush = now;

        self.accumulator.retain(|addr| peers.is_confirmed_addr(addr));
        let payloads = self.accumulator.drain();
        if payloads.is_empty() {
            return None;
        }

        let mixed = mix(&payloads);
        (!mixed.is_empty()).then(|| Bytes::from(mixed))
    }

    pub fn pending(&self) -> usize {
        self.accumulator.pending()
    }
}

/// The receive loop and everything it writes to
pub struct AudioReceiver {
    socket: Arc<TransportSocket>,
    peers: Arc<PeerState>,
    router: ControlRouter,
    playback: Arc<PlaybackQueue>,
    recv_timeout: Duration,
    state: ReceiveState,
}

impl AudioReceiver {
    pub fn new(
        socket: Arc<TransportSocket>,
        peers: Arc<PeerState>,
        router: ControlRouter,
        playback: Arc<PlaybackQueue>,
        recv_timeout: Duration,
        state: ReceiveState,
    ) -> Self {
        Self {
            socket,
            peers,
            router,
            playback,
            recv_timeout,
            state,
        }
    }

    /// Read until the socket's stop signal is set
    pub async fn run(mut self) {
        let stop = self.socket.stop_signal().clone();
        // Wake at least once per window so mixing keeps its cadence
        let wait = self.recv_timeout.min(self.state.window);
        tracing::debug!("Audio receive started");

        while !stop.is_stopped() {
            let received = self.socket.receive(MAX_DATAGRAM_SIZE, wait).await;
            if let Inbound::Control { from, token } = self.state.ingest(received, &self.peers) {
                handle_control(&self.socket, &self.router, from, token).await;
            }

            if let Some(mixed) = self.state.flush_if_due(Instant::now(), &self.peers) {
                self.playback.push(mixed);
            }
        }

        tracing::info!("Audio receive stopped");
    }
}

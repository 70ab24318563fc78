//! # P2P Voice Chat
//!
//! Channel-based voice chat where audio travels directly between peers over UDP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          RENDEZVOUS SERVICE (HTTP)                        │
//! │     /api/time   /api/channel/{id}/join   /members   /leave   /lan_ip      │
//! └──────────────────────────────────┬───────────────────────────────────────┘
//!                                    │ join, roster polls, LAN exchange
//! ┌──────────────────────────────────┼───────────────────────────────────────┐
//! │                               CLIENT                                      │
//! │  ┌──────────────┐   ┌───────────────────┐   ┌──────────────────────────┐ │
//! │  │ Clock Sync   │   │ Membership        │──>│ Peer Handshake tasks     │ │
//! │  │ (one shot)   │   │ Reconciler        │   │ (one per joining peer)   │ │
//! │  └──────┬───────┘   └─────────┬─────────┘   └────────────┬─────────────┘ │
//! │         │                     ▼                          ▼               │
//! │         │            ┌─────────────────────────────────────────┐          │
//! │         │            │  PeerState: Roster + ConfirmedPeerSet   │          │
//! │         │            └─────────┬───────────────────┬───────────┘          │
//! │         ▼                      ▼                   ▼                      │
//! │  ┌──────────────┐   ┌───────────────────┐   ┌───────────────────┐        │
//! │  │ Capture ───> │   │ Send Path         │   │ Receive Path      │        │
//! │  │ capture queue│──>│ timestamp + fanout│   │ demux, mix, queue │──> out │
//! │  └──────────────┘   └─────────┬─────────┘   └─────────┬─────────┘        │
//! │                               ▼                       ▲                   │
//! │                   ┌───────────────────────────────────┴──────┐            │
//! │                   │   Transport Socket (single UDP socket)   │            │
//! │                   └──────────────────────────────────────────┘            │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod rendezvous;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Sample rate of the PCM stream exchanged between peers
    pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

    /// Mono audio
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Sample frames per capture read
    pub const DEFAULT_CHUNK_FRAMES: usize = 2048;

    /// Bytes per PCM sample (16-bit signed)
    pub const SAMPLE_WIDTH: usize = 2;

    /// Default rendezvous host
    pub const DEFAULT_SERVER_HOST: &str = "vc.itzowo.net";

    /// Default rendezvous HTTP port
    pub const DEFAULT_SERVER_PORT: u16 = 80;

    /// Bounded wait for every socket read during a session
    pub const DEFAULT_RECV_TIMEOUT_MS: u64 = 100;

    /// Receive timeout used while waiting for the join acknowledgement
    pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2000;

    /// Pacing between hole-punch probes
    pub const DEFAULT_P2P_RETRY_MS: u64 = 100;

    /// Roster poll interval
    pub const DEFAULT_ROSTER_POLL_MS: u64 = 2000;

    /// How many times the LAN registration is polled before giving up
    pub const DEFAULT_LAN_POLL_ATTEMPTS: u32 = 10;

    /// Delay between LAN registration polls
    pub const DEFAULT_LAN_POLL_INTERVAL_MS: u64 = 1000;

    /// Confirm tokens sent once a handshake succeeds
    pub const DEFAULT_CONFIRM_BURST: usize = 10;

    /// Capture chunks buffered between the device and the network
    pub const CAPTURE_QUEUE_CAPACITY: usize = 50;

    /// Mixed frames buffered ahead of the playback device
    pub const PLAYBACK_QUEUE_CAPACITY: usize = 10;

    /// Frames required before playback begins
    pub const PLAYBACK_START_THRESHOLD: usize = 3;

    /// Mixing window in milliseconds
    pub const DEFAULT_MIX_WINDOW_MS: u64 = 20;

    /// Largest datagram we expect to read
    pub const MAX_DATAGRAM_SIZE: usize = 32_768;
}

//! One voice-chat session in a channel
//!
//! ```text
//! join ──> channel lookup ──> clock sync ──> first roster poll
//!                                                │
//!        ┌────────────┬──────────────┬───────────┼─────────────┐
//!        ▼            ▼              ▼           ▼             ▼
//!    reconciler   send loop    receive loop   capture      playback
//!   (+ handshakes)  (async)       (async)     (thread)      (thread)
//!        │            │              │           │             │
//!        └────────────┴──── StopSignal ──────────┴─────────────┘
//!                                 │
//!                               leave
//! ```
//!
//! Any startup failure aborts before the long-lived tasks start. Leave is
//! always attempted once the session ends, whatever the cause.

pub mod join;
pub mod reconciler;
pub mod state;
pub mod stop;

pub use join::{JoinPolicy, JoinState, Joined};
pub use reconciler::{diff, Reconciler, RosterDiff};
pub use state::{Peer, PeerState};
pub use stop::StopSignal;

use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;

use crate::audio::buffer::{CaptureQueue, PlaybackQueue};
use crate::audio::device::{CaptureSource, PlaybackSink};
use crate::audio::playback::spawn_playback_loop;
use crate::config::AppConfig;
use crate::error::SessionError;
use crate::network::clock::{ClockOffset, LatencyGauge};
use crate::network::handshake::{ControlRouter, HandshakeContext, HandshakeTasks};
use crate::network::lan::local_lan_ip;
use crate::network::receiver::{AudioReceiver, ReceiveState};
use crate::network::sender::{spawn_capture_loop, AudioSender};
use crate::network::udp::{TransportSocket, TransportStats};
use crate::rendezvous::Rendezvous;
use reconciler::LanSettings;

/// Audio endpoints handed to a session
pub struct AudioIo {
    pub capture: Box<dyn CaptureSource>,
    pub playback: Box<dyn PlaybackSink>,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local stop: Ctrl+C, `exit`, or the caller
    Stopped,
    /// Our entry vanished from the roster (kicked or channel closed)
    Removed,
}

/// Snapshot for the status line
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub members: usize,
    pub connected: usize,
    pub latency_ms: f64,
    pub transport: TransportStats,
}

pub struct Session<R: Rendezvous + ?Sized> {
    config: AppConfig,
    rendezvous: Arc<R>,
    channel_id: u32,
    stop: StopSignal,
    socket: Arc<TransportSocket>,
    peers: Arc<PeerState>,
    latency: Arc<LatencyGauge>,
}

impl<R: Rendezvous + ?Sized + 'static> Session<R> {
    /// Bind the session socket. Nothing is sent until [`Session::run`].
    pub fn new(
        config: AppConfig,
        rendezvous: Arc<R>,
        channel_id: u32,
        stop: StopSignal,
    ) -> crate::Result<Self> {
        let socket = Arc::new(TransportSocket::bind(&config.network, stop.clone())?);
        tracing::debug!("Session socket bound to {}", socket.local_addr()?);

        Ok(Self {
            config,
            rendezvous,
            channel_id,
            stop,
            socket,
            peers: Arc::new(PeerState::new()),
            latency: Arc::new(LatencyGauge::new()),
        })
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            members: self.peers.member_count(),
            connected: self.peers.confirmed_count(),
            latency_ms: self.latency.millis(),
            transport: self.socket.stats(),
        }
    }

    /// Run until stopped, then leave the channel
    pub async fn run(&self, audio: AudioIo) -> crate::Result<SessionEnd> {
        let result = self.run_until_stopped(audio).await;
        self.stop.stop();

        let username = &self.config.client.username;
        match self.rendezvous.leave_channel(self.channel_id, username).await {
            Ok(()) => tracing::info!("Left channel {}", self.channel_id),
            Err(e) => tracing::warn!("Leave request failed: {}", e),
        }

        result
    }

    async fn run_until_stopped(&self, audio: AudioIo) -> crate::Result<SessionEnd> {
        let client = &self.config.client;
        let network = &self.config.network;

        let policy = JoinPolicy {
            timeout: network.join_timeout(),
            max_attempts: network.join_max_attempts,
        };
        join::join_channel(
            &*self.rendezvous,
            &self.socket,
            &client.server_host,
            self.channel_id,
            &client.username,
            policy,
        )
        .await?;

        let info = self.rendezvous.channel_info(self.channel_id).await?;
        tracing::info!("Channel: {} ({})", info.name, info.id);

        let clock = ClockOffset::synchronize(&*self.rendezvous).await?;

        let router = ControlRouter::new();
        let tasks = Arc::new(HandshakeTasks::new(HandshakeContext {
            socket: self.socket.clone(),
            state: self.peers.clone(),
            router: router.clone(),
            retry: client.p2p_retry(),
            confirm_burst: network.confirm_burst,
            stop: self.stop.clone(),
        }));
        let lan = LanSettings {
            enabled: client.auto_lan,
            lan_ip: local_lan_ip(),
            poll_attempts: network.lan_poll_attempts,
            poll_interval: network.lan_poll_interval(),
        };
        let reconciler = Arc::new(Reconciler::new(
            self.rendezvous.clone(),
            tasks,
            self.channel_id,
            client.username.clone(),
            lan,
            network.roster_poll(),
        ));

        // Our public IP comes from our own roster entry
        if let Err(e) = reconciler.poll_once().await {
            tracing::warn!("Failed to get channel members: {}", e);
        }
        let self_ip = reconciler.self_ip().ok_or(SessionError::NotInRoster)?;
        tracing::info!("Public address {}:{}", self_ip, self.socket.port());

        self.run_components(audio, clock, router, reconciler.clone())
            .await;

        if reconciler.removed() {
            Ok(SessionEnd::Removed)
        } else {
            Ok(SessionEnd::Stopped)
        }
    }

    async fn run_components(
        &self,
        audio: AudioIo,
        clock: ClockOffset,
        router: ControlRouter,
        reconciler: Arc<Reconciler<R>>,
    ) {
        let audio_config = &self.config.audio;
        let capture_queue = Arc::new(CaptureQueue::new(audio_config.capture_queue_capacity));
        let playback_queue = Arc::new(PlaybackQueue::new(
            audio_config.playback_queue_capacity,
            audio_config.playback_start_threshold,
        ));

        let sender = Arc::new(AudioSender::new(
            self.socket.clone(),
            self.peers.clone(),
            capture_queue.clone(),
            clock,
            self.config.client.username.clone(),
            self.config.network.recv_timeout(),
        ));
        let receiver = AudioReceiver::new(
            self.socket.clone(),
            self.peers.clone(),
            router,
            playback_queue.clone(),
            self.config.network.recv_timeout(),
            ReceiveState::new(audio_config.mix_window(), clock, self.latency.clone()),
        );

        let tasks = vec![
            tokio::spawn(reconciler.run()),
            tokio::spawn(sender.run()),
            tokio::spawn(receiver.run()),
        ];

        let mut threads = Vec::new();
        match spawn_capture_loop(audio.capture, capture_queue, self.stop.clone()) {
            Ok(handle) => threads.push(handle),
            Err(e) => tracing::error!("Failed to start capture thread: {}", e),
        }
        match spawn_playback_loop(playback_queue, audio.playback, self.stop.clone()) {
            Ok(handle) => threads.push(handle),
            Err(e) => tracing::error!("Failed to start playback thread: {}", e),
        }

        tracing::info!("Voice chat started");
        self.stop.stopped().await;
        tracing::info!("Stopping voice chat");

        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!("Session task ended abnormally: {}", e);
            }
        }
        join_threads(threads).await;
    }
}

async fn join_threads(threads: Vec<ThreadHandle<()>>) {
    let joined = tokio::task::spawn_blocking(move || {
        for handle in threads {
            if handle.join().is_err() {
                tracing::warn!("Audio thread panicked");
            }
        }
    })
    .await;

    if let Err(e) = joined {
        tracing::warn!("Failed to join audio threads: {}", e);
    }
}

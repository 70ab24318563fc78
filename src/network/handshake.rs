//! NAT hole punching between two channel members
//!
//! ## Protocol
//!
//! ```text
//! Peer A                           Peer B
//!   │                                 │
//!   │──── hello ────────X (B's NAT drops it, but A's NAT now expects B)
//!   │                                 │
//!   │<─────────────────────── hello ──│
//!   │──── confirm ──────────────────>│   any hello is answered with confirm
//!   │                                 │
//!   │  A sees hello/confirm from B:   │
//!   │  Confirmed, burst of confirms ─>│   B's punching loop sees one of them
//!   │                                 │
//!   │<───────────── AUDIO ──────────>│
//! ```
//!
//! The receive path is the only reader of the socket during a session. It
//! answers every hello itself and publishes every control token on a
//! [`ControlRouter`], which is where handshake tasks look for replies.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::network::udp::TransportSocket;
use crate::protocol::{ControlToken, CONFIRM_TOKEN, HELLO_TOKEN};
use crate::session::state::{Peer, PeerState};
use crate::session::StopSignal;

/// Control token received from some address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEvent {
    pub from: SocketAddr,
    pub token: ControlToken,
}

/// Fan-out of received control tokens to handshake tasks
#[derive(Debug, Clone)]
pub struct ControlRouter {
    tx: broadcast::Sender<ControlEvent>,
}

impl ControlRouter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ControlEvent) {
        // No subscribers simply means no handshake is in progress
        let _ = self.tx.send(event);
    }
}

impl Default for ControlRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// React to a control datagram: any hello gets an immediate confirm, so a
/// peer that started punching after us can still finish its side.
pub async fn handle_control(
    socket: &TransportSocket,
    router: &ControlRouter,
    from: SocketAddr,
    token: ControlToken,
) {
    match token {
        ControlToken::Hello => {
            tracing::debug!("Received NAT punch probe from {}", from);
            if let Err(e) = socket.send(CONFIRM_TOKEN, from).await {
                tracing::debug!("Confirm to {} not sent: {}", from, e);
            }
        }
        ControlToken::Confirm => {
            tracing::debug!("Received NAT punch confirmation from {}", from);
        }
    }
    router.publish(ControlEvent { from, token });
}

/// Per-peer handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Probing the peer's address
    Punching,
    /// Both directions work; the peer is in the confirmed set
    Confirmed,
    /// The peer left, the task was cancelled, or the session stopped
    Departed,
}

/// Everything a handshake task needs
#[derive(Clone)]
pub struct HandshakeContext {
    pub socket: Arc<TransportSocket>,
    pub state: Arc<PeerState>,
    pub router: ControlRouter,
    /// Pacing between probes
    pub retry: Duration,
    /// Confirms sent after success
    pub confirm_burst: usize,
    pub stop: StopSignal,
}

impl HandshakeContext {
    fn should_abandon(&self, peer: &Peer, cancel: &StopSignal) -> bool {
        self.stop.is_stopped() || cancel.is_stopped() || !self.state.contains(&peer.member)
    }
}

/// Drive one peer from Punching to Confirmed or Departed
pub async fn run_handshake(ctx: HandshakeContext, peer: Peer, cancel: StopSignal) -> HandshakeState {
    tracing::debug!(
        "Starting P2P connection to {} ({})",
        peer.member.name,
        peer.addr
    );

    let mut inbox = ctx.router.subscribe();
    let mut state = HandshakeState::Punching;

    while state == HandshakeState::Punching {
        if ctx.should_abandon(&peer, &cancel) {
            tracing::debug!("Handshake with {} abandoned", peer.member.name);
            return HandshakeState::Departed;
        }

        if ctx.socket.send(HELLO_TOKEN, peer.addr).await.is_err() {
            return HandshakeState::Departed;
        }

        if wait_for_reply(&mut inbox, peer.addr, ctx.retry).await {
            state = HandshakeState::Confirmed;
        }
    }

    if !ctx.state.confirm(peer.clone()) && !ctx.state.is_confirmed(&peer.member) {
        // Removed from the roster between the reply and now
        return HandshakeState::Departed;
    }

    tracing::info!("Connected to {} ({})", peer.member.name, peer.addr);
    for _ in 0..ctx.confirm_burst {
        if ctx.socket.send(CONFIRM_TOKEN, peer.addr).await.is_err() {
            break;
        }
    }

    state
}

/// Wait up to `window` for a hello or confirm from `target`
async fn wait_for_reply(
    inbox: &mut broadcast::Receiver<ControlEvent>,
    target: SocketAddr,
    window: Duration,
) -> bool {
    let deadline = Instant::now() + window;

    loop {
        match tokio::time::timeout_at(deadline, inbox.recv()).await {
            Ok(Ok(event)) if event.from == target => return true,
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::debug!("Handshake inbox skipped {} events", skipped);
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                tokio::time::sleep_until(deadline).await;
                return false;
            }
            Err(_) => return false,
        }
    }
}

struct HandshakeTask {
    cancel: StopSignal,
    handle: JoinHandle<HandshakeState>,
}

/// In-flight handshake tasks keyed by member name, cancelled on departure
pub struct HandshakeTasks {
    ctx: HandshakeContext,
    tasks: DashMap<String, HandshakeTask>,
}

impl HandshakeTasks {
    pub fn new(ctx: HandshakeContext) -> Self {
        Self {
            ctx,
            tasks: DashMap::new(),
        }
    }

    pub fn context(&self) -> &HandshakeContext {
        &self.ctx
    }

    /// Start punching towards `peer`, replacing any older task for the same name
    pub fn spawn(&self, peer: Peer) {
        self.reap();
        self.cancel(&peer.member.name);

        let cancel = StopSignal::new();
        let handle = tokio::spawn(run_handshake(self.ctx.clone(), peer.clone(), cancel.clone()));
        self.tasks
            .insert(peer.member.name.clone(), HandshakeTask { cancel, handle });
    }

    /// Cancel the task for `name`, if one is running
    pub fn cancel(&self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some((_, task)) => {
                task.cancel.stop();
                true
            }
            None => false,
        }
    }

    /// Forget finished tasks
    pub fn reap(&self) {
        self.tasks.retain(|_, task| !task.handle.is_finished());
    }

    /// Number of handshakes still punching
    pub fn active(&self) -> usize {
        self.reap();
        self.tasks.len()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel everything and wait for the tasks to exit
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            if let Some((_, task)) = self.tasks.remove(&name) {
                task.cancel.stop();
                handles.push(task.handle);
            }
        }
        futures_util::future::join_all(handles).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::MAX_DATAGRAM_SIZE;
    use crate::network::udp::loopback_config;
    use crate::protocol::Datagram;
    use crate::rendezvous::Member;

    pub(crate) struct Node {
        pub ctx: HandshakeContext,
        pub me: Peer,
    }

    impl Node {
        pub fn new(name: &str) -> Self {
            let stop = StopSignal::new();
            let socket = Arc::new(TransportSocket::bind(&loopback_config(), stop.clone()).unwrap());
            let addr = socket.local_addr().unwrap();
            let me = Peer::new(Member::new(name, "127.0.0.1", addr.port()), addr);

            Self {
                ctx: HandshakeContext {
                    socket,
                    state: Arc::new(PeerState::new()),
                    router: ControlRouter::new(),
                    retry: Duration::from_millis(20),
                    confirm_burst: 3,
                    stop,
                },
                me,
            }
        }

        /// Minimal receive loop: control tokens only
        pub fn spawn_dispatcher(&self) -> JoinHandle<()> {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                while !ctx.stop.is_stopped() {
                    let received = ctx
                        .socket
                        .receive(MAX_DATAGRAM_SIZE, Duration::from_millis(10))
                        .await;
                    if let (Datagram::Control(token), Some(from)) =
                        (Datagram::decode(received.payload), received.addr)
                    {
                        handle_control(&ctx.socket, &ctx.router, from, token).await;
                    }
                }
            })
        }
    }

    #[tokio::test]
    async fn test_handshake_convergence() {
        let a = Node::new("alice");
        let b = Node::new("bob");
        a.ctx.state.add_member(b.me.member.clone());
        b.ctx.state.add_member(a.me.member.clone());

        let da = a.spawn_dispatcher();
        let db = b.spawn_dispatcher();

        let ha = tokio::spawn(run_handshake(a.ctx.clone(), b.me.clone(), StopSignal::new()));
        let hb = tokio::spawn(run_handshake(b.ctx.clone(), a.me.clone(), StopSignal::new()));

        // Lossless loopback: a handful of retry intervals is plenty
        let bound = Duration::from_millis(20 * 50);
        let ra = tokio::time::timeout(bound, ha).await.unwrap().unwrap();
        let rb = tokio::time::timeout(bound, hb).await.unwrap().unwrap();

        assert_eq!(ra, HandshakeState::Confirmed);
        assert_eq!(rb, HandshakeState::Confirmed);
        assert!(a.ctx.state.is_confirmed(&b.me.member));
        assert!(b.ctx.state.is_confirmed(&a.me.member));
        assert_eq!(a.ctx.state.confirmed_count(), 1);

        a.ctx.stop.stop();
        b.ctx.stop.stop();
        let _ = tokio::join!(da, db);
    }

    #[tokio::test]
    async fn test_one_sided_handshake_completes_via_confirm_reply() {
        // Bob only runs the receive-side dispatcher, never punches himself
        let a = Node::new("alice");
        let b = Node::new("bob");
        a.ctx.state.add_member(b.me.member.clone());

        let da = a.spawn_dispatcher();
        let db = b.spawn_dispatcher();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            run_handshake(a.ctx.clone(), b.me.clone(), StopSignal::new()),
        )
        .await
        .unwrap();
        assert_eq!(result, HandshakeState::Confirmed);

        a.ctx.stop.stop();
        b.ctx.stop.stop();
        let _ = tokio::join!(da, db);
    }

    #[tokio::test]
    async fn test_departed_member_is_not_confirmed() {
        let a = Node::new("alice");
        let b = Node::new("bob");

        // Bob is not in Alice's roster
        let result = run_handshake(a.ctx.clone(), b.me.clone(), StopSignal::new()).await;
        assert_eq!(result, HandshakeState::Departed);
        assert_eq!(a.ctx.state.confirmed_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_departs() {
        let a = Node::new("alice");
        // Unreachable peer: nothing listens on this socket's dispatcher
        let silent = Node::new("silent");
        a.ctx.state.add_member(silent.me.member.clone());

        let tasks = HandshakeTasks::new(a.ctx.clone());
        tasks.spawn(silent.me.clone());
        assert!(tasks.is_active("silent"));

        assert!(tasks.cancel("silent"));
        assert!(!tasks.cancel("silent"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tasks.active(), 0);
        assert!(!a.ctx.state.is_confirmed(&silent.me.member));
    }

    #[tokio::test]
    async fn test_shutdown_joins_tasks() {
        let a = Node::new("alice");
        let silent = Node::new("silent");
        a.ctx.state.add_member(silent.me.member.clone());

        let tasks = HandshakeTasks::new(a.ctx.clone());
        tasks.spawn(silent.me.clone());

        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown())
            .await
            .unwrap();
        assert_eq!(tasks.active(), 0);
    }
}

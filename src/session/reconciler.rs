//! Roster polling and reconciliation
//!
//! Each poll diffs the server roster against the local mirror. New members
//! get a handshake task (optionally over a LAN route), departed members are
//! torn down, and our own departure stops the session.

use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RendezvousError;
use crate::network::handshake::HandshakeTasks;
use crate::network::lan::is_same_lan;
use crate::protocol::HELLO_TOKEN;
use crate::rendezvous::{LanRegistration, Member, Rendezvous};
use crate::session::state::Peer;

/// Members that appeared and disappeared between two rosters, in roster order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub joined: Vec<Member>,
    pub departed: Vec<Member>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed.is_empty()
    }
}

/// Set difference on structural equality in both directions
pub fn diff(local: &[Member], remote: &[Member]) -> RosterDiff {
    let local_set: HashSet<&Member> = local.iter().collect();
    let remote_set: HashSet<&Member> = remote.iter().collect();

    let mut seen = HashSet::new();
    let joined = remote
        .iter()
        .filter(|m| !local_set.contains(m) && seen.insert(*m))
        .cloned()
        .collect();
    let departed = local
        .iter()
        .filter(|m| !remote_set.contains(m))
        .cloned()
        .collect();

    RosterDiff { joined, departed }
}

/// LAN short-circuit settings
#[derive(Debug, Clone)]
pub struct LanSettings {
    pub enabled: bool,
    /// Our address on the local network
    pub lan_ip: IpAddr,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
}

pub struct Reconciler<R: Rendezvous + ?Sized> {
    rendezvous: Arc<R>,
    tasks: Arc<HandshakeTasks>,
    channel_id: u32,
    username: String,
    lan: LanSettings,
    poll_interval: Duration,
    /// Public IP the server sees us on, learned from our own roster entry
    self_ip: RwLock<Option<String>>,
    /// Set once our own entry left the roster
    removed: AtomicBool,
}

impl<R: Rendezvous + ?Sized> Reconciler<R> {
    pub fn new(
        rendezvous: Arc<R>,
        tasks: Arc<HandshakeTasks>,
        channel_id: u32,
        username: impl Into<String>,
        lan: LanSettings,
        poll_interval: Duration,
    ) -> Self {
        Self {
            rendezvous,
            tasks,
            channel_id,
            username: username.into(),
            lan,
            poll_interval,
            self_ip: RwLock::new(None),
            removed: AtomicBool::new(false),
        }
    }

    pub fn self_ip(&self) -> Option<String> {
        self.self_ip.read().clone()
    }

    /// Whether the server dropped us from the channel
    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub fn tasks(&self) -> &Arc<HandshakeTasks> {
        &self.tasks
    }

    /// Fetch the roster once and reconcile against it
    pub async fn poll_once(&self) -> Result<RosterDiff, RendezvousError> {
        let remote = self.rendezvous.members(self.channel_id).await?;
        Ok(self.reconcile(&remote).await)
    }

    /// Apply one server roster to the local state
    pub async fn reconcile(&self, remote: &[Member]) -> RosterDiff {
        let ctx = self.tasks.context();
        if self.removed() || ctx.stop.is_stopped() {
            return RosterDiff::default();
        }
        let changes = diff(&ctx.state.roster(), remote);
        if changes.is_empty() {
            return changes;
        }

        // Departures first: a member that rejoined on a new port shares its
        // task key with the old entry
        for member in &changes.departed {
            ctx.state.remove_member(member);
            self.tasks.cancel(&member.name);

            if member.name == self.username {
                tracing::warn!("Removed from channel {}", self.channel_id);
                self.removed.store(true, Ordering::Release);
                ctx.stop.stop();
                return changes;
            }
            tracing::info!("Member left: {} ({}:{})", member.name, member.ip, member.port);
        }

        // Our own entry first, the LAN check needs our public IP
        if let Some(me) = changes.joined.iter().find(|m| m.name == self.username) {
            *self.self_ip.write() = Some(me.ip.clone());
        }

        for member in &changes.joined {
            if !ctx.state.add_member(member.clone()) {
                continue;
            }
            if member.name == self.username {
                continue;
            }

            tracing::info!("New member: {} ({}:{})", member.name, member.ip, member.port);
            let Some(addr) = self.route_to(member).await else {
                tracing::warn!("Member {} has an unusable address {}", member.name, member.ip);
                continue;
            };

            if let Err(e) = ctx.socket.send(HELLO_TOKEN, addr).await {
                tracing::debug!("Initial hello to {} not sent: {}", addr, e);
            }
            self.tasks.spawn(Peer::new(member.clone(), addr));
        }

        changes
    }

    /// Address to punch towards: the LAN one when the short-circuit applies
    async fn route_to(&self, member: &Member) -> Option<SocketAddr> {
        let public = member.addr()?;
        if !self.lan.enabled {
            return Some(public);
        }

        let Some(self_ip) = self.self_ip() else {
            return Some(public);
        };
        if !is_same_lan(&self_ip, &member.ip) {
            return Some(public);
        }

        tracing::info!("{} shares our public prefix, looking up its LAN address", member.name);
        match self.lan_lookup(&self_ip, member).await {
            Some(lan_addr) => {
                tracing::info!("Using LAN route to {} ({})", member.name, lan_addr);
                Some(lan_addr)
            }
            None => {
                tracing::warn!(
                    "No LAN registration from {} after {} polls, using public address",
                    member.name,
                    self.lan.poll_attempts
                );
                Some(public)
            }
        }
    }

    /// Register our LAN address and poll until `member`'s registration shows up
    async fn lan_lookup(&self, self_ip: &str, member: &Member) -> Option<SocketAddr> {
        let ctx = self.tasks.context();
        let registration = LanRegistration {
            name: self.username.clone(),
            ip: self_ip.to_string(),
            lan_ip: self.lan.lan_ip.to_string(),
            port: ctx.socket.port(),
        };

        for attempt in 1..=self.lan.poll_attempts {
            if ctx.stop.is_stopped() {
                return None;
            }

            match self
                .rendezvous
                .register_lan_ip(self.channel_id, &registration)
                .await
            {
                Ok(registrations) => {
                    let found = registrations
                        .iter()
                        .find(|r| r.name == member.name)
                        .and_then(|r| r.lan_addr());
                    if found.is_some() {
                        return found;
                    }
                    tracing::debug!("LAN poll {}: {} not registered yet", attempt, member.name);
                }
                Err(e) => tracing::warn!("LAN registration failed: {}", e),
            }

            if attempt < self.lan.poll_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.lan.poll_interval) => {}
                    _ = ctx.stop.stopped() => return None,
                }
            }
        }

        None
    }

    /// Poll until the session stops. Fetch failures are retried next cycle.
    pub async fn run(self: Arc<Self>) {
        let stop = self.tasks.context().stop.clone();
        tracing::debug!("Roster polling every {:?}", self.poll_interval);

        while !stop.is_stopped() {
            if let Err(e) = self.poll_once().await {
                tracing::warn!("Failed to get channel members: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.stopped() => break,
            }
        }

        self.tasks.shutdown().await;
        tracing::debug!("Roster polling stopped");
    }
}

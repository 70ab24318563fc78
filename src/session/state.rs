//! Roster mirror and confirmed-peer set behind one lock
//!
//! Invariants kept here:
//! - a member appears at most once in the roster
//! - every confirmed peer is a roster member
//! - removing a member also drops its confirmation

use parking_lot::RwLock;
use std::net::SocketAddr;

use crate::rendezvous::Member;

/// A roster member together with the address audio is exchanged on.
/// The address is the public one, or the LAN one after a LAN short-circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub member: Member,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(member: Member, addr: SocketAddr) -> Self {
        Self { member, addr }
    }
}

#[derive(Debug, Default)]
struct Inner {
    roster: Vec<Member>,
    confirmed: Vec<Peer>,
}

/// Shared membership state
#[derive(Debug, Default)]
pub struct PeerState {
    inner: RwLock<Inner>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the local roster
    pub fn roster(&self) -> Vec<Member> {
        self.inner.read().roster.clone()
    }

    pub fn contains(&self, member: &Member) -> bool {
        self.inner.read().roster.contains(member)
    }

    /// Append a member; `false` if it is already present
    pub fn add_member(&self, member: Member) -> bool {
        let mut inner = self.inner.write();
        if inner.roster.contains(&member) {
            return false;
        }
        inner.roster.push(member);
        true
    }

    /// Drop a member and its confirmation; `false` if it was not present
    pub fn remove_member(&self, member: &Member) -> bool {
        let mut inner = self.inner.write();
        let before = inner.roster.len();
        inner.roster.retain(|m| m != member);
        inner.confirmed.retain(|p| &p.member != member);
        inner.roster.len() != before
    }

    /// Record a completed handshake. Idempotent, and refused for members
    /// that already left the roster.
    pub fn confirm(&self, peer: Peer) -> bool {
        let mut inner = self.inner.write();
        if !inner.roster.contains(&peer.member) {
            return false;
        }
        if inner.confirmed.iter().any(|p| p.member == peer.member) {
            return false;
        }
        inner.confirmed.push(peer);
        true
    }

    pub fn is_confirmed(&self, member: &Member) -> bool {
        self.inner.read().confirmed.iter().any(|p| &p.member == member)
    }

    pub fn is_confirmed_addr(&self, addr: &SocketAddr) -> bool {
        self.inner.read().confirmed.iter().any(|p| &p.addr == addr)
    }

    pub fn confirmed(&self) -> Vec<Peer> {
        self.inner.read().confirmed.clone()
    }

    /// Addresses audio should be sent to, excluding our own entry
    pub fn audio_targets(&self, self_name: &str) -> Vec<SocketAddr> {
        self.inner
            .read()
            .confirmed
            .iter()
            .filter(|p| p.member.name != self_name)
            .map(|p| p.addr)
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.inner.read().roster.len()
    }

    pub fn confirmed_count(&self) -> usize {
        self.inner.read().confirmed.len()
    }
}

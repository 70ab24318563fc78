//! Channel join: HTTP port request, then a UDP registration acknowledged by the server
//!
//! ```text
//! Requesting ──join port──> AwaitingAck ──hello──> Joined
//!                               │  ▲
//!                      timeout  └──┘ resend
//!                               │
//!                               └──other reply / cancel / exhausted──> Failed
//! ```
//!
//! The UDP registration is what lets the server learn our public address.

use std::net::SocketAddr;
use std::time::Duration;

use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::{NetworkError, SessionError};
use crate::network::udp::TransportSocket;
use crate::protocol::{ControlToken, JoinPacket};
use crate::rendezvous::Rendezvous;

/// Join progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Requesting,
    AwaitingAck,
    Joined,
    Failed,
}

/// Parameters of the UDP registration retry loop
#[derive(Debug, Clone, Copy)]
pub struct JoinPolicy {
    /// Wait for an acknowledgement before resending
    pub timeout: Duration,
    /// `None` retries until the stop signal is set
    pub max_attempts: Option<u32>,
}

/// Result of a successful join
#[derive(Debug, Clone, Copy)]
pub struct Joined {
    pub server: SocketAddr,
    /// Registrations sent, including the acknowledged one
    pub attempts: u32,
}

/// Resolve the rendezvous host to the address of its channel join port
pub async fn resolve_server(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::AddressResolution(format!("{}: {}", host, e)))?;

    // The transport socket is IPv4
    let mut fallback = None;
    for addr in addrs.by_ref() {
        if addr.is_ipv4() {
            return Ok(addr);
        }
        fallback.get_or_insert(addr);
    }
    fallback.ok_or_else(|| NetworkError::AddressResolution(host.to_string()))
}

/// Run the whole join: ask the rendezvous service for the channel's UDP
/// port, then register over UDP until the server acknowledges.
pub async fn join_channel<R: Rendezvous + ?Sized>(
    rendezvous: &R,
    socket: &TransportSocket,
    server_host: &str,
    channel_id: u32,
    username: &str,
    policy: JoinPolicy,
) -> crate::Result<Joined> {
    tracing::debug!("Join state: {:?}", JoinState::Requesting);
    let port = rendezvous.join_channel(channel_id).await?;
    let server = resolve_server(server_host, port).await?;
    tracing::info!("Registering in channel {} via {}", channel_id, server);

    let packet = JoinPacket::new(channel_id, username);
    Ok(await_ack(socket, server, &packet, policy).await?)
}

/// Send `packet` to `server` until it answers with the hello token
pub async fn await_ack(
    socket: &TransportSocket,
    server: SocketAddr,
    packet: &JoinPacket,
    policy: JoinPolicy,
) -> Result<Joined, SessionError> {
    let bytes = packet.serialize();
    let stop = socket.stop_signal();
    let mut attempts = 0u32;
    let mut state = JoinState::AwaitingAck;
    tracing::debug!("Join state: {:?}", state);

    while state == JoinState::AwaitingAck {
        if stop.is_stopped() {
            return Err(SessionError::JoinCancelled);
        }
        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                tracing::debug!("Join state: {:?}", JoinState::Failed);
                return Err(SessionError::JoinAttemptsExhausted(attempts));
            }
        }

        attempts += 1;
        if let Err(e) = socket.send(&bytes, server).await {
            if matches!(e, NetworkError::SocketClosed) {
                return Err(SessionError::JoinCancelled);
            }
            tracing::warn!("Join attempt {} not sent: {}", attempts, e);
        }

        let received = socket.receive(MAX_DATAGRAM_SIZE, policy.timeout).await;
        let Some(from) = received.addr else {
            tracing::debug!("No join acknowledgement yet (attempt {})", attempts);
            continue;
        };
        if received.is_empty() {
            continue;
        }
        if from != server {
            // Replies may come from another address of the same server
            tracing::debug!("Join reply from {} (expected {})", from, server);
        }

        state = match ControlToken::parse(&received.payload) {
            Some(ControlToken::Hello) => JoinState::Joined,
            _ => {
                let reason = String::from_utf8_lossy(&received.payload).into_owned();
                tracing::debug!("Join state: {:?}", JoinState::Failed);
                return Err(SessionError::JoinRejected(reason));
            }
        };
    }

    tracing::info!("Joined after {} attempt(s)", attempts);
    Ok(Joined { server, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::loopback_config;
    use crate::protocol::HELLO_TOKEN;
    use crate::session::StopSignal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: Option<u32>) -> JoinPolicy {
        JoinPolicy {
            timeout: Duration::from_millis(50),
            max_attempts,
        }
    }

    /// Server stand-in: stays silent until registration number `ack_on`,
    /// then answers with `reply`
    fn spawn_responder(ack_on: u32, reply: &'static [u8]) -> (SocketAddr, Arc<AtomicU32>) {
        let socket = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();

        tokio::spawn(async move {
            loop {
                let received = socket.receive(1024, Duration::from_secs(5)).await;
                let Some(from) = received.addr else { break };
                if JoinPacket::deserialize(&received.payload).is_none() {
                    continue;
                }
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == ack_on {
                    let _ = socket.send(reply, from).await;
                    break;
                }
            }
        });

        (addr, seen)
    }

    #[tokio::test]
    async fn test_joined_on_exactly_third_attempt() {
        let (server, seen) = spawn_responder(3, HELLO_TOKEN);
        let client = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        let packet = JoinPacket::new(12345, "alice");

        let joined = await_ack(&client, server, &packet, policy(Some(10)))
            .await
            .unwrap();

        assert_eq!(joined.attempts, 3);
        assert_eq!(joined.server, server);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_reply_is_rejection() {
        let (server, _) = spawn_responder(1, b"Channel not found");
        let client = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        let packet = JoinPacket::new(1, "alice");

        let result = await_ack(&client, server, &packet, policy(None)).await;
        match result {
            Err(SessionError::JoinRejected(reason)) => assert_eq!(reason, "Channel not found"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejection_from_other_address() {
        let (server, _) = spawn_responder(u32::MAX, HELLO_TOKEN);
        let client = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        let client_addr = client.local_addr().unwrap();
        let packet = JoinPacket::new(1, "alice");

        let other = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        other.send(b"Channel is full", client_addr).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            await_ack(&client, server, &packet, policy(None)),
        )
        .await
        .unwrap();
        match result {
            Err(SessionError::JoinRejected(reason)) => assert_eq!(reason, "Channel is full"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let (server, _) = spawn_responder(u32::MAX, HELLO_TOKEN);
        let client = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        let packet = JoinPacket::new(1, "alice");

        let result = await_ack(&client, server, &packet, policy(Some(2))).await;
        assert!(matches!(result, Err(SessionError::JoinAttemptsExhausted(2))));
    }

    #[tokio::test]
    async fn test_unbounded_join_is_cancellable() {
        let (server, _) = spawn_responder(u32::MAX, HELLO_TOKEN);
        let stop = StopSignal::new();
        let client = TransportSocket::bind(&loopback_config(), stop.clone()).unwrap();
        let packet = JoinPacket::new(1, "alice");

        let canceller = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                stop.stop();
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            await_ack(&client, server, &packet, policy(None)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(SessionError::JoinCancelled)));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_server("localhost", 9000).await.unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_loopback());
    }
}

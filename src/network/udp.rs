//! The one UDP socket a session runs on
//!
//! Sends are fire-and-forget and every receive is bounded, so the loops that
//! share the socket can keep checking the stop signal.

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket as TokioUdpSocket;

use crate::config::NetworkConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::session::StopSignal;

/// Create a configured UDP socket bound to an ephemeral port
pub fn create_socket(config: &NetworkConfig) -> Result<StdUdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    configure_socket(&socket, config)?;

    let addr: SocketAddr = format!("{}:0", config.bind_address)
        .parse()
        .map_err(|e: std::net::AddrParseError| NetworkError::BindFailed(e.to_string()))?;

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    let std_socket: StdUdpSocket = socket.into();
    std_socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(std_socket)
}

fn configure_socket(socket: &Socket, config: &NetworkConfig) -> Result<(), NetworkError> {
    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set send buffer: {}", e)))?;

    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set recv buffer: {}", e)))?;

    Ok(())
}

/// A datagram read from the socket. Timeouts yield an empty payload and no address.
#[derive(Debug, Clone)]
pub struct Received {
    pub payload: Bytes,
    pub addr: Option<SocketAddr>,
}

impl Received {
    pub fn empty() -> Self {
        Self {
            payload: Bytes::new(),
            addr: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Shared transport socket
pub struct TransportSocket {
    socket: TokioUdpSocket,
    stop: StopSignal,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransportSocket {
    /// Bind to an ephemeral local port
    pub fn bind(config: &NetworkConfig, stop: StopSignal) -> Result<Self, NetworkError> {
        let std_socket = create_socket(config)?;
        let socket = TokioUdpSocket::from_std(std_socket)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        Ok(Self {
            socket,
            stop,
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    /// Local port the rendezvous server and peers see us on (before NAT)
    pub fn port(&self) -> u16 {
        self.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Best-effort send; refuses once the session has stopped
    pub async fn send(&self, data: &[u8], addr: SocketAddr) -> Result<(), NetworkError> {
        if self.stop.is_stopped() {
            return Err(NetworkError::SocketClosed);
        }

        let sent = self
            .socket
            .send_to(data, addr)
            .await
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;

        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Wait at most `timeout` for one datagram of up to `max_bytes`
    pub async fn receive(&self, max_bytes: usize, timeout: Duration) -> Received {
        if self.stop.is_stopped() {
            return Received::empty();
        }

        let mut buf = vec![0u8; max_bytes.min(MAX_DATAGRAM_SIZE)];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((size, addr))) => {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                buf.truncate(size);
                Received {
                    payload: Bytes::from(buf),
                    addr: Some(addr),
                }
            }
            Ok(Err(e)) => {
                // ICMP port-unreachable surfaces here on some platforms
                tracing::debug!("Receive error: {}", e);
                Received::empty()
            }
            Err(_) => Received::empty(),
        }
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Transport counters
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
}

#[cfg(test)]
pub(crate) fn loopback_config() -> NetworkConfig {
    NetworkConfig {
        bind_address: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_creation() {
        let socket = create_socket(&loopback_config());
        assert!(socket.is_ok());
        assert_ne!(socket.unwrap().local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        let b = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();

        a.send(b"ping", b.local_addr().unwrap()).await.unwrap();
        let received = b.receive(1024, Duration::from_secs(1)).await;

        assert_eq!(received.payload.as_ref(), b"ping");
        assert_eq!(received.addr, Some(a.local_addr().unwrap()));
        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(b.stats().bytes_received, 4);
    }

    #[tokio::test]
    async fn test_receive_times_out_empty() {
        let socket = TransportSocket::bind(&loopback_config(), StopSignal::new()).unwrap();
        let received = socket.receive(1024, Duration::from_millis(20)).await;
        assert!(received.is_empty());
        assert!(received.addr.is_none());
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let stop = StopSignal::new();
        let socket = TransportSocket::bind(&loopback_config(), stop.clone()).unwrap();
        let target = socket.local_addr().unwrap();

        stop.stop();
        assert!(matches!(
            socket.send(b"x", target).await,
            Err(NetworkError::SocketClosed)
        ));
        assert!(socket.receive(16, Duration::from_millis(10)).await.is_empty());
    }
}

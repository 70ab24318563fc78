//! UDP transport for peer audio
//!
//! - One shared socket per session
//! - Hole punching and the control-token router
//! - Audio send and receive paths
//! - Clock offset and LAN helpers

pub mod clock;
pub mod handshake;
pub mod lan;
pub mod receiver;
pub mod sender;
pub mod udp;

pub use clock::{ClockOffset, LatencyGauge};
pub use handshake::{ControlRouter, HandshakeContext, HandshakeState, HandshakeTasks};
pub use receiver::{AudioReceiver, ReceiveState};
pub use sender::{spawn_capture_loop, AudioSender};
pub use udp::{create_socket, TransportSocket, TransportStats};

//! Wire formats for everything that travels over the UDP socket
//!
//! ## Datagram kinds
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Control: "hello"    hole-punch probe, also the server's join ack     │
//! │ Control: "confirm"  handshake finalization                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ Audio:  ┌──────────────────────┬────────────────────────────────┐    │
//! │         │ Timestamp (8)        │ PCM payload (even byte count)  │    │
//! │         │ f64 BE, unix seconds │ i16 LE mono samples            │    │
//! │         └──────────────────────┴────────────────────────────────┘    │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ Join:   ┌──────────────┬──────────────┬──────────────────────┐       │
//! │         │ Channel (4)  │ NameLen (4)  │ Username (UTF-8)     │       │
//! │         │ u32 BE       │ u32 BE       │ NameLen bytes        │       │
//! │         └──────────────┴──────────────┴──────────────────────┘       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control tokens are compared by exact payload, so they never collide with
//! audio frames (which always carry at least the 8-byte header plus data
//! produced by the send path).

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Hole-punch probe; the rendezvous server also uses it to acknowledge a join
pub const HELLO_TOKEN: &[u8] = b"hello";

/// Sent back once a peer has seen our probe
pub const CONFIRM_TOKEN: &[u8] = b"confirm";

/// Audio header size in bytes
pub const AUDIO_HEADER_SIZE: usize = 8;

/// Join header size in bytes
pub const JOIN_HEADER_SIZE: usize = 8;

/// Handshake control tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    Hello,
    Confirm,
}

impl ControlToken {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Hello => HELLO_TOKEN,
            Self::Confirm => CONFIRM_TOKEN,
        }
    }

    /// Match a payload against the known tokens
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data == HELLO_TOKEN {
            Some(Self::Hello)
        } else if data == CONFIRM_TOKEN {
            Some(Self::Confirm)
        } else {
            None
        }
    }
}

/// Timestamped PCM frame
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Sender's offset-corrected wall clock, seconds since epoch
    pub timestamp: f64,

    /// Raw 16-bit little-endian PCM
    pub payload: Bytes,
}

impl AudioFrame {
    pub fn new(timestamp: f64, payload: Bytes) -> Self {
        Self { timestamp, payload }
    }

    /// Serialize frame for network transmission
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(AUDIO_HEADER_SIZE + self.payload.len());
        buf.put_f64(self.timestamp);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Deserialize frame from bytes; `None` when shorter than the header
    pub fn deserialize(mut data: Bytes) -> Option<Self> {
        if data.len() < AUDIO_HEADER_SIZE {
            return None;
        }

        let timestamp = data.get_f64();
        Some(Self {
            timestamp,
            payload: data,
        })
    }
}

/// Registration packet sent to the channel's UDP port on the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPacket {
    pub channel_id: u32,
    pub username: String,
}

impl JoinPacket {
    pub fn new(channel_id: u32, username: impl Into<String>) -> Self {
        Self {
            channel_id,
            username: username.into(),
        }
    }

    pub fn serialize(&self) -> Bytes {
        let name = self.username.as_bytes();
        let mut buf = BytesMut::with_capacity(JOIN_HEADER_SIZE + name.len());
        buf.put_u32(self.channel_id);
        buf.put_u32(name.len() as u32);
        buf.put_slice(name);
        buf.freeze()
    }

    pub fn deserialize(mut data: &[u8]) -> Option<Self> {
        if data.len() < JOIN_HEADER_SIZE {
            return None;
        }

        let channel_id = data.get_u32();
        let name_len = data.get_u32() as usize;
        if data.len() < name_len {
            return None;
        }

        let username = std::str::from_utf8(&data[..name_len]).ok()?.to_string();
        Some(Self {
            channel_id,
            username,
        })
    }
}

/// A datagram classified once at the receive boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    /// Receive timed out; nothing arrived
    Empty,
    Control(ControlToken),
    Audio(AudioFrame),
    /// Neither a token nor long enough to hold an audio header
    Malformed { len: usize },
}

impl Datagram {
    pub fn decode(data: Bytes) -> Self {
        if data.is_empty() {
            return Self::Empty;
        }

        if let Some(token) = ControlToken::parse(&data) {
            return Self::Control(token);
        }

        let len = data.len();
        match AudioFrame::deserialize(data) {
            Some(frame) => Self::Audio(frame),
            None => Self::Malformed { len },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_frame_wire_layout() {
        let frame = AudioFrame::new(1_700_000_000.25, Bytes::from_static(&[1, 0, 2, 0]));
        let wire = frame.serialize();

        assert_eq!(&wire[..8], &1_700_000_000.25f64.to_be_bytes());
        assert_eq!(&wire[8..], &[1, 0, 2, 0]);

        let decoded = AudioFrame::deserialize(wire).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_join_packet_layout() {
        let packet = JoinPacket::new(12345, "alice");
        let wire = packet.serialize();

        assert_eq!(&wire[..4], &12345u32.to_be_bytes());
        assert_eq!(&wire[4..8], &5u32.to_be_bytes());
        assert_eq!(&wire[8..], b"alice");
        assert_eq!(JoinPacket::deserialize(&wire).unwrap(), packet);
    }

    #[test]
    fn test_join_packet_truncated_name() {
        let mut wire = JoinPacket::new(1, "bob").serialize().to_vec();
        wire.pop();
        assert!(JoinPacket::deserialize(&wire).is_none());
    }

    #[test]
    fn test_datagram_classification() {
        assert_eq!(Datagram::decode(Bytes::new()), Datagram::Empty);
        assert_eq!(
            Datagram::decode(Bytes::from_static(b"hello")),
            Datagram::Control(ControlToken::Hello)
        );
        assert_eq!(
            Datagram::decode(Bytes::from_static(b"confirm")),
            Datagram::Control(ControlToken::Confirm)
        );
        assert_eq!(
            Datagram::decode(Bytes::from_static(&[1, 2, 3])),
            Datagram::Malformed { len: 3 }
        );

        let frame = AudioFrame::new(2.5, Bytes::from_static(&[0, 0]));
        assert_eq!(Datagram::decode(frame.serialize()), Datagram::Audio(frame));
    }

    #[test]
    fn test_header_only_frame_has_empty_payload() {
        let wire = Bytes::copy_from_slice(&42.0f64.to_be_bytes());
        match Datagram::decode(wire) {
            Datagram::Audio(frame) => {
                assert_eq!(frame.timestamp, 42.0);
                assert!(frame.payload.is_empty());
            }
            other => panic!("unexpected datagram {:?}", other),
        }
    }
}

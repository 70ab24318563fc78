//! Client side of the rendezvous HTTP service
//!
//! The service coordinates channel membership, acts as the time reference
//! and brokers LAN addresses. Audio never goes through it.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::error::RendezvousError;

/// Channel member as reported by the roster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl Member {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
        }
    }

    /// UDP address of this member, if the reported IP parses
    pub fn addr(&self) -> Option<SocketAddr> {
        self.ip
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// Member registration that also carries a LAN address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanMember {
    pub name: String,
    pub ip: String,
    pub lan_ip: String,
    pub port: u16,
}

impl LanMember {
    pub fn lan_addr(&self) -> Option<SocketAddr> {
        self.lan_ip
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// Body of a `lan_ip` registration
pub type LanRegistration = LanMember;

/// Entry of the channel list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelSummary {
    pub id: u32,
    pub name: String,
    pub author: String,
}

/// Channel details
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Deserialize)]
struct TimeResponse {
    time: f64,
}

#[derive(Deserialize)]
struct JoinResponse {
    port: u16,
}

#[derive(Deserialize)]
struct ChannelResponse {
    channel: ChannelInfo,
}

#[derive(Deserialize)]
struct ChannelsResponse {
    channels: Vec<ChannelSummary>,
}

#[derive(Serialize)]
struct LeaveRequest<'a> {
    name: &'a str,
}

/// Operations the session needs from the rendezvous service
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Server wall clock in unix seconds
    async fn server_time(&self) -> Result<f64, RendezvousError>;

    /// Ask for the channel's UDP join port
    async fn join_channel(&self, channel_id: u32) -> Result<u16, RendezvousError>;

    async fn channel_info(&self, channel_id: u32) -> Result<ChannelInfo, RendezvousError>;

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, RendezvousError>;

    /// Current roster of a channel
    async fn members(&self, channel_id: u32) -> Result<Vec<Member>, RendezvousError>;

    async fn leave_channel(&self, channel_id: u32, name: &str) -> Result<(), RendezvousError>;

    /// Register our LAN address and get every LAN registration of the channel
    async fn register_lan_ip(
        &self,
        channel_id: u32,
        registration: &LanRegistration,
    ) -> Result<Vec<LanMember>, RendezvousError>;
}

/// HTTP implementation backed by `ureq`.
/// `ureq` is blocking, so every request runs under `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct HttpRendezvous {
    base_url: String,
}

impl HttpRendezvous {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T>(&self, path: String) -> Result<T, RendezvousError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = format!("{}{}", self.base_url, path);
        tokio::task::spawn_blocking(move || {
            let response = ureq::get(&url).call().map_err(map_ureq_error)?;
            decode_body(response)
        })
        .await
        .map_err(|e| RendezvousError::Task(e.to_string()))?
    }

    async fn post_json<T>(&self, path: String, body: Option<Vec<u8>>) -> Result<T, RendezvousError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = format!("{}{}", self.base_url, path);
        tokio::task::spawn_blocking(move || {
            let request = ureq::post(&url);
            let response = match body {
                Some(body) => request
                    .header("Content-Type", "application/json")
                    .send(&body[..]),
                None => request.send_empty(),
            }
            .map_err(map_ureq_error)?;
            decode_body(response)
        })
        .await
        .map_err(|e| RendezvousError::Task(e.to_string()))?
    }
}

fn map_ureq_error(err: ureq::Error) -> RendezvousError {
    RendezvousError::Http(err.to_string())
}

fn decode_body<T: DeserializeOwned>(
    response: ureq::http::Response<ureq::Body>,
) -> Result<T, RendezvousError> {
    let mut body = response.into_body();
    let bytes = body
        .read_to_vec()
        .map_err(|e| RendezvousError::Http(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| RendezvousError::Decode(e.to_string()))
}

fn to_json<B: Serialize>(body: &B) -> Result<Vec<u8>, RendezvousError> {
    serde_json::to_vec(body).map_err(|e| RendezvousError::Decode(e.to_string()))
}

#[async_trait]
impl Rendezvous for HttpRendezvous {
    async fn server_time(&self) -> Result<f64, RendezvousError> {
        let response: TimeResponse = self.get_json("/api/time".into()).await?;
        Ok(response.time)
    }

    async fn join_channel(&self, channel_id: u32) -> Result<u16, RendezvousError> {
        let response: JoinResponse = self
            .post_json(format!("/api/channel/{}/join", channel_id), None)
            .await?;
        Ok(response.port)
    }

    async fn channel_info(&self, channel_id: u32) -> Result<ChannelInfo, RendezvousError> {
        let response: ChannelResponse = self
            .get_json(format!("/api/channel/{}", channel_id))
            .await
            .map_err(|e| match e {
                RendezvousError::Http(msg) if msg.contains("404") => {
                    RendezvousError::ChannelNotFound(channel_id)
                }
                other => other,
            })?;
        Ok(response.channel)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelSummary>, RendezvousError> {
        let response: ChannelsResponse = self.get_json("/api/channels".into()).await?;
        Ok(response.channels)
    }

    async fn members(&self, channel_id: u32) -> Result<Vec<Member>, RendezvousError> {
        self.get_json(format!("/api/channel/{}/members", channel_id))
            .await
    }

    async fn leave_channel(&self, channel_id: u32, name: &str) -> Result<(), RendezvousError> {
        let body = to_json(&LeaveRequest { name })?;
        let _: serde_json::Value = self
            .post_json(format!("/api/channel/{}/leave", channel_id), Some(body))
            .await?;
        Ok(())
    }

    async fn register_lan_ip(
        &self,
        channel_id: u32,
        registration: &LanRegistration,
    ) -> Result<Vec<LanMember>, RendezvousError> {
        let body = to_json(registration)?;
        self.post_json(format!("/api/channel/{}/lan_ip", channel_id), Some(body))
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_roster_json() {
        let json = r#"[{"name":"alice","ip":"203.0.113.5","port":40000},
                       {"name":"bob","ip":"198.51.100.9","port":40001}]"#;
        let members: Vec<Member> = serde_json::from_str(json).unwrap();

        assert_eq!(members.len(), 2);
        assert_eq!(members[0], Member::new("alice", "203.0.113.5", 40000));
        assert_eq!(
            members[1].addr(),
            Some("198.51.100.9:40001".parse().unwrap())
        );
    }

    #[test]
    fn test_member_equality_is_structural() {
        let a = Member::new("alice", "203.0.113.5", 40000);
        assert_eq!(a, Member::new("alice", "203.0.113.5", 40000));
        assert_ne!(a, Member::new("alice", "203.0.113.5", 40001));
        assert!(Member::new("x", "nonsense", 1).addr().is_none());
    }

    #[test]
    fn test_lan_member_json() {
        let json = r#"{"name":"bob","ip":"203.0.113.5","lan_ip":"192.168.1.20","port":5555}"#;
        let member: LanMember = serde_json::from_str(json).unwrap();
        assert_eq!(member.lan_addr(), Some("192.168.1.20:5555".parse().unwrap()));
    }

    #[test]
    fn test_channel_response_json() {
        let json = r#"{"channel":{"id":12345,"name":"lobby","description":"hi","author":"root",
                       "members":["a (1.2.3.4:5)"],"timestamp":1.0,"created_at":"2024-01-01 00:00:00"}}"#;
        let response: ChannelResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.channel.id, 12345);
        assert_eq!(response.channel.name, "lobby");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        assert_eq!(HttpRendezvous::new("http://host:80/").base_url(), "http://host:80");
    }
}

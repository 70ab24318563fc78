//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity and rendezvous settings
    pub client: ClientConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Audio configuration
    #[serde(default)]
    pub audio: AudioConfig,
}

/// Identity and rendezvous settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Name shown to the other channel members
    pub username: String,

    /// Rendezvous host, used for HTTP and for the UDP join handshake
    pub server_host: String,

    /// Rendezvous HTTP port
    pub server_port: u16,

    /// Prefer LAN addresses for peers behind the same public /24
    pub auto_lan: bool,

    /// Verbose logging
    pub debug: bool,

    /// Pacing between hole-punch probes in milliseconds
    pub p2p_retry_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            server_host: DEFAULT_SERVER_HOST.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            auto_lan: true,
            debug: false,
            p2p_retry_ms: DEFAULT_P2P_RETRY_MS,
        }
    }
}

impl ClientConfig {
    /// Base URL of the rendezvous HTTP API
    pub fn server_url(&self) -> String {
        if self.server_port == 80 {
            format!("http://{}", self.server_host)
        } else {
            format!("http://{}:{}", self.server_host, self.server_port)
        }
    }

    pub fn p2p_retry(&self) -> Duration {
        Duration::from_millis(self.p2p_retry_ms)
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local bind address
    pub bind_address: String,

    /// Bounded wait for every socket read, in milliseconds
    pub recv_timeout_ms: u64,

    /// Receive timeout while waiting for the join acknowledgement
    pub join_timeout_ms: u64,

    /// Give up joining after this many attempts (unbounded when absent)
    pub join_max_attempts: Option<u32>,

    /// Socket send buffer size
    pub send_buffer_size: usize,

    /// Socket receive buffer size
    pub recv_buffer_size: usize,

    /// Roster poll interval in milliseconds
    pub roster_poll_ms: u64,

    /// LAN registration polls before falling back to the public address
    pub lan_poll_attempts: u32,

    /// Delay between LAN registration polls in milliseconds
    pub lan_poll_interval_ms: u64,

    /// Confirm tokens sent after a successful handshake
    pub confirm_burst: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            recv_timeout_ms: DEFAULT_RECV_TIMEOUT_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
            join_max_attempts: None,
            send_buffer_size: 1024 * 1024,
            recv_buffer_size: 1024 * 1024,
            roster_poll_ms: DEFAULT_ROSTER_POLL_MS,
            lan_poll_attempts: DEFAULT_LAN_POLL_ATTEMPTS,
            lan_poll_interval_ms: DEFAULT_LAN_POLL_INTERVAL_MS,
            confirm_burst: DEFAULT_CONFIRM_BURST,
        }
    }
}

impl NetworkConfig {
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn roster_poll(&self) -> Duration {
        Duration::from_millis(self.roster_poll_ms)
    }

    pub fn lan_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lan_poll_interval_ms)
    }
}

/// Audio configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate for capture and playback
    pub sample_rate: u32,

    /// Channel count
    pub channels: u16,

    /// Sample frames per capture read
    pub chunk_frames: usize,

    /// Captured chunks held before the send loop picks them up
    pub capture_queue_capacity: usize,

    /// Mixed frames held ahead of the playback device
    pub playback_queue_capacity: usize,

    /// Frames required before playback starts
    pub playback_start_threshold: usize,

    /// Mixing window in milliseconds
    pub mix_window_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
            capture_queue_capacity: CAPTURE_QUEUE_CAPACITY,
            playback_queue_capacity: PLAYBACK_QUEUE_CAPACITY,
            playback_start_threshold: PLAYBACK_START_THRESHOLD,
            mix_window_ms: DEFAULT_MIX_WINDOW_MS,
        }
    }
}

impl AudioConfig {
    /// Bytes produced by one capture read
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_frames * self.channels as usize * SAMPLE_WIDTH
    }

    pub fn mix_window(&self) -> Duration {
        Duration::from_millis(self.mix_window_ms)
    }
}

impl AppConfig {
    /// Default configuration for a given user
    pub fn for_user(username: impl Into<String>) -> Self {
        Self {
            client: ClientConfig {
                username: username.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load the file, or create it with the username returned by `ask_username`
    pub fn load_or_create<F>(path: &Path, ask_username: F) -> crate::Result<Self>
    where
        F: FnOnce() -> std::io::Result<String>,
    {
        if path.exists() {
            return Self::load(path);
        }

        let username = ask_username()?.trim().to_string();
        let config = Self::for_user(username);
        config.validate()?;
        config.save(path)?;
        tracing::info!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.client.username.trim().is_empty() {
            return Err(crate::Error::Config("username must not be empty".into()));
        }
        if self.audio.playback_start_threshold > self.audio.playback_queue_capacity {
            return Err(crate::Error::Config(format!(
                "playback_start_threshold ({}) exceeds playback_queue_capacity ({})",
                self.audio.playback_start_threshold, self.audio.playback_queue_capacity
            )));
        }
        if self.audio.playback_queue_capacity == 0 || self.audio.capture_queue_capacity == 0 {
            return Err(crate::Error::Config("queue capacities must be non-zero".into()));
        }
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("net", "p2p-voice", "voice-client")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("p2p-voice-{}-{}.toml", name, std::process::id()))
    }

    #[test]
    fn test_save_and_load() {
        let path = temp_path("save-load");
        let mut config = AppConfig::for_user("alice");
        config.network.join_max_attempts = Some(5);
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.client.username, "alice");
        assert_eq!(loaded.network.join_max_attempts, Some(5));
        assert_eq!(loaded.audio.sample_rate, DEFAULT_SAMPLE_RATE);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_load_or_create_writes_file() {
        let path = temp_path("create");
        let _ = std::fs::remove_file(&path);

        let config = AppConfig::load_or_create(&path, || Ok("  bob \n".to_string())).unwrap();
        assert_eq!(config.client.username, "bob");
        assert!(path.exists());

        let again = AppConfig::load_or_create(&path, || panic!("should not prompt")).unwrap();
        assert_eq!(again.client.username, "bob");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let content = r#"
            [client]
            username = "carol"
            server_host = "127.0.0.1"
            server_port = 5000
            auto_lan = false
            debug = true
            p2p_retry_ms = 50
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.client.server_url(), "http://127.0.0.1:5000");
        assert_eq!(config.network.recv_timeout_ms, DEFAULT_RECV_TIMEOUT_MS);
        assert_eq!(config.audio.playback_start_threshold, PLAYBACK_START_THRESHOLD);
    }

    #[test]
    fn test_validation() {
        assert!(AppConfig::for_user("").validate().is_err());

        let mut config = AppConfig::for_user("dave");
        assert!(config.validate().is_ok());

        config.audio.playback_start_threshold = config.audio.playback_queue_capacity + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_bytes() {
        let audio = AudioConfig::default();
        assert_eq!(audio.chunk_bytes(), DEFAULT_CHUNK_FRAMES * 2);
        assert_eq!(ClientConfig::default().server_url(), "http://vc.itzowo.net");
    }
}

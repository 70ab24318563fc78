//! Audio device seams and cpal device lookup
//!
//! The session only sees blocking byte-stream traits, so tests can drive
//! the send and receive paths without sound hardware.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait};

use crate::config::AudioConfig;
use crate::error::AudioError;

/// Blocking source of fixed-size PCM chunks
pub trait CaptureSource: Send {
    /// Next chunk of little-endian i16 PCM. Errors are per chunk; the caller
    /// skips the chunk and keeps reading.
    fn read_chunk(&mut self) -> Result<Bytes, AudioError>;
}

/// Blocking sink for mixed PCM frames
pub trait PlaybackSink: Send {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), AudioError>;
}

/// Wrapper around a cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }
}

/// Default system microphone
pub fn default_input() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_input_device()
        .map(AudioDevice::from_cpal)
        .ok_or_else(|| AudioError::DeviceNotFound("no default input device".into()))
}

/// Default system speakers
pub fn default_output() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_output_device()
        .map(AudioDevice::from_cpal)
        .ok_or_else(|| AudioError::DeviceNotFound("no default output device".into()))
}

/// Stream configuration for 16-bit PCM at the configured rate and layout
pub fn stream_config(config: &AudioConfig) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_follows_audio_config() {
        let config = AudioConfig::default();
        let stream = stream_config(&config);
        assert_eq!(stream.channels, 1);
        assert_eq!(stream.sample_rate.0, 44_100);
    }
}

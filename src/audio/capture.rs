//! Microphone capture through cpal
//!
//! The cpal stream is not `Send`, so it lives in a dedicated thread for as
//! long as the capture is open. Samples reach the reader over a bounded
//! channel and are re-chunked to the configured frame count.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::{default_input, stream_config, CaptureSource};
use crate::audio::mix::samples_to_bytes;
use crate::config::AudioConfig;
use crate::error::AudioError;

pub struct DeviceCapture {
    running: Arc<AtomicBool>,
    samples_rx: Receiver<Vec<i16>>,
    pending: Vec<i16>,
    chunk_samples: usize,
    /// Upper bound on one `read_chunk`, so the capture loop sees stop in time
    read_timeout: Duration,
    thread_handle: Option<JoinHandle<()>>,
}

impl DeviceCapture {
    /// Open the default input device. A read gives up after `read_timeout`.
    pub fn open(config: &AudioConfig, read_timeout: Duration) -> Result<Self, AudioError> {
        let device = default_input()?;
        tracing::info!("Capturing from {}", device.name);

        let stream_config = stream_config(config);
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (samples_tx, samples_rx) = bounded::<Vec<i16>>(64);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = cpal_device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        // A full channel means the reader stalled; drop rather than block the callback
                        let _ = samples_tx.try_send(data.to_vec());
                    },
                    move |err| {
                        tracing::warn!("Capture stream error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                drop(stream);
                tracing::debug!("Capture stream closed");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("capture thread exited".into()))??;

        Ok(Self {
            running,
            samples_rx,
            pending: Vec::new(),
            chunk_samples: config.chunk_frames * config.channels as usize,
            read_timeout,
            thread_handle: Some(handle),
        })
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl CaptureSource for DeviceCapture {
    fn read_chunk(&mut self) -> Result<Bytes, AudioError> {
        next_chunk(
            &self.samples_rx,
            &mut self.pending,
            self.chunk_samples,
            Instant::now() + self.read_timeout,
        )
    }
}

/// Fill `pending` to one chunk from `rx`, giving up at `deadline`
fn next_chunk(
    rx: &Receiver<Vec<i16>>,
    pending: &mut Vec<i16>,
    chunk_samples: usize,
    deadline: Instant,
) -> Result<Bytes, AudioError> {
    while pending.len() < chunk_samples {
        match rx.recv_deadline(deadline) {
            Ok(samples) => pending.extend_from_slice(&samples),
            Err(RecvTimeoutError::Timeout) => {
                return Err(AudioError::Read("no samples from input device".into()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(AudioError::Read("capture stream closed".into()))
            }
        }
    }

    let rest = pending.split_off(chunk_samples);
    let chunk = std::mem::replace(pending, rest);
    Ok(Bytes::from(samples_to_bytes(&chunk)))
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mix::bytes_to_samples;

    #[test]
    fn test_chunk_keeps_remainder() {
        let (tx, rx) = bounded(4);
        tx.send(vec![1, 2, 3]).unwrap();
        tx.send(vec![4, 5]).unwrap();
        let mut pending = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(100);

        let chunk = next_chunk(&rx, &mut pending, 4, deadline).unwrap();
        assert_eq!(bytes_to_samples(&chunk), vec![1, 2, 3, 4]);
        assert_eq!(pending, vec![5]);
    }

    #[test]
    fn test_silent_device_read_is_bounded() {
        let (_tx, rx) = bounded::<Vec<i16>>(4);
        let mut pending = Vec::new();
        let timeout = Duration::from_millis(100);

        let start = Instant::now();
        let result = next_chunk(&rx, &mut pending, 4, start + timeout);
        assert!(matches!(result, Err(AudioError::Read(_))));
        assert!(start.elapsed() < timeout + Duration::from_millis(50));
    }

    #[test]
    fn test_trickling_device_read_is_bounded() {
        let (tx, rx) = bounded::<Vec<i16>>(64);
        let feeder = thread::spawn(move || {
            for _ in 0..20 {
                if tx.send(vec![0]).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
        });
        let mut pending = Vec::new();
        let timeout = Duration::from_millis(100);

        // Never reaches a full chunk before the deadline
        let start = Instant::now();
        let result = next_chunk(&rx, &mut pending, 1000, start + timeout);
        assert!(matches!(result, Err(AudioError::Read(_))));
        assert!(start.elapsed() < timeout + Duration::from_millis(50));
        assert!(!pending.is_empty());

        drop(rx);
        feeder.join().unwrap();
    }
}

//! Speaker playback through cpal, plus the loop that feeds it
//!
//! Like capture, the cpal stream stays in its own thread. Written frames
//! travel over a bounded channel, so `write_frame` blocks once the device
//! falls behind; the output callback plays silence on underrun.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::PlaybackQueue;
use crate::audio::device::{default_output, stream_config, PlaybackSink};
use crate::audio::mix::bytes_to_samples;
use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::session::StopSignal;

pub struct DevicePlayback {
    running: Arc<AtomicBool>,
    frames_tx: Option<Sender<Vec<i16>>>,
    underruns: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DevicePlayback {
    /// Open the default output device
    pub fn open(config: &AudioConfig) -> Result<Self, AudioError> {
        let device = default_output()?;
        tracing::info!("Playing to {}", device.name);

        let stream_config = stream_config(config);
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let underruns = Arc::new(AtomicU64::new(0));
        let underruns_cb = underruns.clone();
        let (frames_tx, frames_rx) = bounded::<Vec<i16>>(4);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let mut current: Vec<i16> = Vec::new();
                let mut pos = 0;

                let stream = cpal_device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        for sample in data.iter_mut() {
                            if pos >= current.len() {
                                match frames_rx.try_recv() {
                                    Ok(frame) => {
                                        current = frame;
                                        pos = 0;
                                    }
                                    Err(_) => {
                                        underruns_cb.fetch_add(1, Ordering::Relaxed);
                                        *sample = 0;
                                        continue;
                                    }
                                }
                            }
                            *sample = current.get(pos).copied().unwrap_or(0);
                            pos += 1;
                        }
                    },
                    move |err| {
                        tracing::warn!("Playback stream error: {}", err);
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
                tracing::debug!("Playback stream closed");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| AudioError::StreamError("playback thread exited".into()))??;

        Ok(Self {
            running,
            frames_tx: Some(frames_tx),
            underruns,
            thread_handle: Some(handle),
        })
    }

    /// Output callbacks that found nothing to play
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.frames_tx.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl PlaybackSink for DevicePlayback {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), AudioError> {
        let tx = self
            .frames_tx
            .as_ref()
            .ok_or_else(|| AudioError::StreamError("playback closed".into()))?;
        tx.send(bytes_to_samples(frame))
            .map_err(|_| AudioError::StreamError("playback stream closed".into()))
    }
}

impl Drop for DevicePlayback {
    fn drop(&mut self) {
        self.close();
    }
}

/// Feed queued frames to `sink` until `stop` is set
pub fn spawn_playback_loop(
    queue: Arc<PlaybackQueue>,
    mut sink: Box<dyn PlaybackSink>,
    stop: StopSignal,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("playback-loop".into())
        .spawn(move || {
            tracing::debug!("Audio playback started");
            while !stop.is_stopped() {
                let Some(frame) = queue.pop() else {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                };
                play(&mut *sink, &frame);
            }
            tracing::info!("Audio playback stopped");
        })
}

fn play(sink: &mut dyn PlaybackSink, frame: &Bytes) {
    if let Err(e) = sink.write_frame(frame) {
        tracing::debug!("Dropped a playback frame: {}", e);
    }
}

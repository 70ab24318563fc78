//! Audio subsystem
//!
//! Device capture and playback, the receive-side buffers and the mixer.

pub mod buffer;
pub mod capture;
pub mod device;
pub mod mix;
pub mod playback;

pub use buffer::{CaptureQueue, JitterAccumulator, PlaybackQueue};
pub use capture::DeviceCapture;
pub use device::{CaptureSource, PlaybackSink};
pub use mix::mix;
pub use playback::{spawn_playback_loop, DevicePlayback};

//! Audio devices, capture, playback and the WAV container
//!
//! This module provides:
//! - Device traits separating session logic from the platform backend
//! - Microphone capture into raw 16-bit mono PCM buffers
//! - One-shot playback of the reference sweep
//! - Canonical WAV container encoding

pub mod capture;
pub mod device;
pub mod playback;
pub mod wav;

#[cfg(test)]
pub mod testing;

pub use capture::{CaptureSink, PipeWireCapture};
pub use device::{CaptureBackend, DeviceError, PlaybackBackend};
pub use playback::{PipeWirePlayback, PlaybackSource};

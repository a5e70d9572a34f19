//! Device seams between session logic and the platform audio backend
//!
//! A device is acquired with `open` and released when its box is dropped, so
//! every exit path of a session gives the hardware back.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a backend may take to connect before it counts as unavailable
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Audio device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Audio device unavailable: {0}")]
    Unavailable(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Blocking source of raw capture bytes (little-endian i16, mono)
pub trait CaptureDevice: Send {
    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when nothing arrived within the device's poll interval,
    /// so callers can check for cancellation between reads.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;
}

/// Factory for capture devices
pub trait CaptureBackend: Send + Sync {
    /// Whether the host has authorized microphone capture
    fn permission_granted(&self) -> bool {
        true
    }

    /// Acquire the capture device at the given rate
    fn open(&self, sample_rate: u32) -> Result<Box<dyn CaptureDevice>, DeviceError>;
}

/// Invoked once when a playback device runs out of samples
pub type FinishedCallback = Box<dyn FnOnce() + Send + 'static>;

/// Output device that renders a fixed sample buffer once
pub trait PlaybackDevice: Send {
    /// Begin rendering. `on_finished` runs when the samples are exhausted,
    /// never after `stop` has returned.
    fn start(
        &mut self,
        samples: Arc<[i16]>,
        sample_rate: u32,
        on_finished: FinishedCallback,
    ) -> Result<(), DeviceError>;

    /// Halt output immediately
    fn stop(&mut self);
}

/// Factory for playback devices
pub trait PlaybackBackend: Send + Sync {
    fn open(&self) -> Result<Box<dyn PlaybackDevice>, DeviceError>;
}

/// Wait for a backend loop thread to report that its stream is connected
///
/// The caller still owns the thread; dropping its device stops and joins it.
pub(crate) fn await_ready(
    ready_rx: &mpsc::Receiver<Result<(), String>>,
) -> Result<(), DeviceError> {
    match ready_rx.recv_timeout(CONNECT_TIMEOUT) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DeviceError::Unavailable(e)),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(DeviceError::Unavailable(
            "timed out connecting to PipeWire".to_string(),
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(DeviceError::Unavailable(
            "audio thread exited during setup".to_string(),
        )),
    }
}

//! In-process capture and playback backends for tests

use super::device::{
    CaptureBackend, CaptureDevice, DeviceError, FinishedCallback, PlaybackBackend, PlaybackDevice,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Capture backend producing a 441 Hz tone at 44.1 kHz
#[derive(Clone, Default)]
pub struct FakeCapture {
    pub denied: Arc<AtomicBool>,
    pub unavailable: Arc<AtomicBool>,
    pub opened: Arc<AtomicUsize>,
    pub open_devices: Arc<AtomicUsize>,
}

impl FakeCapture {
    pub fn open_devices(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for FakeCapture {
    fn permission_granted(&self) -> bool {
        !self.denied.load(Ordering::SeqCst)
    }

    fn open(&self, _sample_rate: u32) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeviceError::Unavailable("microphone busy".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCaptureDevice {
            position: 0,
            open_devices: self.open_devices.clone(),
        }))
    }
}

struct FakeCaptureDevice {
    position: u64,
    open_devices: Arc<AtomicUsize>,
}

impl CaptureDevice for FakeCaptureDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        thread::sleep(Duration::from_millis(1));
        for pair in buf.chunks_exact_mut(2) {
            let t = self.position as f32 / 44100.0;
            let sample = (8000.0 * (2.0 * std::f32::consts::PI * 441.0 * t).sin()) as i16;
            pair.copy_from_slice(&sample.to_le_bytes());
            self.position += 1;
        }
        Ok(buf.len() - buf.len() % 2)
    }
}

impl Drop for FakeCaptureDevice {
    fn drop(&mut self) {
        self.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Playback backend that "plays" in real time by sleeping
#[derive(Clone, Default)]
pub struct FakePlayback {
    pub unavailable: Arc<AtomicBool>,
    pub opened: Arc<AtomicUsize>,
    pub open_devices: Arc<AtomicUsize>,
}

impl FakePlayback {
    pub fn open_devices(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }
}

impl PlaybackBackend for FakePlayback {
    fn open(&self) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeviceError::Unavailable("no sink".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.open_devices.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePlaybackDevice {
            cancel: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            open_devices: self.open_devices.clone(),
        }))
    }
}

struct FakePlaybackDevice {
    cancel: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    open_devices: Arc<AtomicUsize>,
}

impl PlaybackDevice for FakePlaybackDevice {
    fn start(
        &mut self,
        samples: Arc<[i16]>,
        sample_rate: u32,
        on_finished: FinishedCallback,
    ) -> Result<(), DeviceError> {
        let cancel = self.cancel.clone();
        let millis = samples.len() as u64 * 1000 / sample_rate.max(1) as u64;
        self.thread_handle = Some(thread::spawn(move || {
            for _ in 0..millis {
                if cancel.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            on_finished();
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FakePlaybackDevice {
    fn drop(&mut self) {
        self.stop();
        self.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

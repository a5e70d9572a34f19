//! Microphone capture into raw PCM buffers
//!
//! `CaptureSink` owns a capture device for one session and streams it into a
//! file from a dedicated thread. `PipeWireCapture` provides the device.

use super::device::{await_ready, CaptureBackend, CaptureDevice, DeviceError};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a device read waits for data before yielding
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters reported by a finished capture worker
///
/// Blocks go to the file unbuffered, so `bytes` is what reached the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub blocks: u64,
    pub bytes: u64,
    pub dropped_blocks: u64,
}

/// A running capture session writing to one raw buffer
pub struct CaptureSink {
    target: PathBuf,
    stop_flag: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<CaptureStats>>,
}

impl CaptureSink {
    /// Start streaming `device` into `target`
    ///
    /// The target is truncated here, after the device has been acquired.
    pub fn open(
        target: impl AsRef<Path>,
        device: Box<dyn CaptureDevice>,
        block_bytes: usize,
    ) -> io::Result<Self> {
        let target = target.as_ref().to_path_buf();
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = File::create(&target)?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();
        let block_bytes = block_bytes.max(2);

        let handle = thread::Builder::new()
            .name("avycal-capture".to_string())
            .spawn(move || stream_until_stopped(device, writer, block_bytes, stop_clone))?;

        log::info!("Capturing into {}", target.display());

        Ok(Self {
            target,
            stop_flag,
            thread_handle: Some(handle),
        })
    }

    /// Path of the raw buffer being written
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Check if the worker is still streaming
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop streaming and wait for the worker
    ///
    /// On return the file is closed and the device released.
    pub fn stop(&mut self) -> CaptureStats {
        self.stop_flag.store(true, Ordering::Release);

        let Some(handle) = self.thread_handle.take() else {
            return CaptureStats::default();
        };

        match handle.join() {
            Ok(stats) => {
                log::info!(
                    "Capture stopped: {} blocks, {} bytes, {} dropped",
                    stats.blocks,
                    stats.bytes,
                    stats.dropped_blocks
                );
                stats
            }
            Err(_) => {
                log::error!("Capture thread panicked");
                CaptureStats::default()
            }
        }
    }
}

impl Drop for CaptureSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocking read loop run on the capture thread
fn stream_until_stopped(
    mut device: Box<dyn CaptureDevice>,
    mut writer: File,
    block_bytes: usize,
    stop: Arc<AtomicBool>,
) -> CaptureStats {
    let mut block = vec![0u8; block_bytes];
    let mut stats = CaptureStats::default();

    while !stop.load(Ordering::Acquire) {
        let read = match device.read(&mut block) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                log::error!("Capture device failed: {}", e);
                break;
            }
        };

        // Best effort: a failed block is dropped, the session goes on
        if let Err(e) = writer.write_all(&block[..read]) {
            stats.dropped_blocks += 1;
            log::warn!("Failed to write capture block: {}", e);
            continue;
        }

        stats.blocks += 1;
        stats.bytes += read as u64;
    }

    drop(writer);
    drop(device);

    stats
}

enum PipeWireCommand {
    Stop,
}

/// Capture backend using the default PipeWire source
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeWireCapture;

impl CaptureBackend for PipeWireCapture {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        let device = PipeWireCaptureDevice::connect(sample_rate)?;
        Ok(Box::new(device))
    }
}

/// Live PipeWire capture stream, delivering S16LE mono bytes
struct PipeWireCaptureDevice {
    blocks: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    sender: Option<pw::channel::Sender<PipeWireCommand>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PipeWireCaptureDevice {
    fn connect(sample_rate: u32) -> Result<Self, DeviceError> {
        let (block_tx, block_rx) = mpsc::channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let (sender, receiver) = pw::channel::channel::<PipeWireCommand>();

        let handle = thread::Builder::new()
            .name("avycal-pw-capture".to_string())
            .spawn(move || {
                if let Err(e) = run_capture_loop(sample_rate, block_tx, receiver, &ready_tx) {
                    log::error!("PipeWire capture error: {}", e);
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        let device = Self {
            blocks: block_rx,
            pending: VecDeque::new(),
            sender: Some(sender),
            thread_handle: Some(handle),
        };

        // On failure `device` is dropped here, which joins the loop thread
        await_ready(&ready_rx)?;
        Ok(device)
    }
}

impl CaptureDevice for PipeWireCaptureDevice {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        if self.pending.is_empty() {
            match self.blocks.recv_timeout(POLL_INTERVAL) {
                Ok(block) => self.pending.extend(block),
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(0),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(DeviceError::Stream(
                        "PipeWire capture loop exited".to_string(),
                    ))
                }
            }
        }

        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Drop for PipeWireCaptureDevice {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PipeWireCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    sample_rate: u32,
    blocks: mpsc::Sender<Vec<u8>>,
    receiver: pw::channel::Receiver<PipeWireCommand>,
    ready: &mpsc::Sender<Result<(), String>>,
) -> Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;

    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;

    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        PipeWireCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        blocks: mpsc::Sender<Vec<u8>>,
    }

    let user_data = UserData {
        format: Default::default(),
        blocks,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Production",
        *pw::keys::APP_NAME => "Avycal",
    };

    let stream = pw::stream::StreamBox::new(&core, "avycal-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                log::warn!("Failed to parse capture format: {:?}", e);
                return;
            }
            log::debug!(
                "Capture format negotiated: {} Hz, {} channel(s)",
                user_data.format.rate(),
                user_data.format.channels()
            );
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let frame_bytes = 2 * user_data.format.channels().max(1) as usize;
            let size = data.chunk().size() as usize;

            if let Some(raw) = data.data() {
                let raw = &raw[..size.min(raw.len())];
                // Keep the first channel if the server ignored the mono request
                let mono: Vec<u8> = raw
                    .chunks_exact(frame_bytes)
                    .flat_map(|frame| [frame[0], frame[1]])
                    .collect();
                if !mono.is_empty() {
                    let _ = user_data.blocks.send(mono);
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::S16LE);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(1);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    let values: Vec<u8> = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner();

    let pod = Pod::from_bytes(&values).ok_or("Failed to build format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));

    // Run until stopped
    mainloop.run();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    /// Produces a rising byte pattern, one short sleep per read
    struct CountingDevice {
        next: u8,
        reads: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    impl CaptureDevice for CountingDevice {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
            thread::sleep(Duration::from_millis(1));
            for byte in buf.iter_mut() {
                *byte = self.next;
                self.next = self.next.wrapping_add(1);
            }
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(buf.len())
        }
    }

    impl Drop for CountingDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("avycal-capture-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_stream_writes_whole_blocks_until_stopped() {
        let target = scratch_file("calibration.pcm");
        let reads = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let device = CountingDevice {
            next: 0,
            reads: reads.clone(),
            released: released.clone(),
        };

        let mut sink = CaptureSink::open(&target, Box::new(device), 256).unwrap();
        while reads.load(Ordering::SeqCst) < 5 {
            thread::sleep(Duration::from_millis(1));
        }
        let stats = sink.stop();

        assert!(released.load(Ordering::SeqCst));
        assert!(!sink.is_running());
        let written = std::fs::read(&target).unwrap();
        assert_eq!(written.len() as u64, stats.bytes);
        assert_eq!(written.len() % 256, 0);
        assert!(written.iter().enumerate().all(|(i, &b)| b == i as u8));

        // Nothing lands in the file once stop has returned
        thread::sleep(Duration::from_millis(20));
        assert_eq!(std::fs::read(&target).unwrap().len(), written.len());
    }

    #[test]
    fn test_open_truncates_previous_buffer() {
        let target = scratch_file("measurement.pcm");
        std::fs::write(&target, vec![0xAB; 4096]).unwrap();

        struct SilentDevice;
        impl CaptureDevice for SilentDevice {
            fn read(&mut self, _buf: &mut [u8]) -> Result<usize, DeviceError> {
                thread::sleep(Duration::from_millis(1));
                Ok(0)
            }
        }

        let mut sink = CaptureSink::open(&target, Box::new(SilentDevice), 256).unwrap();
        sink.stop();
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
    }

    #[test]
    fn test_device_error_ends_stream() {
        let target = scratch_file("calibration.pcm");

        struct FailingDevice;
        impl CaptureDevice for FailingDevice {
            fn read(&mut self, _buf: &mut [u8]) -> Result<usize, DeviceError> {
                Err(DeviceError::Stream("unplugged".to_string()))
            }
        }

        let mut sink = CaptureSink::open(&target, Box::new(FailingDevice), 256).unwrap();
        let handle_done = (0..100).any(|_| {
            thread::sleep(Duration::from_millis(5));
            !sink.is_running()
        });
        assert!(handle_done);
        assert_eq!(sink.stop(), CaptureStats::default());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_block_writes_are_dropped_and_capture_continues() {
        let reads = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let device = CountingDevice {
            next: 0,
            reads: reads.clone(),
            released: released.clone(),
        };

        // Every write to /dev/full fails with ENOSPC
        let mut sink = CaptureSink::open("/dev/full", Box::new(device), 256).unwrap();
        while reads.load(Ordering::SeqCst) < 10 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(sink.is_running());
        let stats = sink.stop();

        assert!(released.load(Ordering::SeqCst));
        assert!(stats.dropped_blocks >= 10);
        assert_eq!(stats.blocks, 0);
        assert_eq!(stats.bytes, 0);
        assert_eq!(stats.dropped_blocks, reads.load(Ordering::SeqCst) as u64);
    }
}

//! Reference tone playback
//!
//! `PlaybackSource` plays a fixed sample buffer once per `play` and fires its
//! completion signal exactly once, on natural end or on `stop`.
//! `PipeWirePlayback` renders through the default PipeWire sink.

use super::device::{
    await_ready, DeviceError, FinishedCallback, PlaybackBackend, PlaybackDevice,
};
use parking_lot::Mutex;
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

/// One-shot completion signal shared by the device thread and `stop`
#[derive(Clone)]
struct Completion(Arc<Mutex<Option<FinishedCallback>>>);

impl Completion {
    fn new(callback: FinishedCallback) -> Self {
        Self(Arc::new(Mutex::new(Some(callback))))
    }

    fn is_pending(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Run the callback unless someone already did
    fn fire(&self) -> bool {
        let callback = self.0.lock().take();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

struct ActivePlayback {
    device: Box<dyn PlaybackDevice>,
    completion: Completion,
}

/// Plays one buffer through a device acquired per `play`
pub struct PlaybackSource {
    backend: Arc<dyn PlaybackBackend>,
    samples: Arc<[i16]>,
    sample_rate: u32,
    active: Option<ActivePlayback>,
}

impl PlaybackSource {
    pub fn new(backend: Arc<dyn PlaybackBackend>, samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            backend,
            samples: samples.into(),
            sample_rate,
            active: None,
        }
    }

    /// Duration of the loaded buffer in seconds
    pub fn duration_seconds(&self) -> f64 {
        super::wav::duration_seconds(self.samples.len(), self.sample_rate)
    }

    /// Check if playback has started and not yet completed
    pub fn is_playing(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.completion.is_pending())
            .unwrap_or(false)
    }

    /// Start playback; `on_complete` fires exactly once when it ends
    ///
    /// Returns `Ok(false)` without side effects if already playing.
    pub fn play(&mut self, on_complete: FinishedCallback) -> Result<bool, DeviceError> {
        if self.is_playing() {
            return Ok(false);
        }
        // A previous run that ended naturally still holds its device
        self.release();

        let mut device = self.backend.open()?;
        let completion = Completion::new(on_complete);
        let device_completion = completion.clone();

        device.start(
            self.samples.clone(),
            self.sample_rate,
            Box::new(move || {
                device_completion.fire();
            }),
        )?;

        log::debug!(
            "Playback started ({:.2}s at {} Hz)",
            self.duration_seconds(),
            self.sample_rate
        );
        self.active = Some(ActivePlayback { device, completion });
        Ok(true)
    }

    /// Halt playback and release the device
    ///
    /// Fires the completion signal if it has not fired yet.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            let ActivePlayback {
                mut device,
                completion,
            } = active;
            device.stop();
            drop(device);
            if completion.fire() {
                log::debug!("Playback stopped before the end");
            }
        }
    }

    fn release(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.device.stop();
        }
    }
}

impl Drop for PlaybackSource {
    fn drop(&mut self) {
        self.stop();
    }
}

enum PlaybackCommand {
    Stop,
}

/// Playback backend using the default PipeWire sink
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeWirePlayback;

impl PlaybackBackend for PipeWirePlayback {
    fn open(&self) -> Result<Box<dyn PlaybackDevice>, DeviceError> {
        Ok(Box::new(PipeWirePlaybackDevice::default()))
    }
}

#[derive(Default)]
struct PipeWirePlaybackDevice {
    sender: Option<pw::channel::Sender<PlaybackCommand>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PlaybackDevice for PipeWirePlaybackDevice {
    fn start(
        &mut self,
        samples: Arc<[i16]>,
        sample_rate: u32,
        on_finished: FinishedCallback,
    ) -> Result<(), DeviceError> {
        if self.thread_handle.is_some() {
            return Err(DeviceError::Stream("Playback already running".to_string()));
        }

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let (sender, receiver) = pw::channel::channel::<PlaybackCommand>();
        self.sender = Some(sender);

        let handle = thread::Builder::new()
            .name("avycal-pw-playback".to_string())
            .spawn(move || {
                match run_playback_loop(samples, sample_rate, receiver, &ready_tx) {
                    Ok(true) => on_finished(),
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("PipeWire playback error: {}", e);
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        self.thread_handle = Some(handle);

        if let Err(e) = await_ready(&ready_rx) {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PlaybackCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PipeWirePlaybackDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the PipeWire playback loop in a background thread
///
/// Returns `Ok(true)` when every sample was rendered, `Ok(false)` when stopped.
fn run_playback_loop(
    samples: Arc<[i16]>,
    sample_rate: u32,
    receiver: pw::channel::Receiver<PlaybackCommand>,
    ready: &mpsc::Sender<Result<(), String>>,
) -> Result<bool, String> {
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
        PlaybackCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    let exhausted = Arc::new(AtomicBool::new(false));

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        samples: Arc<[i16]>,
        position: usize,
        exhausted: Arc<AtomicBool>,
        mainloop_weak: pw::main_loop::MainLoopWeak,
    }

    let user_data = UserData {
        format: Default::default(),
        samples,
        position: 0,
        exhausted: exhausted.clone(),
        mainloop_weak: mainloop.downgrade(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Production",
        *pw::keys::APP_NAME => "Avycal",
    };

    let stream = pw::stream::StreamBox::new(&core, "avycal-playback", props)
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
                log::warn!("Failed to parse playback format: {:?}", e);
            }
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
            let n_channels = user_data.format.channels().max(1) as usize;
            let sample_bytes = std::mem::size_of::<f32>();
            let stride = sample_bytes * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let remaining = user_data.samples.len() - user_data.position;
            if remaining == 0 {
                user_data.exhausted.store(true, Ordering::SeqCst);
                if let Some(mainloop) = user_data.mainloop_weak.upgrade() {
                    mainloop.quit();
                }
                return;
            }

            let n_frames = (slice.len() / stride).min(remaining);
            let start = user_data.position;
            for (i, &sample) in user_data.samples[start..start + n_frames].iter().enumerate() {
                let bytes = (sample as f32 / 32768.0).to_le_bytes();
                // Same signal on every channel
                for ch in 0..n_channels {
                    let offset = i * stride + ch * sample_bytes;
                    slice[offset..offset + sample_bytes].copy_from_slice(&bytes);
                }
            }
            user_data.position += n_frames;

            let written = n_frames * stride;
            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = written as u32;
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
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
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    let _ = ready.send(Ok(()));

    // Run until stopped or playback ends
    mainloop.run();

    Ok(exhausted.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakePlayback;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, FinishedCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let clone = count.clone();
        (
            count,
            Box::new(move || {
                clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_completion_fires_once_on_natural_end() {
        let backend = FakePlayback::default();
        let mut source = PlaybackSource::new(Arc::new(backend.clone()), vec![0; 441], 44100);
        let (count, callback) = counter();

        assert_eq!(source.play(callback), Ok(true));
        for _ in 0..200 {
            if !source.is_playing() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!source.is_playing());
        source.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(backend.open_devices(), 0);
    }

    #[test]
    fn test_stop_fires_completion_and_allows_replay() {
        let backend = FakePlayback::default();
        let mut source =
            PlaybackSource::new(Arc::new(backend.clone()), vec![0; 44100 * 10], 44100);
        let (count, callback) = counter();

        assert_eq!(source.play(callback), Ok(true));
        source.stop();
        source.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(backend.open_devices(), 0);

        let (second, callback) = counter();
        assert_eq!(source.play(callback), Ok(true));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 2);
        source.stop();
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_play_while_playing_is_rejected() {
        let backend = FakePlayback::default();
        let mut source =
            PlaybackSource::new(Arc::new(backend.clone()), vec![0; 44100 * 10], 44100);
        let (first, callback) = counter();
        let (second, rejected) = counter();

        assert_eq!(source.play(callback), Ok(true));
        assert_eq!(source.play(rejected), Ok(false));
        assert_eq!(backend.opened.load(Ordering::SeqCst), 1);

        source.stop();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unavailable_device_is_reported() {
        let backend = FakePlayback::default();
        backend.unavailable.store(true, Ordering::SeqCst);
        let mut source = PlaybackSource::new(Arc::new(backend), vec![0; 10], 44100);
        let (count, callback) = counter();

        assert!(matches!(
            source.play(callback),
            Err(DeviceError::Unavailable(_))
        ));
        assert!(!source.is_playing());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

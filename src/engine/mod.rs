//! Measurement engine
//!
//! Owns the session lifecycle: capture and sweep playback start together, the
//! sweep's completion (or an explicit `stop`) ends the session, the raw buffer
//! is then wrapped into a WAV container, and `analyze` turns a raw buffer into
//! a published result curve.
//!
//! ```text
//! Idle --start--> Armed --devices ok--> Recording --completion/stop--> Stopping --> Idle
//! Idle --analyze--> Analyzing --> Idle
//! ```

mod state;

pub use state::{EngineState, StateSubscriber};

use crate::analysis::{AnalysisError, SpectralAnalyzer};
use crate::assets;
use crate::audio::wav::{self, CodecError, PcmFormat};
use crate::audio::{
    CaptureBackend, CaptureSink, DeviceError, PipeWireCapture, PipeWirePlayback, PlaybackBackend,
    PlaybackSource,
};
use crate::models::{
    valid_chunk_size, EngineConfig, MeasurementReport, Mode, ResultCurve, MAX_CHUNK_SIZE,
};
use crate::report::ReportStore;
use crate::tokio_runtime;
use parking_lot::Mutex;
use state::PublishedState;
use std::io;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Engine errors; none of them leave a session or device behind
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Microphone permission has not been granted")]
    PermissionRequired,

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("A measurement session is active")]
    Busy,

    #[error("No capture found at {}", .0.display())]
    SourceUnavailable(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<DeviceError> for EngineError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Unavailable(reason) | DeviceError::Stream(reason) => {
                EngineError::DeviceUnavailable(reason)
            }
        }
    }
}

impl From<AnalysisError> for EngineError {
    fn from(e: AnalysisError) -> Self {
        match e {
            AnalysisError::SourceUnavailable { path, .. } => EngineError::SourceUnavailable(path),
            AnalysisError::Read(e) => EngineError::Io(e),
            e @ AnalysisError::InvalidChunkSize(_) => EngineError::Config(e.to_string()),
        }
    }
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub mode: Mode,
    pub raw_path: PathBuf,
    pub container_path: PathBuf,
    pub sample_rate: u32,
    pub payload_bytes: u32,
}

impl SessionOutcome {
    pub fn duration_seconds(&self) -> f64 {
        wav::duration_seconds(self.payload_bytes as usize / 2, self.sample_rate)
    }
}

/// An active capture/playback pair
struct Session {
    id: Uuid,
    mode: Mode,
    raw_path: PathBuf,
    container_path: PathBuf,
    capture: CaptureSink,
}

/// Debug replay of a stored container
struct DebugPlayback {
    id: Uuid,
    player: PlaybackSource,
}

struct EngineInner {
    config: EngineConfig,
    capture_backend: Arc<dyn CaptureBackend>,
    playback_backend: Arc<dyn PlaybackBackend>,
    /// Serializes start, stop, analyze and debug playback
    transition: Mutex<()>,
    session: Mutex<Option<Session>>,
    sweep_player: Mutex<PlaybackSource>,
    debug_player: Mutex<Option<DebugPlayback>>,
    last_outcome: Mutex<Option<SessionOutcome>>,
    published: PublishedState,
}

/// Handle to the measurement engine; clones share one engine
#[derive(Clone)]
pub struct MeasurementEngine {
    inner: Arc<EngineInner>,
}

impl MeasurementEngine {
    /// Create an engine playing `sweep` through `playback_backend`
    pub fn new(
        config: EngineConfig,
        capture_backend: Arc<dyn CaptureBackend>,
        playback_backend: Arc<dyn PlaybackBackend>,
        sweep: Vec<i16>,
        sweep_rate: u32,
    ) -> Result<Self, EngineError> {
        if !valid_chunk_size(config.chunk_size) {
            return Err(EngineError::Config(format!(
                "chunk size {} is outside 1..={} samples",
                config.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if config.read_block_bytes < 2 || config.read_block_bytes % 2 != 0 {
            return Err(EngineError::Config(format!(
                "read block of {} bytes does not hold whole samples",
                config.read_block_bytes
            )));
        }
        if sweep_rate != config.sample_rate {
            log::warn!(
                "Sweep is {} Hz but capture runs at {} Hz",
                sweep_rate,
                config.sample_rate
            );
        }

        std::fs::create_dir_all(&config.cache_dir)?;

        let sweep_player = PlaybackSource::new(playback_backend.clone(), sweep, sweep_rate);
        log::debug!(
            "Engine ready: cache {}, sweep {:.2}s",
            config.cache_dir.display(),
            sweep_player.duration_seconds()
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                capture_backend,
                playback_backend,
                transition: Mutex::new(()),
                session: Mutex::new(None),
                sweep_player: Mutex::new(sweep_player),
                debug_player: Mutex::new(None),
                last_outcome: Mutex::new(None),
                published: PublishedState::new(),
            }),
        })
    }

    /// Create an engine on PipeWire with the configured or bundled sweep
    pub fn with_pipewire(config: EngineConfig) -> Result<Self, EngineError> {
        let (format, sweep) = assets::load_sweep(config.sweep_path.as_deref())?;
        Self::new(
            config,
            Arc::new(PipeWireCapture),
            Arc::new(PipeWirePlayback),
            sweep,
            format.sample_rate,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to published state
    pub fn subscribe(&self) -> StateSubscriber {
        self.inner.published.subscribe()
    }

    pub fn state(&self) -> EngineState {
        self.inner.published.phase()
    }

    pub fn measurement_running(&self) -> bool {
        self.inner.published.running()
    }

    pub fn result_curve(&self) -> Arc<ResultCurve> {
        self.inner.published.curve()
    }

    /// Outcome of the most recently finished session
    pub fn last_outcome(&self) -> Option<SessionOutcome> {
        self.inner.last_outcome.lock().clone()
    }

    /// Id of the active session, if any
    pub fn current_session_id(&self) -> Option<Uuid> {
        self.inner.session.lock().as_ref().map(|s| s.id)
    }

    /// Start a session writing to `mode`'s buffer
    ///
    /// Returns `Ok(false)` without side effects if the engine is not idle.
    pub fn start(&self, mode: Mode) -> Result<bool, EngineError> {
        let _transition = self.inner.transition.lock();
        let published = &self.inner.published;

        if published.phase() != EngineState::Idle {
            log::debug!("Ignoring start({}) while {:?}", mode, published.phase());
            return Ok(false);
        }

        if !self.inner.capture_backend.permission_granted() {
            log::warn!("Cannot start {}: microphone permission missing", mode);
            return Err(EngineError::PermissionRequired);
        }

        // The debug player shares the output device
        self.stop_playback();

        published.set_phase(EngineState::Armed(mode));
        match self.arm(mode) {
            Ok(session) => {
                let id = session.id;
                *self.inner.session.lock() = Some(session);
                published.set_running(true);
                published.set_phase(EngineState::Recording(mode));
                log::info!("Started {} session {}", mode, id);
                Ok(true)
            }
            Err(e) => {
                published.set_phase(EngineState::Idle);
                log::error!("Failed to start {}: {}", mode, e);
                Err(e)
            }
        }
    }

    /// Acquire both devices; everything acquired is released again on error
    fn arm(&self, mode: Mode) -> Result<Session, EngineError> {
        let config = &self.inner.config;
        let raw_path = config.raw_path(mode);
        let container_path = config.container_path(mode);

        let device = self.inner.capture_backend.open(config.sample_rate)?;
        let mut capture = CaptureSink::open(&raw_path, device, config.read_block_bytes)?;

        let id = Uuid::new_v4();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        // Exits on its own if the callback is dropped unfired
        self.spawn_supervisor(id, done_rx)?;

        let started = self.inner.sweep_player.lock().play(Box::new(move || {
            let _ = done_tx.send(());
        }));

        match started {
            Ok(true) => {}
            Ok(false) => {
                capture.stop();
                return Err(EngineError::Busy);
            }
            Err(e) => {
                capture.stop();
                return Err(e.into());
            }
        }

        Ok(Session {
            id,
            mode,
            raw_path,
            container_path,
            capture,
        })
    }

    /// Wait for the sweep's completion signal and end the session it belongs to
    fn spawn_supervisor(&self, id: Uuid, done_rx: mpsc::Receiver<()>) -> io::Result<()> {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("avycal-session".to_string())
            .spawn(move || {
                if done_rx.recv().is_err() {
                    return;
                }
                let Some(inner) = engine.upgrade() else {
                    return;
                };
                log::debug!("Sweep finished for session {}", id);
                if let Err(e) = (MeasurementEngine { inner }).stop_session(Some(id)) {
                    log::error!("Failed to finish session {}: {}", id, e);
                }
            })?;
        Ok(())
    }

    /// End the active session early
    ///
    /// A no-op from `Idle`. On return both devices are released, the container
    /// is written and `measurement_running` is false.
    pub fn stop(&self) -> Result<Option<SessionOutcome>, EngineError> {
        self.stop_session(None)
    }

    /// Stop the active session and return its outcome
    ///
    /// If the sweep ended the session first, that session's outcome is returned.
    pub fn stop_and_collect(&self) -> Result<Option<SessionOutcome>, EngineError> {
        Ok(self.stop()?.or_else(|| self.last_outcome()))
    }

    /// Stop the active session if it matches `expected`
    fn stop_session(&self, expected: Option<Uuid>) -> Result<Option<SessionOutcome>, EngineError> {
        let _transition = self.inner.transition.lock();
        let published = &self.inner.published;

        let session = {
            let mut slot = self.inner.session.lock();
            match slot.take() {
                Some(session) if expected.map_or(true, |id| id == session.id) => session,
                other => {
                    *slot = other;
                    return Ok(None);
                }
            }
        };

        let Session {
            id,
            mode,
            raw_path,
            container_path,
            mut capture,
        } = session;

        published.set_phase(EngineState::Stopping(mode));
        if !capture.is_running() {
            log::warn!("Capture into {} ended before the session", capture.target().display());
        }
        let stats = capture.stop();
        drop(capture);
        if stats.dropped_blocks > 0 {
            log::warn!(
                "Session {} lost {} of {} capture blocks",
                id,
                stats.dropped_blocks,
                stats.blocks + stats.dropped_blocks
            );
        }
        self.inner.sweep_player.lock().stop();

        let encoded = wav::encode_file(
            &raw_path,
            &container_path,
            PcmFormat::mono16(self.inner.config.sample_rate),
        )
        .map(|header| SessionOutcome {
            mode,
            raw_path,
            container_path,
            sample_rate: header.format.sample_rate,
            payload_bytes: header.payload_len,
        });

        // Recorded before `running` falls so waiters can read it
        if let Ok(outcome) = &encoded {
            log::info!(
                "Finished {} session {}: {:.2}s captured",
                mode,
                id,
                outcome.duration_seconds()
            );
            *self.inner.last_outcome.lock() = Some(outcome.clone());
        }

        published.set_phase(EngineState::Idle);
        published.set_running(false);

        Ok(Some(encoded?))
    }

    /// Analyze the measurement buffer, or the calibration buffer if no
    /// measurement has been captured yet
    pub fn analyze(&self) -> Result<Arc<ResultCurve>, EngineError> {
        let mode = if self.inner.config.raw_path(Mode::Measurement).exists() {
            Mode::Measurement
        } else {
            Mode::Calibration
        };
        self.analyze_mode(mode)
    }

    /// Analyze one mode's raw buffer and publish the curve
    pub fn analyze_mode(&self, mode: Mode) -> Result<Arc<ResultCurve>, EngineError> {
        let Some(_transition) = self.inner.transition.try_lock() else {
            return Err(EngineError::Busy);
        };
        let published = &self.inner.published;
        if published.phase().is_session_active() {
            return Err(EngineError::Busy);
        }

        let config = &self.inner.config;
        let raw_path = config.raw_path(mode);

        published.set_phase(EngineState::Analyzing);
        let result = SpectralAnalyzer::new(config.chunk_size, config.sample_rate)
            .and_then(|mut analyzer| analyzer.analyze_file(&raw_path));
        published.set_phase(EngineState::Idle);

        let curve = Arc::new(result?);
        published.publish_curve(curve.clone());
        log::info!(
            "Analyzed {}: {} chunks, {:.2}s",
            mode,
            curve.len(),
            curve.duration_seconds()
        );

        let report = MeasurementReport::new(mode, raw_path.display().to_string(), (*curve).clone());
        if let Err(e) = ReportStore::new(config.report_path()).save(&report) {
            log::warn!("Failed to save report: {:#}", e);
        }

        Ok(curve)
    }

    /// Run an analysis on the blocking pool; `None` picks the buffer like `analyze`
    pub fn analyze_in_background(
        &self,
        mode: Option<Mode>,
    ) -> tokio::task::JoinHandle<Result<Arc<ResultCurve>, EngineError>> {
        let engine = self.clone();
        tokio_runtime::spawn_blocking(move || match mode {
            Some(mode) => engine.analyze_mode(mode),
            None => engine.analyze(),
        })
    }

    /// Replay a stored container through the debug player
    ///
    /// The returned receiver resolves when playback ends or is stopped.
    pub fn playback(&self, mode: Mode) -> Result<oneshot::Receiver<()>, EngineError> {
        let _transition = self.inner.transition.lock();
        if self.inner.published.phase().is_session_active() {
            return Err(EngineError::Busy);
        }

        let path = self.inner.config.container_path(mode);
        if !path.exists() {
            return Err(EngineError::SourceUnavailable(path));
        }
        let (format, samples) = wav::read_samples(&path)?;

        self.stop_playback();

        let id = Uuid::new_v4();
        let (finished_tx, finished_rx) = mpsc::channel::<()>();
        let done_rx = self.spawn_playback_watcher(id, finished_rx)?;

        let mut slot = self.inner.debug_player.lock();
        let mut player =
            PlaybackSource::new(self.inner.playback_backend.clone(), samples, format.sample_rate);
        player.play(Box::new(move || {
            let _ = finished_tx.send(());
        }))?;
        log::info!(
            "Playing {} ({:.2}s)",
            path.display(),
            player.duration_seconds()
        );
        *slot = Some(DebugPlayback { id, player });

        Ok(done_rx)
    }

    /// Release the debug player once its playback ends, then resolve `done`
    ///
    /// The device thread fires the completion, so the device is dropped here
    /// rather than from the callback.
    fn spawn_playback_watcher(
        &self,
        id: Uuid,
        finished_rx: mpsc::Receiver<()>,
    ) -> io::Result<oneshot::Receiver<()>> {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let (done_tx, done_rx) = oneshot::channel();
        thread::Builder::new()
            .name("avycal-debug-playback".to_string())
            .spawn(move || {
                if finished_rx.recv().is_err() {
                    return;
                }
                if let Some(inner) = engine.upgrade() {
                    let finished = {
                        let mut slot = inner.debug_player.lock();
                        match slot.take() {
                            Some(debug) if debug.id == id => Some(debug),
                            other => {
                                *slot = other;
                                None
                            }
                        }
                    };
                    if let Some(mut debug) = finished {
                        debug.player.stop();
                        log::debug!("Debug playback {} finished", id);
                    }
                }
                let _ = done_tx.send(());
            })?;
        Ok(done_rx)
    }

    /// Stop debug playback, releasing its device
    pub fn stop_playback(&self) {
        let debug = self.inner.debug_player.lock().take();
        if let Some(mut debug) = debug {
            debug.player.stop();
        }
    }
}

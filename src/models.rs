use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Sample rate of every capture and container (Hz)
pub const SAMPLE_RATE: u32 = 44100;

/// Bits per sample of the raw buffers
pub const BITS_PER_SAMPLE: u16 = 16;

/// Capture is mono only
pub const CHANNELS: u16 = 1;

/// Size of the capture device buffer in bytes; each read fills half of it
pub const DEVICE_BUFFER_BYTES: usize = 512;

/// Samples per analysis chunk (~22.7 ms at 44.1 kHz)
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Largest accepted analysis chunk; one FFT plan of this size is held in memory
pub const MAX_CHUNK_SIZE: usize = 1 << 20;

/// Check a chunk size against `1..=MAX_CHUNK_SIZE`
pub fn valid_chunk_size(chunk_size: usize) -> bool {
    (1..=MAX_CHUNK_SIZE).contains(&chunk_size)
}

/// Which of the two buffers a session writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Calibration,
    Measurement,
}

impl Mode {
    pub fn all() -> &'static [Mode] {
        &[Mode::Calibration, Mode::Measurement]
    }

    /// File stem shared by the raw buffer and its container
    pub fn file_stem(&self) -> &'static str {
        match self {
            Mode::Calibration => "calibration",
            Mode::Measurement => "measurement",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "calibration" | "c" => Ok(Mode::Calibration),
            "measurement" | "m" => Ok(Mode::Measurement),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// One entry of a result curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    /// Chunk position in the raw buffer
    pub index: usize,
    /// Peak magnitude of the chunk's spectrum
    pub magnitude: f32,
    /// Frequency of the bin holding the peak (Hz)
    pub peak_frequency: f32,
}

/// Per-chunk peak spectral magnitude, in temporal order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultCurve {
    pub chunk_size: usize,
    pub sample_rate: u32,
    pub points: Vec<CurvePoint>,
}

impl ResultCurve {
    pub fn new(chunk_size: usize, sample_rate: u32, points: Vec<CurvePoint>) -> Self {
        Self {
            chunk_size,
            sample_rate,
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Start time of a chunk relative to the start of the capture
    pub fn chunk_start_seconds(&self, index: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (index * self.chunk_size) as f64 / self.sample_rate as f64
    }

    /// Duration of the analysed audio (full chunks only)
    pub fn duration_seconds(&self) -> f64 {
        self.chunk_start_seconds(self.points.len())
    }

    /// Largest magnitude in the curve
    pub fn peak(&self) -> Option<&CurvePoint> {
        self.points
            .iter()
            .max_by(|a, b| a.magnitude.total_cmp(&b.magnitude))
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub chunk_size: usize,
    /// Bytes read from the capture device per block
    pub read_block_bytes: usize,
    /// Directory holding the raw buffers, containers and report
    pub cache_dir: PathBuf,
    /// Replacement for the bundled sweep
    pub sweep_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Default cache directory (~/.cache/avycal)
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("avycal")
    }

    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cache_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_sweep_path(mut self, path: Option<PathBuf>) -> Self {
        self.sweep_path = path;
        self
    }

    pub fn raw_path(&self, mode: Mode) -> PathBuf {
        self.cache_dir.join(format!("{}.pcm", mode.file_stem()))
    }

    pub fn container_path(&self, mode: Mode) -> PathBuf {
        self.cache_dir.join(format!("{}.wav", mode.file_stem()))
    }

    pub fn report_path(&self) -> PathBuf {
        self.cache_dir.join("results.json")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_block_bytes: DEVICE_BUFFER_BYTES / 2,
            cache_dir: Self::default_cache_dir(),
            sweep_path: None,
        }
    }
}

/// Persisted outcome of an analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementReport {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub mode: Mode,
    pub source_file: String,
    pub curve: ResultCurve,
}

impl MeasurementReport {
    pub fn new(mode: Mode, source_file: String, curve: ResultCurve) -> Self {
        Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            mode,
            source_file,
            curve,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("calibration".parse::<Mode>(), Ok(Mode::Calibration));
        assert_eq!("M".parse::<Mode>(), Ok(Mode::Measurement));
        assert!("sweep".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_paths() {
        let config = EngineConfig::default().with_cache_dir("/tmp/avycal-test");
        assert_eq!(
            config.raw_path(Mode::Calibration),
            PathBuf::from("/tmp/avycal-test/calibration.pcm")
        );
        assert_eq!(
            config.container_path(Mode::Measurement),
            PathBuf::from("/tmp/avycal-test/measurement.wav")
        );
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(!valid_chunk_size(0));
        assert!(valid_chunk_size(1));
        assert!(valid_chunk_size(DEFAULT_CHUNK_SIZE));
        assert!(valid_chunk_size(MAX_CHUNK_SIZE));
        assert!(!valid_chunk_size(MAX_CHUNK_SIZE + 1));
        assert!(!valid_chunk_size(usize::MAX / 2));
    }

    #[test]
    fn test_default_read_block_is_half_device_buffer() {
        assert_eq!(EngineConfig::default().read_block_bytes, 256);
    }

    #[test]
    fn test_curve_timing() {
        let points = (0..44)
            .map(|index| CurvePoint {
                index,
                magnitude: index as f32,
                peak_frequency: 441.0,
            })
            .collect();
        let curve = ResultCurve::new(1000, 44100, points);
        assert!((curve.chunk_start_seconds(1) - 1000.0 / 44100.0).abs() < 1e-9);
        assert!((curve.duration_seconds() - 44000.0 / 44100.0).abs() < 1e-9);
        assert_eq!(curve.peak().map(|p| p.index), Some(43));
    }
}

//! Chunked spectral analysis of raw captures
//!
//! A raw buffer is cut into consecutive, non-overlapping chunks. Each full
//! chunk is transformed as-is (no window) and reduced to the magnitude of its
//! strongest bin. A trailing partial chunk is dropped.

use crate::models::{valid_chunk_size, CurvePoint, ResultCurve, MAX_CHUNK_SIZE};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Spectral analysis errors
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Raw buffer unavailable: {path}: {source}")]
    SourceUnavailable { path: PathBuf, source: io::Error },

    #[error("Failed to read raw buffer: {0}")]
    Read(#[from] io::Error),

    #[error("Chunk size {0} is outside 1..={max} samples", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize(usize),
}

/// Peak-magnitude analyzer over fixed-size chunks
pub struct SpectralAnalyzer {
    chunk_size: usize,
    sample_rate: u32,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralAnalyzer {
    pub fn new(chunk_size: usize, sample_rate: u32) -> Result<Self, AnalysisError> {
        if !valid_chunk_size(chunk_size) {
            return Err(AnalysisError::InvalidChunkSize(chunk_size));
        }

        let fft = FftPlanner::new().plan_fft_forward(chunk_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Ok(Self {
            chunk_size,
            sample_rate,
            fft,
            buffer: vec![Complex::new(0.0, 0.0); chunk_size],
            scratch,
        })
    }

    /// Frequency of an FFT bin in Hz
    pub fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate as f32 / self.chunk_size as f32
    }

    /// Largest spectral magnitude of one chunk and the bin it sits in
    ///
    /// Only bins up to Nyquist are searched; the rest mirror them for real input.
    pub fn chunk_peak(&mut self, chunk: &[i16]) -> (f32, usize) {
        debug_assert_eq!(chunk.len(), self.chunk_size);

        for (slot, &sample) in self.buffer.iter_mut().zip(chunk) {
            *slot = Complex::new(sample as f32, 0.0);
        }
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        self.buffer[..=self.chunk_size / 2]
            .iter()
            .map(|c| c.norm())
            .enumerate()
            .fold((0.0f32, 0usize), |best, (bin, magnitude)| {
                if magnitude > best.0 {
                    (magnitude, bin)
                } else {
                    best
                }
            })
    }

    fn point(&mut self, index: usize, chunk: &[i16]) -> CurvePoint {
        let (magnitude, bin) = self.chunk_peak(chunk);
        CurvePoint {
            index,
            magnitude,
            peak_frequency: self.bin_frequency(bin),
        }
    }

    /// Analyze a stream of little-endian 16-bit samples, chunk by chunk
    pub fn analyze_reader<R: Read>(&mut self, mut reader: R) -> io::Result<ResultCurve> {
        let mut bytes = vec![0u8; self.chunk_size * 2];
        let mut chunk = vec![0i16; self.chunk_size];
        let mut points = Vec::new();

        while read_full(&mut reader, &mut bytes)? == bytes.len() {
            for (sample, pair) in chunk.iter_mut().zip(bytes.chunks_exact(2)) {
                *sample = i16::from_le_bytes([pair[0], pair[1]]);
            }
            let point = self.point(points.len(), &chunk);
            log::trace!(
                "chunk {}: peak {:.1} at {:.0} Hz",
                point.index,
                point.magnitude,
                point.peak_frequency
            );
            points.push(point);
        }

        Ok(ResultCurve::new(self.chunk_size, self.sample_rate, points))
    }

    /// Analyze a raw buffer file
    pub fn analyze_file(&mut self, path: impl AsRef<Path>) -> Result<ResultCurve, AnalysisError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| AnalysisError::SourceUnavailable {
            path: path.to_path_buf(),
            source,
        })?;

        let curve = self.analyze_reader(BufReader::new(file))?;
        log::debug!(
            "Analyzed {}: {} chunks of {} samples",
            path.display(),
            curve.len(),
            self.chunk_size
        );
        Ok(curve)
    }
}

/// Read until `buf` is full or the stream ends; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

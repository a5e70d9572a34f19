//! WAV container encoding for raw PCM captures
//!
//! The canonical 44-byte header is written by hand so its layout is exact.
//! Decoding of whole files goes through hound.

use crate::models::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE};
use hound::{SampleFormat, WavReader};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Length of the canonical RIFF/WAVE header
pub const HEADER_LEN: usize = 44;

/// Bytes counted by the RIFF size field before the payload
const RIFF_OVERHEAD: u32 = 36;

/// Container codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed WAV header: {0}")]
    Malformed(String),

    #[error("Unsupported WAV format: {0}")]
    Unsupported(String),

    #[error("Failed to decode WAV: {0}")]
    Decode(#[from] hound::Error),
}

/// Layout of interleaved integer PCM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl PcmFormat {
    /// 16-bit mono at the given rate
    pub fn mono16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bits_per_sample: 16,
            channels: 1,
        }
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * self.bits_per_sample as u32 / 8
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            bits_per_sample: BITS_PER_SAMPLE,
            channels: CHANNELS,
        }
    }
}

/// Fields carried by the canonical header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub format: PcmFormat,
    pub payload_len: u32,
}

impl WavHeader {
    pub fn new(format: PcmFormat, payload_len: u32) -> Self {
        Self {
            format,
            payload_len,
        }
    }

    /// Serialize to the 44-byte canonical layout
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        let fmt = &self.format;

        header[0..4].copy_from_slice(b"RIFF");
        header[4..8].copy_from_slice(&(self.payload_len + RIFF_OVERHEAD).to_le_bytes());
        header[8..12].copy_from_slice(b"WAVE");

        header[12..16].copy_from_slice(b"fmt ");
        header[16..20].copy_from_slice(&16u32.to_le_bytes());
        header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
        header[22..24].copy_from_slice(&fmt.channels.to_le_bytes());
        header[24..28].copy_from_slice(&fmt.sample_rate.to_le_bytes());
        header[28..32].copy_from_slice(&fmt.byte_rate().to_le_bytes());
        header[32..34].copy_from_slice(&fmt.block_align().to_le_bytes());
        header[34..36].copy_from_slice(&fmt.bits_per_sample.to_le_bytes());

        header[36..40].copy_from_slice(b"data");
        header[40..44].copy_from_slice(&self.payload_len.to_le_bytes());
        header
    }

    /// Parse a canonical header from the start of `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::Malformed(format!(
                "expected {} header bytes, got {}",
                HEADER_LEN,
                bytes.len()
            )));
        }

        let tag = |range: std::ops::Range<usize>, expected: &[u8]| {
            if &bytes[range.clone()] == expected {
                Ok(())
            } else {
                Err(CodecError::Malformed(format!(
                    "expected '{}' at byte {}",
                    String::from_utf8_lossy(expected),
                    range.start
                )))
            }
        };
        tag(0..4, b"RIFF")?;
        tag(8..12, b"WAVE")?;
        tag(12..16, b"fmt ")?;
        tag(36..40, b"data")?;

        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        if u32_at(16) != 16 || u16_at(20) != 1 {
            return Err(CodecError::Unsupported(
                "only plain PCM fmt chunks are supported".to_string(),
            ));
        }

        let format = PcmFormat {
            channels: u16_at(22),
            sample_rate: u32_at(24),
            bits_per_sample: u16_at(34),
        };
        let payload_len = u32_at(40);

        if u32_at(4) != payload_len.wrapping_add(RIFF_OVERHEAD) {
            return Err(CodecError::Malformed(
                "RIFF size does not match data size".to_string(),
            ));
        }

        Ok(Self {
            format,
            payload_len,
        })
    }
}

fn payload_len(len: u64) -> Result<u32, CodecError> {
    u32::try_from(len)
        .ok()
        .filter(|l| l.checked_add(RIFF_OVERHEAD).is_some())
        .ok_or_else(|| {
            CodecError::Unsupported(format!("payload of {} bytes exceeds the RIFF limit", len))
        })
}

/// Wrap raw PCM bytes into a container; the payload is copied unchanged
pub fn encode(raw: &[u8], format: PcmFormat) -> Result<Vec<u8>, CodecError> {
    let header = WavHeader::new(format, payload_len(raw.len() as u64)?);
    let mut container = Vec::with_capacity(HEADER_LEN + raw.len());
    container.extend_from_slice(&header.to_bytes());
    container.extend_from_slice(raw);
    Ok(container)
}

/// Split a container into its header and payload
pub fn decode(container: &[u8]) -> Result<(WavHeader, &[u8]), CodecError> {
    let header = WavHeader::parse(container)?;
    let end = HEADER_LEN + header.payload_len as usize;
    if container.len() < end {
        return Err(CodecError::Malformed(format!(
            "data chunk declares {} bytes, only {} present",
            header.payload_len,
            container.len() - HEADER_LEN
        )));
    }
    Ok((header, &container[HEADER_LEN..end]))
}

/// Write the container for a raw buffer file
///
/// The raw file must not be written concurrently.
pub fn encode_file(
    raw_path: impl AsRef<Path>,
    wav_path: impl AsRef<Path>,
    format: PcmFormat,
) -> Result<WavHeader, CodecError> {
    let raw = File::open(raw_path.as_ref())?;
    let header = WavHeader::new(format, payload_len(raw.metadata()?.len())?);

    let mut out = BufWriter::new(File::create(wav_path.as_ref())?);
    out.write_all(&header.to_bytes())?;
    let copied = io::copy(
        &mut BufReader::new(raw).take(header.payload_len as u64),
        &mut out,
    )?;
    out.flush()?;

    if copied != header.payload_len as u64 {
        return Err(CodecError::Malformed(format!(
            "raw buffer shrank while encoding ({} of {} bytes)",
            copied, header.payload_len
        )));
    }

    log::debug!(
        "Encoded {} into {} ({} bytes)",
        raw_path.as_ref().display(),
        wav_path.as_ref().display(),
        header.payload_len
    );
    Ok(header)
}

/// Load 16-bit integer samples from a WAV file, mixed to mono
pub fn read_samples(path: impl AsRef<Path>) -> Result<(PcmFormat, Vec<i16>), CodecError> {
    let file = File::open(path.as_ref())?;
    read_samples_from(BufReader::new(file))
}

/// Load 16-bit integer samples from any WAV stream, mixed to mono
pub fn read_samples_from<R: Read>(reader: R) -> Result<(PcmFormat, Vec<i16>), CodecError> {
    let reader = WavReader::new(reader)?;
    let spec = reader.spec();

    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(CodecError::Unsupported(format!(
            "{:?} with {} bits per sample",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;

    let channels = spec.channels.max(1) as usize;
    let mono = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / channels as i32) as i16)
            .collect()
    } else {
        samples
    };

    Ok((PcmFormat::mono16(spec.sample_rate), mono))
}

/// Get duration of a sample count in seconds
pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    sample_count as f64 / sample_rate as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use uuid::Uuid;

    #[test]
    fn test_header_layout() {
        let bytes = encode(&[0u8; 10], PcmFormat::default()).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 10);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[4..8], &46u32.to_le_bytes());
        assert_eq!(&bytes[8..16], b"WAVEfmt ");
        assert_eq!(&bytes[16..20], &16u32.to_le_bytes());
        assert_eq!(&bytes[20..22], &1u16.to_le_bytes());
        assert_eq!(&bytes[22..24], &1u16.to_le_bytes());
        assert_eq!(&bytes[24..28], &44100u32.to_le_bytes());
        assert_eq!(&bytes[28..32], &88200u32.to_le_bytes());
        assert_eq!(&bytes[32..34], &2u16.to_le_bytes());
        assert_eq!(&bytes[34..36], &16u16.to_le_bytes());
        assert_eq!(&bytes[36..40], b"data");
        assert_eq!(&bytes[40..44], &10u32.to_le_bytes());
    }

    #[test]
    fn test_round_trip_recovers_fields_and_payload() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1003).collect();
        let formats = [
            PcmFormat::mono16(44100),
            PcmFormat {
                sample_rate: 8000,
                bits_per_sample: 8,
                channels: 2,
            },
            PcmFormat {
                sample_rate: 96000,
                bits_per_sample: 24,
                channels: 6,
            },
        ];

        for format in formats {
            let container = encode(&payload, format).unwrap();
            let (header, decoded) = decode(&container).unwrap();
            assert_eq!(header.format, format);
            assert_eq!(header.payload_len as usize, payload.len());
            assert_eq!(decoded, payload.as_slice());
        }
    }

    #[test]
    fn test_empty_payload() {
        let container = encode(&[], PcmFormat::default()).unwrap();
        assert_eq!(container.len(), HEADER_LEN);
        let (header, payload) = decode(&container).unwrap();
        assert_eq!(header.payload_len, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            WavHeader::parse(b"RIFF"),
            Err(CodecError::Malformed(_))
        ));
        let mut container = encode(&[1, 2, 3, 4], PcmFormat::default()).unwrap();
        container[8..12].copy_from_slice(b"AVI ");
        assert!(matches!(decode(&container), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut container = encode(&[0u8; 8], PcmFormat::default()).unwrap();
        container.truncate(HEADER_LEN + 4);
        assert!(matches!(decode(&container), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_standard_decoder_reads_container() {
        let samples: Vec<i16> = vec![0, 1000, -1000, i16::MAX, i16::MIN];
        let raw: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let container = encode(&raw, PcmFormat::default()).unwrap();

        let (format, decoded) = read_samples_from(Cursor::new(container)).unwrap();
        assert_eq!(format, PcmFormat::default());
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_encode_file_matches_in_memory_encoding() {
        let dir = std::env::temp_dir().join(format!("avycal-wav-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let raw_path = dir.join("raw.pcm");
        let wav_path = dir.join("raw.wav");
        let raw: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&raw_path, &raw).unwrap();

        let header = encode_file(&raw_path, &wav_path, PcmFormat::default()).unwrap();
        assert_eq!(header.payload_len, 2000);
        assert_eq!(
            std::fs::read(&wav_path).unwrap(),
            encode(&raw, PcmFormat::default()).unwrap()
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_duration_calculation() {
        assert_eq!(duration_seconds(44100, 44100), 1.0);
        assert_eq!(duration_seconds(22050, 44100), 0.5);
    }
}

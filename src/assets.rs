//! Bundled reference audio
//!
//! The sweep tone is embedded at compile time using rust_embed.

use crate::audio::wav::{self, CodecError, PcmFormat};
use rust_embed::RustEmbed;
use std::io::{self, Cursor};
use std::path::Path;

/// Name of the embedded sweep
pub const SWEEP_ASSET: &str = "sweep.wav";

#[derive(RustEmbed)]
#[folder = "assets"]
#[include = "*.wav"]
pub struct Assets;

/// Load the reference sweep, preferring `override_path` when given
pub fn load_sweep(override_path: Option<&Path>) -> Result<(PcmFormat, Vec<i16>), CodecError> {
    if let Some(path) = override_path {
        log::info!("Using sweep from {}", path.display());
        return wav::read_samples(path);
    }

    let file = Assets::get(SWEEP_ASSET).ok_or_else(|| {
        CodecError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("embedded asset {} missing", SWEEP_ASSET),
        ))
    })?;
    wav::read_samples_from(Cursor::new(file.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SAMPLE_RATE;

    #[test]
    fn test_embedded_sweep_is_mono_16bit_at_capture_rate() {
        let (format, samples) = load_sweep(None).unwrap();
        assert_eq!(format, PcmFormat::mono16(SAMPLE_RATE));
        assert!(samples.len() >= SAMPLE_RATE as usize);
        assert!(samples.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_missing_override_is_an_error() {
        assert!(load_sweep(Some(Path::new("/nonexistent/sweep.wav"))).is_err());
    }
}

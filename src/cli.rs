//! Command-line interface for Avycal
//!
//! Handles argument parsing and logging configuration.

use crate::models::{EngineConfig, Mode};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;

/// Avycal - Acoustic sweep measurement instrument
#[derive(Parser, Debug)]
#[command(name = "avycal")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Samples per analysis chunk
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Directory for raw buffers, containers and the report
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// WAV file to play instead of the bundled sweep
    #[arg(long, global = true)]
    pub sweep: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record the calibration buffer while the sweep plays
    Calibrate {
        /// Analyze the buffer once the session ends
        #[arg(long)]
        analyze: bool,
    },
    /// Record the measurement buffer while the sweep plays
    Measure {
        /// Analyze the buffer once the session ends
        #[arg(long)]
        analyze: bool,
    },
    /// Play back a stored container
    Play {
        #[arg(value_parser = parse_mode)]
        mode: Mode,
    },
    /// Analyze a raw buffer and print the result curve
    Analyze {
        /// Buffer to analyze (default: measurement, else calibration)
        #[arg(long, value_parser = parse_mode)]
        mode: Option<Mode>,

        /// Print the curve as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show configured paths and stored captures
    Status,
    /// Save the given global options as defaults; an empty path clears one
    Config,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    s.parse()
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Layer command-line overrides over `config`
    pub fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(chunk_size) = self.chunk_size {
            config = config.with_chunk_size(chunk_size);
        }
        if let Some(dir) = &self.cache_dir {
            config = config.with_cache_dir(dir);
        }
        if self.sweep.is_some() {
            config = config.with_sweep_path(self.sweep.clone());
        }
        config
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("avycal", args.log_level());

    // Audio server internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("pipewire", args.log_level());
        builder.filter_module("libspa", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        let args = Args::parse_from(["avycal", "-vv", "status"]);
        assert_eq!(args.log_level(), LevelFilter::Debug);

        let args = Args::parse_from(["avycal", "status", "-q", "-v"]);
        assert_eq!(args.log_level(), LevelFilter::Error);
    }

    #[test]
    fn test_overrides_apply_over_config() {
        let args = Args::parse_from([
            "avycal",
            "--chunk-size",
            "2048",
            "--cache-dir",
            "/tmp/avycal-cli",
            "analyze",
            "--mode",
            "c",
        ]);
        let config = args.apply(EngineConfig::default());
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/avycal-cli"));
        assert!(config.sweep_path.is_none());
        assert!(matches!(
            args.command,
            Command::Analyze {
                mode: Some(Mode::Calibration),
                json: false
            }
        ));
    }

    #[test]
    fn test_play_requires_known_mode() {
        assert!(Args::try_parse_from(["avycal", "play", "sweep"]).is_err());
        let args = Args::parse_from(["avycal", "play", "measurement"]);
        assert!(matches!(
            args.command,
            Command::Play {
                mode: Mode::Measurement
            }
        ));
    }
}

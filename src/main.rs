//! Avycal - An acoustic sweep measurement instrument for Linux
//!
//! Plays a reference sweep while recording the microphone, wraps each capture
//! in a WAV container and reduces it to a per-chunk peak magnitude curve.

mod analysis;
mod assets;
mod audio;
mod cli;
mod engine;
mod models;
mod report;
mod settings;
mod tokio_runtime;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::Command;
use engine::{MeasurementEngine, SessionOutcome};
use log::info;
use models::{EngineConfig, Mode, ResultCurve};
use report::ReportStore;

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    if let Command::Config = args.command {
        return save_settings(&args);
    }

    let config = args.apply(settings::apply(EngineConfig::default()));
    info!("Starting Avycal with cache {}", config.cache_dir.display());

    if let Command::Status = args.command {
        return print_status(&config);
    }

    let engine = MeasurementEngine::with_pipewire(config).context("Failed to set up the engine")?;

    match args.command {
        Command::Calibrate { analyze } => run_session(&engine, Mode::Calibration, analyze),
        Command::Measure { analyze } => run_session(&engine, Mode::Measurement, analyze),
        Command::Play { mode } => play(&engine, mode),
        Command::Analyze { mode, json } => {
            if let Some(mode) = mode {
                engine.analyze_mode(mode)?;
            } else {
                engine.analyze()?;
            }
            print_curve(&engine.result_curve(), json)
        }
        Command::Status | Command::Config => Ok(()),
    }
}

/// Record one session, stopping early on Ctrl-C
fn run_session(engine: &MeasurementEngine, mode: Mode, analyze: bool) -> Result<()> {
    let mut subscriber = engine.subscribe();
    if !engine.start(mode)? {
        bail!("A session is already running");
    }
    if let Some(id) = engine.current_session_id() {
        info!("Session {} is {:?}", id, engine.state());
    }
    println!(
        "Recording {} into {} (Ctrl-C to stop)",
        mode,
        engine.config().raw_path(mode).display()
    );

    let interrupted = tokio_runtime::block_on(async {
        tokio::select! {
            _ = subscriber.wait_until_idle() => false,
            _ = tokio::signal::ctrl_c() => true,
        }
    });

    let outcome = if interrupted {
        info!("Interrupted while {:?}, stopping session", subscriber.phase());
        engine.stop_and_collect()?
    } else {
        engine.last_outcome()
    };
    let Some(outcome) = outcome else {
        bail!("Session ended without writing a container");
    };
    print_outcome(&outcome);

    if analyze {
        tokio_runtime::block_on(engine.analyze_in_background(Some(mode)))
            .context("Analysis task failed")??;
        print_curve(&subscriber.result_curve(), false)?;
    }
    Ok(())
}

fn play(engine: &MeasurementEngine, mode: Mode) -> Result<()> {
    let done = engine.playback(mode)?;
    println!(
        "Playing {} (Ctrl-C to stop)",
        engine.config().container_path(mode).display()
    );

    tokio_runtime::block_on(async {
        tokio::select! {
            _ = done => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    });
    engine.stop_playback();
    Ok(())
}

fn print_outcome(outcome: &SessionOutcome) {
    println!(
        "Captured {:.2}s of {} audio",
        outcome.duration_seconds(),
        outcome.mode
    );
    println!("  raw:       {}", outcome.raw_path.display());
    println!("  container: {}", outcome.container_path.display());
}

fn print_curve(curve: &ResultCurve, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(curve)?);
        return Ok(());
    }

    println!("{:>6} {:>9} {:>14} {:>10}", "chunk", "time (s)", "magnitude", "peak (Hz)");
    for point in &curve.points {
        println!(
            "{:>6} {:>9.3} {:>14.1} {:>10.1}",
            point.index,
            curve.chunk_start_seconds(point.index),
            point.magnitude,
            point.peak_frequency
        );
    }

    match curve.peak() {
        Some(peak) => println!(
            "{} chunks over {:.2}s, strongest {:.1} at chunk {} ({:.1} Hz)",
            curve.len(),
            curve.duration_seconds(),
            peak.magnitude,
            peak.index,
            peak.peak_frequency
        ),
        None => println!("Capture is shorter than one chunk ({} samples)", curve.chunk_size),
    }
    Ok(())
}

fn print_status(config: &EngineConfig) -> Result<()> {
    println!("Cache directory: {}", config.cache_dir.display());
    println!("Chunk size:      {} samples", config.chunk_size);
    match &config.sweep_path {
        Some(path) => println!("Sweep:           {}", path.display()),
        None => println!("Sweep:           bundled {}", assets::SWEEP_ASSET),
    }

    for &mode in Mode::all() {
        let raw = config.raw_path(mode);
        match std::fs::metadata(&raw) {
            Ok(meta) => println!(
                "{:<12} {} ({:.2}s)",
                mode.to_string(),
                raw.display(),
                audio::wav::duration_seconds(meta.len() as usize / 2, config.sample_rate)
            ),
            Err(_) => println!("{:<12} not recorded", mode.to_string()),
        }
        let container = config.container_path(mode);
        if container.exists() {
            println!("{:<12} {}", "", container.display());
        }
    }

    let store = ReportStore::new(config.report_path());
    match store.load()? {
        Some(report) => println!(
            "Last analysis: {} of {} at {}, {} chunks",
            report.id,
            report.mode,
            report.created.format("%Y-%m-%d %H:%M:%S"),
            report.curve.len()
        ),
        None => println!("Last analysis: none in {}", store.path().display()),
    }
    Ok(())
}

/// Persist the global options given on the command line
fn save_settings(args: &cli::Args) -> Result<()> {
    let mut saved = false;
    if let Some(chunk_size) = args.chunk_size {
        if !models::valid_chunk_size(chunk_size) {
            bail!(
                "Chunk size must be between 1 and {} samples",
                models::MAX_CHUNK_SIZE
            );
        }
        settings::set_chunk_size(chunk_size);
        saved = true;
    }
    if let Some(dir) = &args.cache_dir {
        settings::set_cache_dir(&dir.to_string_lossy());
        saved = true;
    }
    if let Some(path) = &args.sweep {
        settings::set_sweep_path(&path.to_string_lossy());
        saved = true;
    }

    if !saved {
        println!("Nothing to save; pass --chunk-size, --cache-dir or --sweep");
    }
    Ok(())
}

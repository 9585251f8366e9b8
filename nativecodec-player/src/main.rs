//! # nativecodec Player
//!
//! Headless driver for the playback engine: open a source, play it to the
//! end on a windowless surface, optionally rewind to a preview frame, then
//! print the engine statistics as JSON.

use anyhow::Result;
use nativecodec_core::sink::{FanoutSink, FrameSink, HeadlessSurface, RawFileSink, StatsSink};
use nativecodec_core::{
    DisplayTarget, EngineConfig, MediaSource, PacingPolicy, PlaybackEngine, PlaybackState,
    ReferenceBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_PACING_WAIT_MS: u64 = 100;

struct PlayerOptions {
    input: String,
    config: Option<PathBuf>,
    enforce_pacing: Option<u64>,
    dump: Option<PathBuf>,
    rewind: bool,
    timeout_ms: u64,
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nativecodec=info,nativecodec_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("nativecodec v{}", nativecodec_core::VERSION);

    let mut config = match &options.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(&EngineConfig::default_path())?,
    };
    if let Some(max_wait_ms) = options.enforce_pacing {
        config.pacing = PacingPolicy::Enforce { max_wait_ms };
    }

    run(&options, config)
}

fn run(options: &PlayerOptions, config: EngineConfig) -> Result<()> {
    let stats_sink = Arc::new(StatsSink::new());
    let mut sinks: Vec<Arc<dyn FrameSink>> = vec![stats_sink.clone() as Arc<dyn FrameSink>];
    let dump_sink = match &options.dump {
        Some(path) => {
            let sink = Arc::new(RawFileSink::create(path)?);
            sinks.push(sink.clone());
            Some(sink)
        }
        None => None,
    };

    let backend = Arc::new(ReferenceBackend::new(config.backend.clone()));
    let mut engine = PlaybackEngine::new(config, backend, Arc::new(FanoutSink::new(sinks)));

    let source = MediaSource::parse(&options.input);
    let started = Instant::now();
    engine.create(&source)?;

    let surface = Arc::new(HeadlessSurface::new(1));
    engine.set_display_target(Some(DisplayTarget::new(surface.clone())));
    engine.resume();

    let timeout = Duration::from_millis(options.timeout_ms);
    let finished = engine.wait_until(timeout, |s| s.drained || s.state == PlaybackState::Done);
    if !finished {
        tracing::warn!("Playback did not finish within {} ms", options.timeout_ms);
    }

    let stats = engine.stats();
    tracing::info!(
        "Played {} frames in {:.2}s (late: {}, surface geometry: {:?})",
        stats.frames_delivered,
        started.elapsed().as_secs_f64(),
        stats.late_frames,
        surface.geometry()
    );

    if options.rewind && engine.state() != PlaybackState::Done {
        rewind_preview(&engine, timeout);
    }

    engine.shutdown();
    if let Some(sink) = dump_sink {
        sink.finish()?;
        tracing::info!("Dumped {} frames", sink.frames());
    }
    if let Some(worst) = stats_sink.worst_delay_us() {
        tracing::info!("Worst frame delay: {} us", worst);
    }

    let stats = engine.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Some(err) = stats.last_error {
        tracing::warn!("Last engine error: {}", err);
    }
    Ok(())
}

/// Pause, seek to the start and wait for the single preview frame.
fn rewind_preview(engine: &PlaybackEngine, timeout: Duration) {
    let acks = engine.stats().pause_acks;
    engine.pause();
    if engine.stats().state == PlaybackState::Playing {
        engine.wait_until(timeout, |s| s.pause_acks > acks);
    }

    let before = engine.stats().frames_delivered;
    engine.seek_to_start();
    let previewed = engine.wait_until(timeout, |s| {
        s.frames_delivered > before && !s.pumping && s.state == PlaybackState::Ready
    });

    let stats = engine.stats();
    if previewed {
        tracing::info!(
            "Rewound; preview frame pts={}us",
            stats.last_pts_us.unwrap_or_default()
        );
    } else {
        tracing::warn!("No preview frame after rewind");
    }
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut input: Option<String> = None;
    let mut config: Option<PathBuf> = None;
    let mut enforce_pacing = None;
    let mut dump = None;
    let mut rewind = false;
    let mut timeout_ms: u64 = 60_000;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--input" | "-i" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --input"))?;
                input = Some(value.clone());
                i += 2;
            }
            "--config" | "-c" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                config = Some(PathBuf::from(value));
                i += 2;
            }
            "--enforce-pacing" => {
                match args.get(i + 1).and_then(|v| v.parse::<u64>().ok()) {
                    Some(ms) => {
                        enforce_pacing = Some(ms);
                        i += 2;
                    }
                    None => {
                        enforce_pacing = Some(DEFAULT_PACING_WAIT_MS);
                        i += 1;
                    }
                }
            }
            "--dump" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --dump"))?;
                dump = Some(PathBuf::from(value));
                i += 2;
            }
            "--rewind" => {
                rewind = true;
                i += 1;
            }
            "--timeout-ms" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --timeout-ms"))?;
                timeout_ms = value
                    .parse::<u64>()
                    .map_err(|e| anyhow::anyhow!("Invalid timeout {}: {}", value, e))?;
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    let input = input.ok_or_else(|| {
        print_usage();
        anyhow::anyhow!("Missing required --input")
    })?;

    Ok(PlayerOptions {
        input,
        config,
        enforce_pacing,
        dump,
        rewind,
        timeout_ms,
    })
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  nativecodec --input <file.h264|synthetic:?...> [--config <engine.json>]\n              [--enforce-pacing [ms]] [--dump <frames.yuv>] [--rewind] [--timeout-ms <ms>]\n"
    );
}

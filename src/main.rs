use crate::capture::{SourceSpec, available_sources};
use crate::config::{CaptureMode, StreamConfig, app_name, app_version};
use crate::pipeline::{DetectionCoordinator, FramePreview, WsConnector};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod utils;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn cli() -> Command {
    let app_name = Box::leak(app_name().into_boxed_str());

    Command::new(&*app_name)
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("SOURCE")
                .help("Capture source: test-pattern:<n> or a directory of video frames.")
                .value_parser(value_parser!(SourceSpec)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Capture mode, picks the streamed resolution (webcam/video).")
                .value_parser(value_parser!(CaptureMode)),
        )
        .arg(
            Arg::new("stream-url")
                .short('u')
                .long("stream-url")
                .value_name("URL")
                .env("POTHOLE_STREAM_URL")
                .help("WebSocket endpoint of the detection backend."),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .value_name("MS")
                .help("Milliseconds between captured frames.")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("quality")
                .short('q')
                .long("quality")
                .value_name("1-100")
                .help("JPEG quality of streamed frames.")
                .value_parser(value_parser!(u8).range(1..=100)),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .env("POTHOLE_STREAM_CONFIG")
                .help("JSON configuration file.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("preview-dir")
                .short('o')
                .long("preview-dir")
                .value_name("DIR")
                .help("Write every annotated frame returned by the backend to DIR.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .help("Playback rate of video sources.")
                .default_value("30")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("loop")
                .long("loop")
                .help("Restart video sources when they reach the end.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-sources")
                .short('l')
                .long("list-sources")
                .help("List available capture devices and exit.")
                .action(ArgAction::SetTrue),
        )
}

fn load_config(matches: &ArgMatches) -> Result<StreamConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => StreamConfig::load(path)?,
        None => StreamConfig::default(),
    };

    if let Some(url) = matches.get_one::<String>("stream-url") {
        config.stream_url = url.clone();
    }
    if let Some(mode) = matches.get_one::<CaptureMode>("mode") {
        config.mode = *mode;
    }
    if let Some(interval) = matches.get_one::<u64>("interval-ms") {
        config.tick_interval_ms = *interval;
    }
    if let Some(width) = matches.get_one::<u32>("width") {
        config.width = Some(*width);
    }
    if let Some(height) = matches.get_one::<u32>("height") {
        config.height = Some(*height);
    }
    if let Some(quality) = matches.get_one::<u8>("quality") {
        config.jpeg_quality = *quality;
    }

    config.validate()?;
    Ok(config)
}

fn selected_source(matches: &ArgMatches) -> SourceSpec {
    let fps = matches.get_one::<f64>("fps").copied().unwrap_or(30.0);
    let looping = matches.get_flag("loop");

    match matches.get_one::<SourceSpec>("source") {
        Some(source) => source.clone().with_playback(fps, looping),
        None => available_sources()
            .into_iter()
            .next()
            .map(|info| info.spec)
            .unwrap_or_default(),
    }
}

fn print_sources() {
    for (i, source) in available_sources().iter().enumerate() {
        let marker = if i == 0 { " (default)" } else { "" };
        let busy = if source.in_use { " [in use]" } else { "" };
        println!("{}\t{}{}{}", source.spec, source.label, marker, busy);
    }
}

async fn write_preview(dir: &Path, preview: &FramePreview) -> Result<()> {
    let name = format!(
        "preview-{}.jpg",
        preview.received_at.format("%Y%m%d-%H%M%S%.3f")
    );
    let path = dir.join(name);
    tokio::fs::write(&path, &preview.jpeg)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

async fn run(
    config: StreamConfig,
    source: SourceSpec,
    preview_dir: Option<PathBuf>,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Some(dir) = &preview_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    info!(
        "{} {}: streaming {} to {} (backend host {}, {} mode, {}x{}, every {:?})",
        app_name(),
        app_version(),
        source,
        config.stream_url,
        config.api_base_url,
        config.mode,
        config.resolution().0,
        config.resolution().1,
        config.tick_interval()
    );

    let mut coordinator = DetectionCoordinator::new(config, Arc::new(WsConnector));
    coordinator.start_capture(&source).await?;
    if let Err(e) = coordinator.start_detection().await {
        coordinator.teardown().await;
        return Err(e.into());
    }

    let mut updates = coordinator.subscribe();
    let mut health_tick = tokio::time::interval(HEALTH_LOG_INTERVAL);
    let mut poll = tokio::time::interval(SNAPSHOT_POLL_INTERVAL);
    let mut last_preview: Option<DateTime<Local>> = None;
    let mut last_error: Option<String> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *updates.borrow_and_update();
                if let (Some(count), Some(severity)) = (state.last_count, state.last_severity) {
                    info!(
                        "Potholes: {} (severity {:.2}) | avg severity {:.2} over {} frames | cumulative change {}",
                        count,
                        severity,
                        state.current_average_severity,
                        state.severity_sample_count,
                        state.cumulative_pothole_delta
                    );
                }
            }
            _ = health_tick.tick() => {
                info!("Detection pipeline: {}", coordinator.health().summary());
            }
            _ = poll.tick() => {
                let snapshot = coordinator.snapshot().await;

                if let (Some(dir), Some(preview)) = (&preview_dir, &snapshot.preview)
                    && last_preview != Some(preview.received_at)
                {
                    last_preview = Some(preview.received_at);
                    if let Err(e) = write_preview(dir, preview).await {
                        warn!("{:#}", e);
                    }
                }

                if snapshot.last_error != last_error {
                    if let Some(e) = &snapshot.last_error {
                        warn!("{}", e);
                    }
                    last_error = snapshot.last_error.clone();
                }

                if !snapshot.detection_active {
                    match snapshot.connection {
                        Some(state) => info!("Detection ended: {}", state.description()),
                        None => info!("Detection ended"),
                    }
                    break;
                }
            }
        }
    }

    info!("Final {}", coordinator.health().summary());
    coordinator.teardown().await;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = cli().get_matches();
    if matches.get_flag("list-sources") {
        print_sources();
        return Ok(());
    }

    let config = load_config(&matches)?;
    let source = selected_source(&matches);
    let preview_dir = matches.get_one::<PathBuf>("preview-dir").cloned();

    // gracefully stop the session on SIGINT, SIGTERM, or SIGHUP
    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || on_signal.cancel()).context("Error setting Ctrl-C handler")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let result = runtime.block_on(run(config, source, preview_dir, shutdown));
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

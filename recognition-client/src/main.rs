use anyhow::{Context, Result};
use clap::{value_parser, Arg, Command};
use recognition_client::capture::SyntheticCamera;
use recognition_client::config::{ConfigManager, EnvConfigOverride};
use recognition_client::link::QuicTransport;
use recognition_client::{PipelineController, PipelineNotice};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("recognition-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Streams camera stills to a recognition backend and prints the results")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file, created with defaults if missing")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .value_name("URL")
                .help("Backend url, e.g. quic://127.0.0.1:8443"),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .help("Requested frame rate")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("quality")
                .short('q')
                .long("quality")
                .value_name("QUALITY")
                .help("Encoder quality between 0 and 1")
                .value_parser(value_parser!(f32)),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration-secs")
                .value_name("SECONDS")
                .help("Stop after this many seconds instead of waiting for Ctrl+C")
                .value_parser(value_parser!(u64)),
        )
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => {
            let mut manager = ConfigManager::new(path);
            manager
                .load()
                .await
                .with_context(|| format!("loading {}", path.display()))?;
            manager.into_config()
        }
        None => Default::default(),
    };
    EnvConfigOverride::apply_overrides(&mut config);

    if let Some(url) = matches.get_one::<String>("server") {
        config.server.url = url.clone();
    }
    if let Some(fps) = matches.get_one::<u32>("fps") {
        config.capture.fps = *fps;
    }
    if let Some(quality) = matches.get_one::<f32>("quality") {
        config.capture.quality = *quality;
    }
    config.validate()?;

    // 初始化日志 - RUST_LOG 优先于配置文件
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    info!("🎥 Recognition client starting...");
    info!("  Server: {}", config.server.url);
    info!("  Capture: {}x{} @ {} fps", config.capture.width, config.capture.height, config.capture.fps);

    let camera = Arc::new(SyntheticCamera::with_warmup(config.capture.warmup));
    let transport = Arc::new(QuicTransport::new());
    let mut controller = PipelineController::new(
        camera,
        transport,
        config.controller_options(),
        config.connect_options(),
    );

    controller.acquire_capture().await?;
    controller.connect(&config.server.url).await?;
    controller.start_streaming()?;
    info!("✅ Streaming, press Ctrl+C to stop");

    let deadline = matches
        .get_one::<u64>("duration")
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(*secs));
    let stop_at = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_at);

    let mut stats_poll = tokio::time::interval(config.pipeline.stats_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
                break;
            }
            _ = &mut stop_at => {
                info!("Run time elapsed");
                break;
            }
            _ = stats_poll.tick() => {
                controller.request_stats();
                controller.expire_stale();
            }
            notice = controller.step() => match notice {
                Some(PipelineNotice::ResultPublished(result)) => {
                    let who = result
                        .subject
                        .as_ref()
                        .map(|subject| subject.name.as_str())
                        .unwrap_or("-");
                    info!(
                        "Result frame={:?} recognized={} subject={} confidence={:.2}",
                        result.frame_id,
                        result.recognized,
                        who,
                        result.confidence.unwrap_or_default()
                    );
                }
                Some(PipelineNotice::StatsUpdated(stats)) => {
                    info!(
                        "📊 processed={} ok={} failed={} ratio={:.2} avg={:?}",
                        stats.frames_processed,
                        stats.successes,
                        stats.failures,
                        controller.success_ratio(),
                        stats.average_latency
                    );
                }
                Some(PipelineNotice::StreamingHalted { reason }) => {
                    warn!("Streaming halted: {}", reason);
                    break;
                }
                Some(PipelineNotice::BackendReported(err)) => warn!("{}", err),
                Some(PipelineNotice::CaptureFailed(err)) => warn!("{}", err),
                _ => {}
            },
        }
    }

    controller.stop_streaming();
    controller.disconnect();
    controller.release_capture();

    let counters = controller.governor_counters();
    info!(
        "⏹️ Stopped (ticks fired: {}, skipped: {}, expired: {})",
        counters.fired,
        counters.skipped,
        controller.expired_frames()
    );
    Ok(())
}

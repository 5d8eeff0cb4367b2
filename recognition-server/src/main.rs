use anyhow::Result;
use clap::{value_parser, Arg, Command};
use recognition_server::{RecognitionServer, ServerSettings};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("recognition-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Simulated recognition backend speaking the event protocol over QUIC")
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Listen address")
                .value_parser(value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("max-fps")
                .long("max-fps")
                .value_name("FPS")
                .help("Frame rate ceiling advertised to clients")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("threshold")
                .short('t')
                .long("threshold")
                .value_name("CONFIDENCE")
                .help("Confidence needed to count a frame as recognized")
                .value_parser(value_parser!(f64)),
        )
        .arg(
            Arg::new("latency-ms")
                .long("latency-ms")
                .value_name("MS")
                .help("Upper bound of the simulated processing time")
                .value_parser(value_parser!(u64)),
        )
        .get_matches();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("🚀 Recognition server starting...");

    // 加载配置
    let mut settings = ServerSettings::load();
    if let Some(bind) = matches.get_one::<SocketAddr>("bind") {
        settings.bind = *bind;
    }
    if let Some(max_fps) = matches.get_one::<u32>("max-fps") {
        settings.max_fps = *max_fps;
    }
    if let Some(threshold) = matches.get_one::<f64>("threshold") {
        settings.match_threshold = threshold.clamp(0.0, 1.0);
    }
    if let Some(latency) = matches.get_one::<u64>("latency-ms") {
        settings.max_latency = Duration::from_millis(*latency);
        settings.min_latency = settings.min_latency.min(settings.max_latency);
    }
    info!("✓ Configuration loaded");

    let server = RecognitionServer::bind(settings)?;
    info!("✓ QUIC server listening on {}", server.local_addr()?);
    info!("✅ Recognition server ready!");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("QUIC server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutting down");
            server.close();
        }
    }

    Ok(())
}

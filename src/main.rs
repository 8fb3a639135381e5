use clap::Parser;
use embermq::{Broker, BrokerConfig, Result};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "embermq")]
#[command(about = "An AMQP 0-9-1 message broker written in Rust")]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value = "5672")]
    port: u16,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Maximum channels per connection offered during tuning
    #[arg(long, default_value = "2047")]
    channel_max: u16,

    /// Maximum frame size in bytes offered during tuning
    #[arg(long, default_value = "131072")]
    frame_max: u32,

    /// Heartbeat interval in seconds (0 disables heartbeats)
    #[arg(long, default_value = "60")]
    heartbeat: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(parse_log_level(&args.log_level))
        .init();

    info!("starting embermq broker on {}:{}", args.host, args.port);
    info!("data directory: {}", args.data_dir);
    info!("heartbeat: {}s", args.heartbeat);

    let config = BrokerConfig {
        host: args.host,
        port: args.port,
        data_dir: args.data_dir,
        channel_max: args.channel_max,
        frame_max: args.frame_max,
        heartbeat: args.heartbeat,
    };

    let broker = Broker::new(config)?;
    broker.start().await?;

    signal::ctrl_c().await?;
    info!("received Ctrl+C, shutting down gracefully...");
    broker.stop().await;

    info!("embermq shut down successfully");
    Ok(())
}

fn parse_log_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            warn!("invalid log level '{}', defaulting to 'info'", level);
            tracing::Level::INFO
        }
    }
}

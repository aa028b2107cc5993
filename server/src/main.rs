use clap::Parser;
use log::info;
use server::config::{ServerConfig, PENDING_SWEEP_INTERVAL, ROLE_SELECTION_TIMEOUT};
use server::network::{BoxError, Server};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Seconds a new connection may wait before choosing a role
    #[arg(long, default_value_t = ROLE_SELECTION_TIMEOUT.as_secs())]
    role_timeout_secs: u64,

    /// Seconds between sweeps over connections that never chose a role
    #[arg(long, default_value_t = PENDING_SWEEP_INTERVAL.as_secs())]
    sweep_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        role_timeout: Duration::from_secs(args.role_timeout_secs),
        sweep_interval: Duration::from_secs(args.sweep_interval_secs.max(1)),
    };

    info!("Starting server on {}", config.bind_address());
    let server = Server::new(config).await?;
    server.run().await?;

    Ok(())
}

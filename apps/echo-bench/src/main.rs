use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use echo_bench::cli::{Cli, Command};
use echo_bench::config::ServerConfig;
use echo_bench::rtc::WebRtcEngine;
use echo_bench::server::EchoServer;
use echo_bench::telemetry::logging;
use echo_bench::udp_echo::UdpEcho;
use echo_bench::client;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    match cli.command {
        Some(Command::Ping(args)) => {
            let report = client::run(&args).await?;
            println!("{report}");
            Ok(())
        }
        None => serve(ServerConfig::try_from(&cli.serve)?).await,
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    info!(
        build = env!("ECHO_BENCH_BUILD_ID"),
        backpressure = config.backpressure.enabled,
        threshold = config.backpressure.threshold,
        "starting echo-bench"
    );

    let udp_echo = match config.udp_echo_port {
        Some(port) => {
            let echo = UdpEcho::bind(SocketAddr::new(config.listen.ip(), port))
                .await
                .with_context(|| format!("failed to bind udp echo port {port}"))?;
            Some(tokio::spawn(echo.run()))
        }
        None => None,
    };

    let engine = Arc::new(WebRtcEngine::new(&config.ice));
    let server = EchoServer::start(&config, engine);
    let result = match &config.tls {
        Some(tls) => server.serve_tls(config.listen, tls, shutdown_signal()).await,
        None => {
            let listener = tokio::net::TcpListener::bind(config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            server.serve(listener, shutdown_signal()).await
        }
    };

    if let Some(task) = udp_echo {
        task.abort();
    }
    info!("echo-bench stopped");
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

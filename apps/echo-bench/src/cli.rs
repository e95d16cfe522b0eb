use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::backpressure::DEFAULT_THRESHOLD;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "echo-bench",
    about = "Ping/pong latency benchmark over WebSocket and WebRTC data channels",
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("ECHO_BENCH_BUILD_ID")),
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub serve: ServeArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Measure round-trip time against a running server over WebSocket.
    Ping(PingArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "ECHO_BENCH_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "ECHO_BENCH_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(
        long,
        env = "ECHO_BENCH_LISTEN",
        default_value = "0.0.0.0:8080",
        help = "Address for the HTTP/WebSocket listener"
    )]
    pub listen: SocketAddr,

    #[arg(
        long,
        env = "ECHO_BENCH_BACKPRESSURE",
        help = "Drop pongs while a connection's outbound buffer exceeds the threshold"
    )]
    pub backpressure: bool,

    #[arg(
        long,
        value_name = "BYTES",
        env = "ECHO_BENCH_THRESHOLD",
        default_value_t = DEFAULT_THRESHOLD,
        help = "Backpressure threshold in buffered bytes"
    )]
    pub threshold: usize,

    #[arg(long, value_name = "PATH", env = "ECHO_BENCH_CERT", requires = "key")]
    pub cert: Option<PathBuf>,

    #[arg(long, value_name = "PATH", env = "ECHO_BENCH_KEY", requires = "cert")]
    pub key: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        env = "ECHO_BENCH_STATIC_DIR",
        default_value = "static",
        help = "Directory holding index.html and client.js"
    )]
    pub static_dir: PathBuf,

    #[arg(long, value_name = "MS", env = "ECHO_BENCH_STATS_INTERVAL_MS", default_value_t = 100)]
    pub stats_interval_ms: u64,

    #[arg(
        long,
        value_name = "SECS",
        env = "ECHO_BENCH_SESSION_TTL_SECS",
        default_value_t = 30,
        help = "Lifetime of an unfinished offer session or an unused answered transport"
    )]
    pub session_ttl_secs: u64,

    #[arg(long, value_name = "SECS", env = "ECHO_BENCH_OFFER_TIMEOUT_SECS", default_value_t = 30)]
    pub offer_timeout_secs: u64,

    #[arg(
        long,
        value_name = "BYTES",
        env = "ECHO_BENCH_WS_MAX_MESSAGE",
        default_value_t = crate::ws::DEFAULT_MAX_MESSAGE_SIZE
    )]
    pub ws_max_message: usize,

    #[arg(
        long,
        value_name = "SECS",
        env = "ECHO_BENCH_WS_IDLE_TIMEOUT_SECS",
        default_value_t = 16,
        help = "Close WebSockets silent this long; 0 disables keepalive"
    )]
    pub ws_idle_timeout_secs: u64,

    #[arg(long, env = "ECHO_BENCH_ICE_PORT_START", requires = "ice_port_end")]
    pub ice_port_start: Option<u16>,

    #[arg(long, env = "ECHO_BENCH_ICE_PORT_END", requires = "ice_port_start")]
    pub ice_port_end: Option<u16>,

    #[arg(
        long,
        value_name = "IP",
        env = "ECHO_BENCH_ICE_PUBLIC_IP",
        help = "Public address advertised in host candidates (NAT 1:1)"
    )]
    pub ice_public_ip: Option<String>,

    #[arg(
        long = "stun",
        value_name = "URL",
        env = "ECHO_BENCH_STUN",
        value_delimiter = ',',
        help = "STUN server URL; may be repeated"
    )]
    pub stun: Vec<String>,

    #[arg(
        long,
        value_name = "PORT",
        env = "ECHO_BENCH_UDP_ECHO_PORT",
        help = "Also run a raw UDP echo listener on this port"
    )]
    pub udp_echo_port: Option<u16>,
}

#[derive(Args, Debug, Clone)]
pub struct PingArgs {
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub url: String,

    #[arg(long, short = 'n', default_value_t = 100)]
    pub count: u32,

    #[arg(long, value_name = "MS", default_value_t = 10)]
    pub interval_ms: u64,

    #[arg(long, value_name = "BYTES", default_value_t = 0, help = "Padding added to every ping")]
    pub payload: usize,

    #[arg(
        long,
        value_name = "MS",
        default_value_t = 1000,
        help = "How long to wait for outstanding pongs after the last ping"
    )]
    pub drain_ms: u64,
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backpressure::BackpressurePolicy;
use crate::cli::ServeArgs;
use crate::rtc::IceSettings;
use crate::ws::WsSettings;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ICE port range {start}-{end} is empty")]
    IcePortRange { start: u16, end: u16 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Everything the server needs, fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backpressure: BackpressurePolicy,
    pub tls: Option<TlsConfig>,
    pub static_dir: PathBuf,
    pub stats_interval: Duration,
    pub session_ttl: Duration,
    pub offer_timeout: Duration,
    pub ws: WsSettings,
    pub ice: IceSettings,
    pub udp_echo_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backpressure: BackpressurePolicy::default(),
            tls: None,
            static_dir: PathBuf::from("static"),
            stats_interval: crate::stats::DEFAULT_INTERVAL,
            session_ttl: Duration::from_secs(30),
            offer_timeout: Duration::from_secs(30),
            ws: WsSettings::default(),
            ice: IceSettings::default(),
            udp_echo_port: None,
        }
    }
}

impl TryFrom<&ServeArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: &ServeArgs) -> Result<Self, Self::Error> {
        if args.stats_interval_ms == 0 {
            return Err(ConfigError::Zero("stats interval"));
        }
        if args.session_ttl_secs == 0 {
            return Err(ConfigError::Zero("session ttl"));
        }
        if args.offer_timeout_secs == 0 {
            return Err(ConfigError::Zero("offer timeout"));
        }
        let port_range = match (args.ice_port_start, args.ice_port_end) {
            (Some(start), Some(end)) if start > end => {
                return Err(ConfigError::IcePortRange { start, end });
            }
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };
        let tls = match (&args.cert, &args.key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        };

        Ok(Self {
            listen: args.listen,
            backpressure: BackpressurePolicy {
                enabled: args.backpressure,
                threshold: args.threshold,
            },
            tls,
            static_dir: args.static_dir.clone(),
            stats_interval: Duration::from_millis(args.stats_interval_ms),
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            offer_timeout: Duration::from_secs(args.offer_timeout_secs),
            ws: WsSettings {
                max_message_size: args.ws_max_message,
                idle_timeout: Duration::from_secs(args.ws_idle_timeout_secs),
            },
            ice: IceSettings {
                port_range,
                public_ip: args.ice_public_ip.clone(),
                stun_servers: args.stun.clone(),
            },
            udp_echo_port: args.udp_echo_port,
        })
    }
}

pub mod backpressure;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod echo;
pub mod event_loop;
pub mod metrics;
pub mod mock;
pub mod negotiation;
pub mod registry;
pub mod routes;
pub mod rtc;
pub mod server;
pub mod stats;
pub mod telemetry;
pub mod udp_echo;
pub mod ws;

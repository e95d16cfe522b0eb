use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ServerConfig, TlsConfig};
use crate::echo::EchoHandler;
use crate::event_loop::{EventLoop, EventLoopConfig, LoopHandle};
use crate::negotiation::{NegotiationOrchestrator, PeerEngine};
use crate::routes::{build_router, AppState};
use crate::stats::{LogSink, StatsCollector};

const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// The event loop, stats timer and router for one listener.
pub struct EchoServer {
    router: Router,
    handle: LoopHandle,
    event_loop: JoinHandle<()>,
    stats: JoinHandle<()>,
}

impl EchoServer {
    /// Spawns the event loop and stats collector; must run inside a runtime.
    pub fn start(config: &ServerConfig, engine: Arc<dyn PeerEngine>) -> Self {
        let (handle, event_loop) = EventLoop::spawn(EventLoopConfig {
            echo: EchoHandler::new(config.backpressure),
            session_ttl: config.session_ttl,
            ..EventLoopConfig::default()
        });
        let stats = StatsCollector::new(handle.clone(), config.stats_interval, LogSink).spawn();

        let state = AppState {
            negotiator: NegotiationOrchestrator::new(engine, handle.clone()),
            handle: handle.clone(),
            ws: config.ws,
            static_dir: Arc::new(config.static_dir.clone()),
        };
        let router = build_router(state, config.offer_timeout);
        Self {
            router,
            handle,
            event_loop,
            stats,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(target = "server", addr = %listener.local_addr()?, "listening (http)");
        axum::serve(listener, self.router.clone().into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
            .context("http server failed")?;
        self.stop().await;
        Ok(())
    }

    pub async fn serve_tls<F>(self, addr: SocketAddr, tls: &TlsConfig, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .with_context(|| {
                format!(
                    "failed to load TLS material from {} / {}",
                    tls.cert.display(),
                    tls.key.display()
                )
            })?;
        let server_handle = axum_server::Handle::new();
        let stopper = server_handle.clone();
        tokio::spawn(async move {
            shutdown.await;
            stopper.graceful_shutdown(Some(DRAIN_GRACE));
        });

        info!(target = "server", addr = %addr, "listening (https)");
        axum_server::bind_rustls(addr, rustls)
            .handle(server_handle)
            .serve(self.router.clone().into_make_service())
            .await
            .context("https server failed")?;
        self.stop().await;
        Ok(())
    }

    /// Releases every connection and peer transport, then waits for the
    /// background tasks to finish.
    pub async fn stop(self) {
        self.handle.shutdown();
        if let Err(err) = self.event_loop.await {
            warn!(target = "server", error = %err, "event loop task failed");
        }
        if let Err(err) = self.stats.await {
            warn!(target = "server", error = %err, "stats task failed");
        }
    }
}

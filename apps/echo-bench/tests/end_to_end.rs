use std::net::SocketAddr;
use std::time::Duration;

use echo_bench::backpressure::BackpressurePolicy;
use echo_bench::cli::PingArgs;
use echo_bench::client;
use echo_bench::config::ServerConfig;
use echo_bench::event_loop::LoopHandle;
use echo_bench::mock::MockPeerEngine;
use echo_bench::server::EchoServer;
use echo_bench::ws::WsSettings;
use echo_proto::{PongMessage, SessionDescription};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const STEP: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    handle: LoopHandle,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn start(config: ServerConfig) -> Self {
        let engine = MockPeerEngine::answering(SessionDescription {
            sdp: "v=0\r\nmock-answer".into(),
            kind: "answer".into(),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = EchoServer::start(&config, engine);
        let handle = server.handle();
        let task = tokio::spawn(server.serve(listener, async move {
            let _ = stopped.await;
        }));
        Self {
            addr,
            handle,
            stop: Some(stop),
            task,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn persistent_count(&self) -> usize {
        self.handle.snapshot().await.expect("loop running").persistent_count
    }

    async fn wait_for_persistent(&self, expected: usize) {
        timeout(STEP, async {
            while self.persistent_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection count settles");
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(STEP, self.task)
            .await
            .expect("server stops")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn websocket_ping_gets_pong() {
    let server = Running::start(ServerConfig::default()).await;
    let (mut socket, _) = connect_async(server.ws_url()).await.unwrap();

    socket
        .send(Message::Text(r#"{"type":"ping","ts":1000}"#.into()))
        .await
        .unwrap();
    let reply = timeout(STEP, socket.next())
        .await
        .expect("pong arrives")
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected text pong, got {reply:?}");
    };
    let pong: PongMessage = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(pong.kind, "pong");
    assert_eq!(pong.client_ts, 1000);
    assert!(pong.server_ts >= 1000);

    socket.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn malformed_websocket_frames_are_ignored() {
    let server = Running::start(ServerConfig::default()).await;
    let (mut socket, _) = connect_async(server.ws_url()).await.unwrap();

    for junk in ["not json", r#"{"type":"hello"}"#, r#"{"type":"ping"}"#] {
        socket.send(Message::Text(junk.into())).await.unwrap();
    }
    socket
        .send(Message::Text(r#"{"type":"ping","ts":7,"id":1}"#.into()))
        .await
        .unwrap();

    // The first reply must be the pong for the only valid ping.
    let reply = timeout(STEP, socket.next())
        .await
        .expect("pong arrives")
        .unwrap()
        .unwrap();
    let pong: PongMessage = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(pong.client_ts, 7);
    assert_eq!(pong.echoed["id"], 1);

    socket.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn zero_threshold_backpressure_still_answers_idle_sockets() {
    let config = ServerConfig {
        backpressure: BackpressurePolicy {
            enabled: true,
            threshold: 0,
        },
        ..ServerConfig::default()
    };
    let server = Running::start(config).await;
    let (mut socket, _) = connect_async(server.ws_url()).await.unwrap();
    socket
        .send(Message::Text(r#"{"type":"ping","ts":1}"#.into()))
        .await
        .unwrap();
    let reply = timeout(STEP, socket.next()).await.expect("pong arrives");
    assert!(reply.is_some());
    socket.close(None).await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn silent_websocket_is_closed_and_unregistered() {
    let config = ServerConfig {
        ws: WsSettings {
            idle_timeout: Duration::from_millis(200),
            ..WsSettings::default()
        },
        ..ServerConfig::default()
    };
    let server = Running::start(config).await;
    let (mut socket, _) = connect_async(server.ws_url()).await.unwrap();
    server.wait_for_persistent(1).await;

    // Not polling the socket keeps the client from answering keepalive pings.
    tokio::time::sleep(Duration::from_millis(600)).await;
    server.wait_for_persistent(0).await;

    let closed = timeout(STEP, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Ping(_))) => continue,
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => return false,
            }
        }
    })
    .await
    .expect("server closes the socket");
    assert!(closed);

    server.shutdown().await;
}

#[tokio::test]
async fn offer_endpoint_returns_answer() {
    let server = Running::start(ServerConfig::default()).await;
    let mut stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let body = r#"{"sdp":"v=0\r\n","type":"offer"}"#;
    let request = format!(
        "POST /offer HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    timeout(STEP, stream.read_to_end(&mut raw))
        .await
        .expect("answer arrives")
        .unwrap();
    let response = String::from_utf8(raw).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.to_ascii_lowercase().contains("content-type: application/json"));

    let json_start = response.find("\r\n\r\n").unwrap() + 4;
    let answer: serde_json::Value = serde_json::from_str(&response[json_start..]).unwrap();
    assert_eq!(answer["type"], "answer");
    assert!(answer["sdp"].as_str().unwrap().starts_with("v=0"));

    server.shutdown().await;
}

#[tokio::test]
async fn ping_client_measures_round_trips() {
    let server = Running::start(ServerConfig::default()).await;
    let args = PingArgs {
        url: server.ws_url(),
        count: 20,
        interval_ms: 1,
        payload: 32,
        drain_ms: 2000,
    };
    let report = timeout(Duration::from_secs(10), client::run(&args))
        .await
        .expect("client finishes")
        .unwrap();
    assert_eq!(report.sent, 20);
    assert_eq!(report.received, 20);
    assert_eq!(report.lost(), 0);
    let summary = report.summary().unwrap();
    assert!(summary.min_ms <= summary.median_ms);
    assert!(summary.median_ms <= summary.max_ms);

    server.shutdown().await;
}

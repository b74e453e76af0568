//! Worker against a minimal in-process broker.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use bpow_types::{ServerMessage, WorkHash, WorkItem, WorkNonce, WorkResponse};
use bpow_utils::ShutdownController;
use bpow_work::WorkError;
use bpow_worker::{WorkEngine, WorkerConfig};

/// Always answers with the known nonce for the zero hash at x1.
struct Known;

impl WorkEngine for Known {
    fn name(&self) -> &str {
        "known"
    }

    fn generate(&self, _: &WorkHash, _: u64, _: &AtomicBool) -> Result<WorkNonce, WorkError> {
        Ok(WorkNonce(0x0000_0000_0048_f5b9))
    }
}

async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, Option<String>) {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("worker did not connect")
        .unwrap();
    let seen = Arc::new(Mutex::new(None));
    let header = seen.clone();
    let socket = accept_hdr_async(
        stream,
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            *header.lock().unwrap() = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(response)
        },
    )
    .await
    .unwrap();
    let token = seen.lock().unwrap().clone();
    (socket, token)
}

fn generate(request_id: &str, multiplier: u32) -> Message {
    let message = ServerMessage::WorkGenerate(WorkItem {
        request_id: request_id.into(),
        hash: WorkHash::ZERO,
        difficulty_multiplier: multiplier,
        precache: false,
    });
    Message::Text(message.to_json().unwrap())
}

async fn next_response(socket: &mut WebSocketStream<TcpStream>) -> WorkResponse {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no result from worker")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return WorkResponse::from_json(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn worker_answers_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = WorkerConfig {
        server_url: format!("ws://{}/ws/worker", listener.local_addr().unwrap()),
        token: "secret".into(),
        reconnect_delay_secs: 1,
        max_difficulty: 64,
        ..WorkerConfig::default()
    };
    let shutdown = ShutdownController::new();
    let worker = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            bpow_worker::run_with_engine(&config, Arc::new(Known), &shutdown).await
        })
    };

    let (mut socket, token) = accept(&listener).await;
    assert_eq!(token.as_deref(), Some("secret"));

    // Above the configured maximum, so never answered.
    socket.send(generate("too-hard", 128)).await.unwrap();
    socket.send(generate("r1", 1)).await.unwrap();
    let response = next_response(&mut socket).await;
    assert_eq!(response.request_id, "r1");
    assert_eq!(response.hash, WorkHash::ZERO.to_hex());
    assert_eq!(response.result, "000000000048f5b9");

    drop(socket);
    let (mut socket, _) = accept(&listener).await;
    socket.send(generate("r2", 1)).await.unwrap();
    assert_eq!(next_response(&mut socket).await.request_id, "r2");

    shutdown.shutdown();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_token_is_a_config_error() {
    let shutdown = ShutdownController::new();
    let result = bpow_worker::run(&WorkerConfig::default(), &shutdown).await;
    assert!(matches!(result, Err(bpow_worker::WorkerError::Config(_))));
}

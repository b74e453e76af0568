//! WebSocket connection to the broker.
//!
//! Keeps one connection open, reconnecting after a pause whenever it drops.
//! Incoming `work_generate` requests pass through [`RequestFilter`] into the
//! processor backlog; results from the processor go out as text frames.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use bpow_types::{ServerMessage, WorkItem, WorkResponse};

use crate::config::WorkerConfig;
use crate::processor::WorkProcessor;
use crate::WorkerError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Which work requests this worker is willing to take.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestFilter {
    pub min_difficulty: u32,
    pub max_difficulty: u32,
    pub skip_precache: bool,
}

impl RequestFilter {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            min_difficulty: config.min_difficulty,
            max_difficulty: config.max_difficulty,
            skip_precache: config.skip_precache,
        }
    }

    /// `Err` carries the reason the request is ignored.
    pub fn check(&self, item: &WorkItem) -> Result<(), &'static str> {
        if item.difficulty_multiplier > self.max_difficulty {
            return Err("difficulty above maximum");
        }
        if item.difficulty_multiplier < self.min_difficulty {
            return Err("difficulty below minimum");
        }
        if self.skip_precache && item.precache {
            return Err("precache requests are skipped");
        }
        Ok(())
    }
}

enum SessionEnd {
    Shutdown,
    Dropped,
}

/// Routes broker messages into the processor.
pub struct MessageHandler {
    filter: RequestFilter,
    processor: Arc<WorkProcessor>,
}

pub struct WorkerClient {
    url: String,
    token: HeaderValue,
    reconnect_delay: Duration,
    handler: MessageHandler,
    results: mpsc::Receiver<WorkResponse>,
}

impl WorkerClient {
    /// Fails on an unusable URL or token; connection errors are retried by
    /// [`run`](Self::run).
    pub fn new(
        config: &WorkerConfig,
        processor: Arc<WorkProcessor>,
        results: mpsc::Receiver<WorkResponse>,
    ) -> Result<Self, WorkerError> {
        let token = HeaderValue::from_str(config.token.trim())
            .map_err(|e| WorkerError::Config(format!("invalid token: {e}")))?;
        let client = Self {
            url: config.server_url.clone(),
            token,
            reconnect_delay: config.reconnect_delay(),
            handler: MessageHandler::new(RequestFilter::from_config(config), processor),
            results,
        };
        client.request()?;
        Ok(client)
    }

    fn request(&self) -> Result<Request<()>, WorkerError> {
        let mut request = self.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.token.clone());
        Ok(request)
    }

    /// Stay connected until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let url = self.url.clone();
        loop {
            let connected = match self.request() {
                Ok(request) => connect_async(request).await.map_err(WorkerError::from),
                Err(e) => Err(e),
            };
            match connected {
                Ok((socket, _)) => {
                    info!(%url, "connected to broker");
                    if let SessionEnd::Shutdown = self.session(socket, &mut shutdown).await {
                        info!("worker client stopped");
                        return;
                    }
                    warn!(%url, "connection lost");
                }
                Err(e) => warn!(%url, error = %e, "connect failed"),
            }

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    async fn session(
        &mut self,
        socket: Socket,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let handler = &self.handler;
        let results = &mut self.results;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => handler.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "read failed");
                        return SessionEnd::Dropped;
                    }
                },
                Some(response) = results.recv() => {
                    let text = match serde_json::to_string(&response) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "could not encode result");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(error = %e, "write failed");
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }
}

impl MessageHandler {
    pub fn new(filter: RequestFilter, processor: Arc<WorkProcessor>) -> Self {
        Self { filter, processor }
    }

    /// Route one frame from the broker.
    pub fn handle_text(&self, text: &str) {
        let message = match ServerMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "ignoring unrecognised message");
                return;
            }
        };
        match message {
            ServerMessage::WorkGenerate(item) => {
                if let Err(reason) = self.filter.check(&item) {
                    debug!(
                        hash = %item.hash,
                        multiplier = item.difficulty_multiplier,
                        reason,
                        "ignoring work request"
                    );
                    return;
                }
                info!(
                    hash = %item.hash,
                    multiplier = item.difficulty_multiplier,
                    "received work request"
                );
                self.processor.submit(item);
            }
            ServerMessage::WorkCancel { hash } => self.processor.cancel(&hash),
            ServerMessage::BlockAwarded(notice) => info!(
                hash = %notice.hash,
                percent_of_pool = notice.percent_of_pool,
                estimated_award = notice.estimated_award,
                "block awarded"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpow_types::WorkHash;

    fn item(multiplier: u32, precache: bool) -> WorkItem {
        WorkItem {
            request_id: "r".into(),
            hash: WorkHash::ZERO,
            difficulty_multiplier: multiplier,
            precache,
        }
    }

    #[test]
    fn filter_enforces_difficulty_range() {
        let filter = RequestFilter {
            min_difficulty: 2,
            max_difficulty: 64,
            skip_precache: false,
        };
        assert!(filter.check(&item(1, false)).is_err());
        assert!(filter.check(&item(2, false)).is_ok());
        assert!(filter.check(&item(64, true)).is_ok());
        assert!(filter.check(&item(65, false)).is_err());
    }

    #[test]
    fn filter_can_skip_precache() {
        let filter = RequestFilter {
            min_difficulty: 1,
            max_difficulty: 128,
            skip_precache: true,
        };
        assert!(filter.check(&item(1, true)).is_err());
        assert!(filter.check(&item(1, false)).is_ok());
    }
}

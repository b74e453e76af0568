//! Per-socket reader and writer tasks.
//!
//! The writer drains the connection's outbound queue and keeps the peer alive
//! with pings. The reader forwards text frames to the hub, enforces the size
//! limit and read deadline, and unregisters the connection when it exits.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::buckets::ConnectionHandle;
use crate::config::BrokerConfig;
use crate::hub::HubHandle;
use crate::tracing_spans::connection_span;

/// Timing and size limits for one worker connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub outbound_queue_size: usize,
}

impl From<&BrokerConfig> for ConnectionSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            ping_period: config.ping_period(),
            max_message_size: config.max_message_size,
            outbound_queue_size: config.outbound_queue_size.max(1),
        }
    }
}

/// Newlines become spaces and surrounding whitespace is trimmed.
pub fn normalize_payload(text: &str) -> String {
    text.replace('\n', " ").trim().to_string()
}

/// Register `socket` with the hub and pump it until either side closes.
pub async fn serve_connection(
    mut socket: WebSocket,
    id: u64,
    addr: String,
    identity: String,
    hub: HubHandle,
    settings: ConnectionSettings,
) {
    let span = connection_span(id, &addr, &identity);
    async move {
        let (tx, rx) = mpsc::channel(settings.outbound_queue_size);
        match hub
            .register(ConnectionHandle::new(id, addr.clone(), identity.clone(), tx))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("address already connected, closing");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            Err(_) => {
                warn!("hub stopped, refusing connection");
                return;
            }
        }

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_loop(sink, rx, settings).in_current_span());
        read_loop(stream, id, &addr, &identity, &hub, settings).await;

        let _ = hub.unregister(id).await;
        // The writer ends once the hub drops our sender.
        if let Err(e) = writer.await {
            warn!(error = %e, "writer task failed");
        }
        info!("worker disconnected");
    }
    .instrument(span)
    .await
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    id: u64,
    addr: &str,
    identity: &str,
    hub: &HubHandle,
    settings: ConnectionSettings,
) {
    loop {
        let frame = match timeout(settings.pong_wait, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read error");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                debug!("read deadline expired");
                return;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => return,
            // Pings and pongs only refresh the deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if text.len() > settings.max_message_size {
            warn!(size = text.len(), "message too large, closing");
            return;
        }

        if hub
            .inbound(id, addr, identity, normalize_payload(&text))
            .await
            .is_err()
        {
            return;
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
    settings: ConnectionSettings,
) {
    let mut ping = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
                    return;
                };
                match timeout(settings.write_wait, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!("write failed");
                        return;
                    }
                }
            }
            _ = ping.tick() => {
                match timeout(settings.write_wait, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!("ping failed");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_normalized() {
        assert_eq!(
            normalize_payload("  {\"a\":\n1}\n"),
            "{\"a\": 1}"
        );
    }

    #[test]
    fn settings_follow_config() {
        let settings = ConnectionSettings::from(&BrokerConfig::default());
        assert_eq!(settings.pong_wait, Duration::from_secs(60));
        assert_eq!(settings.ping_period, Duration::from_secs(54));
        assert_eq!(settings.write_wait, Duration::from_secs(10));
        assert_eq!(settings.max_message_size, 512);
        assert_eq!(settings.outbound_queue_size, 256);
    }
}

//! The persistent relay connection.
//!
//! One WebSocket carries everything: inbound messages, cancels, and transfer
//! signals come down it; chunks, terminal frames, and outbound signals go back
//! up. The client reconnects forever with bounded exponential backoff and
//! jitter; frames produced while disconnected wait in the outbound channel and
//! drain after the next connect.

use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::{
    events::{ConnectionStatus, EventEmitter, LifecycleEvent},
    orchestrator::OrchestratorEvent,
    protocol::{RelayOutbound, PROTOCOL_VERSION},
    wire,
};

#[derive(Debug, Clone)]
pub enum WsControl {
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct BridgeWsClient {
    base_url: String,
    token: String,
    agent_id: String,
}

impl BridgeWsClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            agent_id: agent_id.into(),
        }
    }

    pub async fn run(
        &self,
        emitter: EventEmitter,
        events_tx: mpsc::Sender<OrchestratorEvent>,
        mut outbound_rx: mpsc::Receiver<RelayOutbound>,
        mut control_rx: mpsc::Receiver<WsControl>,
    ) {
        let mut attempt = 0u32;
        let mut has_connected = false;

        loop {
            let ws_url = match build_ws_url(&self.base_url, &self.token) {
                Ok(url) => url,
                Err(error) => {
                    tracing::warn!(
                        target = "agent_bridge::ws",
                        base_url = %self.base_url,
                        error = %error,
                        "invalid websocket base url"
                    );
                    attempt += 1;
                    tokio::time::sleep(reconnect_delay(attempt)).await;
                    continue;
                }
            };
            let ws_endpoint = ws_url
                .split_once('?')
                .map(|(prefix, _)| prefix)
                .unwrap_or(&ws_url);

            match tokio_tungstenite::connect_async(&ws_url).await {
                Ok((ws, _)) => {
                    let status = if has_connected {
                        ConnectionStatus::Reconnected
                    } else {
                        ConnectionStatus::Connected
                    };
                    tracing::info!(
                        target = "agent_bridge::ws",
                        endpoint = %ws_endpoint,
                        status = ?status,
                        "relay connection up"
                    );
                    emitter.emit(&LifecycleEvent::Connection { status });
                    has_connected = true;
                    attempt = 0;
                    let (mut write, mut read) = ws.split();

                    let hello = json!({
                        "type": "hello",
                        "payload": {
                            "agent_id": self.agent_id,
                            "protocol_version": PROTOCOL_VERSION,
                        }
                    });
                    if let Err(error) = write.send(Message::Text(hello.to_string())).await {
                        tracing::warn!(
                            target = "agent_bridge::ws",
                            error = %error,
                            "hello frame failed; reconnecting"
                        );
                    } else {
                        let mut shutdown = false;
                        while !shutdown {
                            tokio::select! {
                                ctrl = control_rx.recv() => {
                                    match ctrl {
                                        Some(WsControl::Shutdown) | None => {
                                            let _ = write.close().await;
                                            shutdown = true;
                                        }
                                    }
                                }
                                frame = outbound_rx.recv() => {
                                    let Some(frame) = frame else {
                                        let _ = write.close().await;
                                        shutdown = true;
                                        continue;
                                    };
                                    match serde_json::to_string(&frame) {
                                        Ok(text) => {
                                            if let Err(error) = write.send(Message::Text(text)).await {
                                                tracing::warn!(
                                                    target = "agent_bridge::ws",
                                                    error = %error,
                                                    "ws write error"
                                                );
                                                break;
                                            }
                                        }
                                        Err(error) => {
                                            tracing::warn!(
                                                target = "agent_bridge::ws",
                                                error = %error,
                                                "unserializable outbound frame dropped"
                                            );
                                        }
                                    }
                                }
                                frame = read.next() => {
                                    match frame {
                                        Some(Ok(Message::Text(text))) => {
                                            self.forward_text(&text, &events_tx).await;
                                        }
                                        Some(Ok(Message::Binary(_))) => {}
                                        Some(Ok(Message::Close(_))) | None => break,
                                        Some(Err(error)) => {
                                            tracing::warn!(
                                                target = "agent_bridge::ws",
                                                error = %error,
                                                "ws read error"
                                            );
                                            break;
                                        }
                                        _ => {}
                                    }
                                }
                            }
                        }

                        if shutdown {
                            break;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "agent_bridge::ws",
                        endpoint = %ws_endpoint,
                        error = %error,
                        "ws connect failed"
                    );
                }
            }

            tracing::info!(target = "agent_bridge::ws", "relay connection down");
            if has_connected {
                emitter.emit(&LifecycleEvent::Connection {
                    status: ConnectionStatus::Disconnected,
                });
            }
            attempt += 1;
            tokio::time::sleep(reconnect_delay(attempt)).await;
        }
    }

    async fn forward_text(&self, text: &str, events_tx: &mpsc::Sender<OrchestratorEvent>) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            tracing::debug!(
                target = "agent_bridge::ws",
                raw = %text,
                "ignoring non-json text frame"
            );
            return;
        };
        let Some(frame) = wire::map_ws_frame(&value) else {
            tracing::debug!(
                target = "agent_bridge::ws",
                frame_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("missing"),
                "ignoring unroutable frame"
            );
            return;
        };
        if events_tx.send(OrchestratorEvent::Relay(frame)).await.is_err() {
            tracing::debug!(
                target = "agent_bridge::ws",
                "orchestrator gone; dropping inbound frame"
            );
        }
    }
}

pub fn build_ws_url(base_url: &str, token: &str) -> Result<String> {
    let raw = base_url.trim();
    let normalized = if raw.starts_with("wss://") || raw.starts_with("ws://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{raw}")
    };

    let mut url = Url::parse(&normalized)?;
    let path = url.path().trim_end_matches('/').to_string();

    let final_path = if path.is_empty() {
        "/v1/bridge".to_string()
    } else if path.ends_with("/v1/bridge") || path.ends_with("/bridge") {
        path
    } else if path.ends_with("/v1") {
        format!("{path}/bridge")
    } else {
        format!("{path}/v1/bridge")
    };
    url.set_path(&final_path);

    let mut preserved: Vec<(String, String)> = Vec::new();
    for (k, v) in url.query_pairs() {
        if k != "token" {
            preserved.push((k.into_owned(), v.into_owned()));
        }
    }
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in preserved {
            pairs.append_pair(&k, &v);
        }
        pairs.append_pair("token", token);
    }

    Ok(url.to_string())
}

pub fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = (1_000u64).saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let bounded = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(bounded + jitter)
}

#[cfg(test)]
mod tests {
    use crate::{orchestrator::OrchestratorEvent, protocol::RelayInbound};

    use super::{build_ws_url, reconnect_delay, BridgeWsClient};

    #[tokio::test]
    async fn forwards_routable_text_and_drops_the_rest() {
        let client = BridgeWsClient::new("wss://relay.example.dev", "tok", "agent");
        let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(4);

        client.forward_text("not json", &events_tx).await;
        client.forward_text(r#"{"type":"mystery"}"#, &events_tx).await;
        client
            .forward_text(
                r#"{"type":"cancel","payload":{"session_id":"s1","request_id":"r1"}}"#,
                &events_tx,
            )
            .await;

        match events_rx.try_recv() {
            Ok(OrchestratorEvent::Relay(RelayInbound::Cancel { session_id, .. })) => {
                assert_eq!(session_id, "s1");
            }
            other => panic!("expected cancel, got {other:?}"),
        }
        assert!(events_rx.try_recv().is_err());
    }

    #[test]
    fn backoff_with_jitter_stays_bounded() {
        let d1 = reconnect_delay(1);
        let d10 = reconnect_delay(10);
        assert!(d1.as_millis() >= 1000);
        assert!(d1.as_millis() <= 1250);
        assert!(d10.as_millis() >= 30_000);
        assert!(d10.as_millis() <= 30_250);
    }

    #[test]
    fn builds_bridge_url_from_host_base() {
        let url = build_ws_url("https://relay.example.dev", "tok_1").unwrap();
        assert_eq!(url, "wss://relay.example.dev/v1/bridge?token=tok_1");
    }

    #[test]
    fn avoids_duplicate_v1_when_base_already_has_v1() {
        let url = build_ws_url("https://relay.example.dev/v1", "tok_2").unwrap();
        assert_eq!(url, "wss://relay.example.dev/v1/bridge?token=tok_2");
    }

    #[test]
    fn preserves_custom_bridge_path_and_query() {
        let url = build_ws_url("wss://rt.example.dev/bridge?client=bridge", "tok_3").unwrap();
        assert_eq!(url, "wss://rt.example.dev/bridge?client=bridge&token=tok_3");
    }

    #[test]
    fn keeps_existing_endpoint_and_replaces_token() {
        let url = build_ws_url(
            "wss://relay.example.dev/v1/bridge?token=old&mode=fast",
            "new_tok",
        )
        .unwrap();
        assert_eq!(
            url,
            "wss://relay.example.dev/v1/bridge?mode=fast&token=new_tok"
        );
    }
}

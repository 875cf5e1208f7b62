//! WebSocket subscription channel
//!
//! ## Protocol
//!
//! Connect: `ws://host/ws`
//!
//! Server -> client:
//! - `{"type":"connected"}` on connect
//! - `{"type":"subscribed","request_id":N}` acknowledging a subscription
//! - `{"type":"pipeline_event",...}` pipeline progress
//!
//! Client -> server:
//! - `{"type":"subscribe","request_id":N}` - narrow the feed to one request
//!
//! Unsubscribed clients receive all events. Malformed client messages are
//! silently ignored.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::bus::PipelineEvent;
use crate::server::http::AppState;

/// WebSocket type after upgrade
type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { request_id: u64 },
}

/// Handle WebSocket upgrade for the subscription channel
pub async fn handle_ws_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(pair) => pair,
        Err(e) => {
            error!("WebSocket upgrade failed: {:?}", e);
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from("WebSocket upgrade failed")))
                .unwrap();
        }
    };

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => {
                if let Err(e) = handle_connection(state, ws).await {
                    warn!("WebSocket connection error: {}", e);
                }
            }
            Err(e) => {
                error!("WebSocket handshake failed: {:?}", e);
            }
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

/// What ended one subscription round
enum RoundOutcome {
    /// Client asked to narrow the feed to one request
    Resubscribe(u64),
    /// Connection is done
    Closed,
}

/// Serve one subscriber connection
async fn handle_connection(
    state: Arc<AppState>,
    ws: HyperWebSocket,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut sender, mut receiver) = ws.split();

    info!("Subscription client connected");
    sender
        .send(WsMessage::Text(r#"{"type":"connected"}"#.to_string()))
        .await?;

    // Start on the firehose; a subscribe message narrows the filter. Each
    // round holds one bus subscription; a resubscribe tears it down and
    // opens the next.
    let mut filter: Option<u64> = None;
    loop {
        let (sub_id, mut rx) = state.bus.subscribe(filter).await;
        let outcome = subscription_round(&mut sender, &mut receiver, &mut rx).await;
        state.bus.unsubscribe(sub_id).await;

        match outcome {
            RoundOutcome::Resubscribe(request_id) => {
                filter = Some(request_id);
                debug!(request_id, "Client subscribed");
                let ack = format!(r#"{{"type":"subscribed","request_id":{}}}"#, request_id);
                if sender.send(WsMessage::Text(ack)).await.is_err() {
                    break;
                }
            }
            RoundOutcome::Closed => break,
        }
    }

    info!("Subscription connection closed");
    Ok(())
}

/// Pump one subscription until the client resubscribes or disconnects
async fn subscription_round(
    sender: &mut (impl Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    receiver: &mut (impl Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    rx: &mut tokio::sync::mpsc::Receiver<PipelineEvent>,
) -> RoundOutcome {
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let json = event_message(&event);
                        if sender.send(WsMessage::Text(json)).await.is_err() {
                            return RoundOutcome::Closed;
                        }
                    }
                    // Dropped by the bus (queue overflow): close out.
                    None => return RoundOutcome::Closed,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Subscribe { request_id }) => {
                                return RoundOutcome::Resubscribe(request_id);
                            }
                            // Malformed client messages are silently ignored
                            Err(_) => {}
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("Subscription client disconnected");
                        return RoundOutcome::Closed;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        return RoundOutcome::Closed;
                    }
                    None => return RoundOutcome::Closed,
                    _ => {}
                }
            }
        }
    }
}

/// Serialise a bus event into the wire message
fn event_message(event: &PipelineEvent) -> String {
    let mut body = serde_json::json!({
        "type": "pipeline_event",
        "request_id": event.request_id,
        "stage": event.stage,
        "status": event.status,
        "timestamp": event.timestamp,
        "message": event.message,
    });
    if let Some(data) = &event.data {
        body["data"] = data.clone();
    }
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventStatus;
    use crate::pipeline::Stage;

    #[test]
    fn test_event_message_shape() {
        let event = PipelineEvent::new(7, Stage::Consensus, EventStatus::Completed, "approved");
        let json = event_message(&event);
        assert!(json.contains("\"type\":\"pipeline_event\""));
        assert!(json.contains("\"request_id\":7"));
        assert!(json.contains("\"stage\":\"consensus\""));
        assert!(json.contains("\"status\":\"completed\""));
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_event_message_with_data() {
        let event = PipelineEvent::new(7, Stage::Settlement, EventStatus::Completed, "paid")
            .with_data(serde_json::json!({"tx_hash": "0xff"}));
        assert!(event_message(&event).contains("0xff"));
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","request_id":12}"#).unwrap();
        let ClientMessage::Subscribe { request_id } = msg;
        assert_eq!(request_id, 12);
        assert!(serde_json::from_str::<ClientMessage>("{\"type\":\"bogus\"}").is_err());
    }
}

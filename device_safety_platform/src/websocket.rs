//! WebSocket delivery of a run's event stream.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::EventStream;

/// Normal closure
const CLOSE_NORMAL: u16 = 1000;
/// Internal error closure
const CLOSE_INTERNAL: u16 = 1011;

fn event_frame<T: Serialize>(event: &T) -> Result<Message, serde_json::Error> {
    serde_json::to_string(event).map(Message::Text)
}

/// Forward every event as a JSON text frame and close after the terminal
/// event. A client close or a send failure drops the stream, which cancels
/// the run.
pub async fn forward_events(socket: WebSocket, run_id: Uuid, mut events: EventStream) {
    let (mut sender, mut receiver) = socket.split();
    info!(%run_id, "Event subscriber connected");

    let finished = loop {
        tokio::select! {
            event = events.next_event() => {
                let Some(event) = event else {
                    break true;
                };
                let terminal = event.is_terminal();
                let frame = match event_frame(&event) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Skipping the event would leave a sequence gap
                        error!(%run_id, sequence = event.sequence, error = %e, "Failed to serialize event");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_INTERNAL,
                                reason: "event serialization failed".into(),
                            })))
                            .await;
                        break false;
                    }
                };
                if let Err(e) = sender.send(frame).await {
                    warn!(%run_id, error = %e, "Failed to send event");
                    break false;
                }
                if terminal {
                    break true;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%run_id, "Subscriber closed the connection");
                        break false;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {
                        // Uni-directional stream; client frames are ignored
                    }
                    Some(Err(e)) => {
                        warn!(%run_id, error = %e, "WebSocket error");
                        break false;
                    }
                }
            }
        }
    };

    if finished {
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: "run finished".into(),
            })))
            .await;
        debug!(%run_id, "Event stream complete");
    }
    // Dropping `events` here cancels the run unless it already finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, OutboundEvent};
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn test_event_becomes_text_frame() {
        let event = OutboundEvent {
            sequence: 7,
            timestamp: Utc::now(),
            kind: EventKind::Progress {
                percentage: 40,
                message: "2 of 5 agents finished".to_string(),
            },
        };
        let Ok(Message::Text(text)) = event_frame(&event) else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["type"], "progress");
    }

    #[test]
    fn test_unserializable_event_is_an_error() {
        // JSON object keys must be strings
        let bad: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);
        assert!(event_frame(&bad).is_err());
    }
}

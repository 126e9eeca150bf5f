use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::messages::{ClientMessage, ServerMessage};
use crate::db::models::ClientSession;
use crate::scanner::{ScannerController, ScannerEvent, CLIENT_BUFFER};
use crate::AppState;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Application close code sent when the path carries a malformed user id.
pub const INVALID_USER_CLOSE_CODE: u16 = 4000;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws/{user_id}", get(websocket_handler))
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let scanner = match state.scanners.get_or_create(&user_id).await {
        Ok(scanner) => scanner,
        Err(err) => {
            log_warn!("Refusing websocket: {err}");
            let frame = CloseFrame {
                code: INVALID_USER_CLOSE_CODE,
                reason: "Invalid user_id format".into(),
            };
            let _ = ws_sender.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let session_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let session = ClientSession {
        id: session_id.clone(),
        user_id: user_id.clone(),
        created_at: now,
        last_activity: now,
        is_active: true,
    };
    if let Err(err) = state.db.open_client_session(&session).await {
        log_warn!("Failed to record session {session_id}: {err:#}");
    }

    let (event_tx, mut event_rx) = mpsc::channel::<ScannerEvent>(CLIENT_BUFFER);
    let (reply_tx, mut reply_rx) = mpsc::channel::<ServerMessage>(CLIENT_BUFFER);

    // Broadcasts and direct replies share one writer so frames never interleave.
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(event) = event_rx.recv() => ServerMessage::from(event),
                Some(reply) = reply_rx.recv() => reply,
                else => break,
            };
            let frame = match message.to_ws_message() {
                Ok(frame) => frame,
                Err(err) => {
                    log_error!("Failed to encode websocket message: {err}");
                    continue;
                }
            };
            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    scanner.connect_client(&session_id, event_tx).await;

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(err) = state.db.touch_client_session(&session_id, Utc::now()).await {
                    log_debug!("Failed to touch session {session_id}: {err:#}");
                }
                if let Some(reply) = handle_text(&scanner, &session_id, text.as_str()).await {
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Err(err) => {
                log_warn!("Websocket error on session {session_id}: {err}");
                break;
            }
            _ => {}
        }
    }

    scanner.disconnect_client(&session_id).await;
    drop(reply_tx);
    writer.abort();

    if let Err(err) = state.db.close_client_session(&session_id, Utc::now()).await {
        log_warn!("Failed to close session {session_id}: {err:#}");
    }
    log_info!("Websocket session {session_id} for {user_id} ended");
}

/// Dispatches one inbound frame. Returns the reply meant only for this client;
/// movement results reach every client through the scanner's broadcasts.
async fn handle_text(
    scanner: &ScannerController,
    session_id: &str,
    text: &str,
) -> Option<ServerMessage> {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Move(direction)) => {
            match scanner.queue_movement(direction, Some(session_id)).await {
                Ok(_) => None,
                Err(err) => {
                    log_error!("Move {direction} on session {session_id} failed: {err:#}");
                    Some(ServerMessage::error(err.to_string()))
                }
            }
        }
        Ok(ClientMessage::GetState) => Some(ServerMessage::StateUpdate(
            scanner.get_state_snapshot().await,
        )),
        Ok(ClientMessage::Ping) => Some(ServerMessage::pong()),
        Err(err) => {
            log_debug!("Bad frame on session {session_id}: {err}");
            Some(ServerMessage::error(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::scanner::PersistenceGuard;
    use crate::settings::ScannerSettings;
    use std::{sync::Arc, time::Duration};

    async fn scanner(dir: &tempfile::TempDir) -> ScannerController {
        let db = Database::new(dir.path().join("ws.sqlite3"), Duration::from_secs(1)).unwrap();
        let guard = Arc::new(PersistenceGuard::new(
            4,
            Duration::from_secs(1),
            2,
            Duration::from_millis(1),
        ));
        let settings = ScannerSettings {
            movement_speed_multiplier: 5.0,
            ..ScannerSettings::default()
        };
        let scanner = ScannerController::new("abcd", settings, Arc::new(db), guard);
        scanner.initialize().await;
        scanner
    }

    #[tokio::test]
    async fn ping_and_state_requests_get_direct_replies() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner(&dir).await;

        let pong = handle_text(&scanner, "s1", r#"{"type":"ping"}"#).await;
        assert!(matches!(pong, Some(ServerMessage::Pong { .. })));

        match handle_text(&scanner, "s1", r#"{"type":"GET_STATE"}"#).await {
            Some(ServerMessage::StateUpdate(snapshot)) => {
                assert_eq!(snapshot.user_id, "abcd");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_frames_are_answered_with_errors() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner(&dir).await;

        for (frame, expected) in [
            ("nope", "Invalid JSON format"),
            (r#"{"type":"jump"}"#, "Unknown message type: jump"),
            (r#"{"type":"move","direction":"north"}"#, "Invalid direction"),
        ] {
            match handle_text(&scanner, "s1", frame).await {
                Some(ServerMessage::Error { message }) => assert_eq!(message, expected),
                other => panic!("unexpected reply {other:?}"),
            }
        }
        assert!(!scanner.get_state_snapshot().await.is_processing);
    }

    #[tokio::test]
    async fn moves_are_queued_without_a_direct_reply() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = scanner(&dir).await;

        let reply = handle_text(&scanner, "s1", r#"{"type":"move","direction":"right"}"#).await;
        assert!(reply.is_none());

        let snapshot = scanner.get_state_snapshot().await;
        assert!(snapshot.is_processing);
        assert_eq!(
            snapshot.horizontal_movement_pending + snapshot.movement_in_flight.horizontal,
            1
        );
    }
}

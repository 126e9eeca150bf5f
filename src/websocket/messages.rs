//! Wire format for the scanner websocket.
//!
//! Clients send `{"type": "move", "direction": "up"}`, `{"type": "get_state"}`
//! or `{"type": "ping"}`. Every server frame is `{"type": ..., "data": ...}`.

use std::sync::Arc;

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::scanner::{Direction, LogNotice, ScannerEvent, ScannerSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMessage {
    Move(Direction),
    GetState,
    Ping,
}

/// Problems with an inbound frame. Reported back to the client; the
/// connection stays open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid direction")]
    InvalidDirection,
}

impl ClientMessage {
    /// Message types and directions are matched case-insensitively.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();

        match kind.as_str() {
            "move" => value
                .get("direction")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .parse::<Direction>()
                .map(ClientMessage::Move)
                .map_err(|_| ProtocolError::InvalidDirection),
            "get_state" => Ok(ClientMessage::GetState),
            "ping" => Ok(ClientMessage::Ping),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    StateUpdate(Arc<ScannerSnapshot>),
    Log(LogNotice),
    Error { message: String },
    Pong { timestamp: f64 },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Pong carrying the server's wall clock in fractional Unix seconds.
    pub fn pong() -> Self {
        let now = chrono::Utc::now();
        ServerMessage::Pong {
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_ws_message(&self) -> serde_json::Result<Message> {
        Ok(Message::Text(self.to_text()?.into()))
    }
}

impl From<ScannerEvent> for ServerMessage {
    fn from(event: ScannerEvent) -> Self {
        match event {
            ScannerEvent::State(snapshot) => ServerMessage::StateUpdate(snapshot),
            ScannerEvent::Log(notice) => ServerMessage::Log(notice),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{Position, ScannerState};

    #[test]
    fn parses_client_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"move","direction":"up"}"#),
            Ok(ClientMessage::Move(Direction::Up))
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"MOVE","direction":"Left"}"#),
            Ok(ClientMessage::Move(Direction::Left))
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"get_state"}"#),
            Ok(ClientMessage::GetState)
        );
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#), Ok(ClientMessage::Ping));
    }

    #[test]
    fn malformed_frames_name_the_problem() {
        assert_eq!(ClientMessage::parse("{not json"), Err(ProtocolError::InvalidJson));
        assert_eq!(
            ClientMessage::parse(r#"{"type":"move","direction":"sideways"}"#),
            Err(ProtocolError::InvalidDirection)
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"move"}"#),
            Err(ProtocolError::InvalidDirection)
        );

        let err = ClientMessage::parse(r#"{"type":"Teleport"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type: teleport");
        assert_eq!(
            ClientMessage::parse("[1, 2]"),
            Err(ProtocolError::UnknownType(String::new()))
        );
    }

    #[test]
    fn server_messages_are_type_and_data() {
        let error: Value = serde_json::from_str(&ServerMessage::error("Invalid direction").to_text().unwrap())
            .unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["data"]["message"], "Invalid direction");

        let log: Value = serde_json::from_str(
            &ServerMessage::from(ScannerEvent::Log(LogNotice {
                timestamp: "12:00:00.000".into(),
                message: "Focusing at (5, 5)".into(),
            }))
            .to_text()
            .unwrap(),
        )
        .unwrap();
        assert_eq!(log["type"], "log");
        assert_eq!(log["data"]["timestamp"], "12:00:00.000");

        let pong: Value = serde_json::from_str(&ServerMessage::pong().to_text().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");
        assert!(pong["data"]["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn state_updates_carry_the_snapshot() {
        let mut state = ScannerState::new("abcd", Position::new(5, 5));
        let message = ServerMessage::from(ScannerEvent::State(state.snapshot()));
        let value: Value = serde_json::from_str(&message.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "state_update");
        assert_eq!(value["data"]["user_id"], "abcd");
        assert_eq!(value["data"]["current_position"]["x"], 5);
        assert_eq!(value["data"]["operation_status"], "ready");
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{Message, ReadReceipt};
use crate::presence::UserPresenceView;
use crate::registry::Frame;

/// Client envelope: `{type, chatId, payload}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub chat_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Echoed back on the ACK or ERROR for this frame
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessagePayload {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadPayload {
    message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    SendMessage { content: String },
    MarkRead { message_ids: Vec<Uuid> },
    Typing,
    CallStart,
    CallEnd,
    Ping,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, AppError> {
        serde_json::from_str(text).map_err(|e| AppError::InvalidFrame(format!("malformed frame: {e}")))
    }

    /// Validate against the connection's chat and decode the payload. An
    /// absent `chatId` means the connection's chat.
    pub fn command(&self, connection_chat: Uuid) -> Result<ClientCommand, AppError> {
        if let Some(chat_id) = self.chat_id {
            if chat_id != connection_chat {
                return Err(AppError::InvalidFrame(format!(
                    "chatId {chat_id} does not match this connection"
                )));
            }
        }

        let command = match self.kind.as_str() {
            "SEND_MESSAGE" => {
                let p: SendMessagePayload = decode_payload(&self.payload)?;
                ClientCommand::SendMessage { content: p.content }
            }
            "MARK_READ" => {
                let p: MarkReadPayload = decode_payload(&self.payload)?;
                ClientCommand::MarkRead {
                    message_ids: p.message_ids,
                }
            }
            "TYPING" => ClientCommand::Typing,
            "CALL_START" => ClientCommand::CallStart,
            "CALL_END" => ClientCommand::CallEnd,
            "PING" => ClientCommand::Ping,
            other => {
                return Err(AppError::InvalidFrame(format!("unknown frame type: {other}")));
            }
        };
        Ok(command)
    }
}

impl ClientCommand {
    /// Frames a person produces. `PING` is keep-alive only.
    pub fn is_user_activity(&self) -> bool {
        !matches!(self, ClientCommand::Ping)
    }
}

/// Whether raw socket text is user activity. Malformed frames are not.
pub fn is_user_activity(text: &str, connection_chat: Uuid) -> bool {
    ClientFrame::parse(text)
        .and_then(|frame| frame.command(connection_chat))
        .is_ok_and(|command| command.is_user_activity())
}

fn decode_payload<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T, AppError> {
    T::deserialize(payload).map_err(|e| AppError::InvalidFrame(format!("invalid payload: {e}")))
}

/// Frames pushed to chat sockets.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Message(Message),
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        chat_id: Uuid,
        message_id: Uuid,
        deleted_at: DateTime<Utc>,
    },
    ReadReceipt(ReadReceipt),
    Presence(UserPresenceView),
    #[serde(rename_all = "camelCase")]
    Typing { chat_id: Uuid, user_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: serde_json::Value,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    Error {
        code: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerFrame {
    pub fn error(err: &AppError, request_id: Option<String>) -> Self {
        ServerFrame::Error {
            code: err.code(),
            message: err.to_string(),
            request_id,
        }
    }

    pub fn encode(&self) -> Option<Frame> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Frame::from(text)),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode server frame");
                None
            }
        }
    }
}

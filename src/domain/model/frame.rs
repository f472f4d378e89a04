//! 服务端下行帧

use std::collections::HashMap;

use serde::Serialize;

/// 服务端写给客户端连接的帧
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Message {
        destination: String,
        message_id: String,
        subscription: Option<String>,
        headers: HashMap<String, String>,
        body: serde_json::Value,
    },
    Receipt {
        receipt_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn message(
        destination: impl Into<String>,
        message_id: impl Into<String>,
        headers: HashMap<String, String>,
        body: serde_json::Value,
    ) -> Self {
        ServerFrame::Message {
            destination: destination.into(),
            message_id: message_id.into(),
            subscription: None,
            headers,
            body,
        }
    }

    pub fn destination(&self) -> Option<&str> {
        match self {
            ServerFrame::Message { destination, .. } => Some(destination),
            _ => None,
        }
    }
}

//! 客户端上行帧
//!
//! 只描述核心需要解释的帧语义，线路层编解码由传输层负责。

use serde::{Deserialize, Serialize};

use crate::domain::model::{ClientIdentity, ClientInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// 握手完成，携带已认证的身份
    Connect {
        identity: ClientIdentity,
        #[serde(default)]
        client_info: ClientInfo,
    },
    Subscribe {
        id: String,
        destination: String,
    },
    Unsubscribe {
        id: String,
        destination: String,
    },
    /// 发往 `/app/...` 的上行消息
    Send {
        destination: String,
        #[serde(default)]
        body: String,
    },
    Heartbeat,
    Disconnect,
}

impl ClientFrame {
    pub fn command(&self) -> &'static str {
        match self {
            ClientFrame::Connect { .. } => "CONNECT",
            ClientFrame::Subscribe { .. } => "SUBSCRIBE",
            ClientFrame::Unsubscribe { .. } => "UNSUBSCRIBE",
            ClientFrame::Send { .. } => "SEND",
            ClientFrame::Heartbeat => "HEARTBEAT",
            ClientFrame::Disconnect => "DISCONNECT",
        }
    }
}

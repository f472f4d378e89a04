//! 出站业务消息

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 业务消息类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TaskProgress,
    TaskCompleted,
    DeviceAlert,
    DeviceStatus,
    OrgAnnouncement,
    SystemNotice,
    UserNotification,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::TaskProgress => "TASK_PROGRESS",
            MessageType::TaskCompleted => "TASK_COMPLETED",
            MessageType::DeviceAlert => "DEVICE_ALERT",
            MessageType::DeviceStatus => "DEVICE_STATUS",
            MessageType::OrgAnnouncement => "ORG_ANNOUNCEMENT",
            MessageType::SystemNotice => "SYSTEM_NOTICE",
            MessageType::UserNotification => "USER_NOTIFICATION",
            MessageType::Custom(name) => name,
        }
    }

    /// 从字符串解析，未知类型视为自定义类型
    pub fn from_name(name: &str) -> Self {
        match name {
            "TASK_PROGRESS" => MessageType::TaskProgress,
            "TASK_COMPLETED" => MessageType::TaskCompleted,
            "DEVICE_ALERT" => MessageType::DeviceAlert,
            "DEVICE_STATUS" => MessageType::DeviceStatus,
            "ORG_ANNOUNCEMENT" => MessageType::OrgAnnouncement,
            "SYSTEM_NOTICE" => MessageType::SystemNotice,
            "USER_NOTIFICATION" => MessageType::UserNotification,
            other => MessageType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 出站业务消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    pub message_type: MessageType,
    /// 显式接收用户
    #[serde(default)]
    pub recipient_user_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub terminal_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RealtimeMessage {
    pub fn new(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            message_id: None,
            message_type,
            recipient_user_id: None,
            organization_id: None,
            terminal_id: None,
            task_id: None,
            payload,
            headers: HashMap::new(),
            timestamp: None,
        }
    }

    pub fn with_recipient(mut self, user_id: impl Into<String>) -> Self {
        self.recipient_user_id = Some(user_id.into());
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_terminal(mut self, terminal_id: impl Into<String>) -> Self {
        self.terminal_id = Some(terminal_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// 补全消息ID和时间戳（已有值保持不变）
    pub fn enrich(&mut self) {
        if self.message_id.as_deref().map_or(true, str::is_empty) {
            self.message_id = Some(uuid::Uuid::new_v4().to_string());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }

    pub fn id(&self) -> &str {
        self.message_id.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrich_assigns_id_once() {
        let mut msg = RealtimeMessage::new(MessageType::SystemNotice, serde_json::json!({}));
        msg.enrich();
        let id = msg.id().to_string();
        assert!(!id.is_empty());
        assert!(msg.timestamp.is_some());

        msg.enrich();
        assert_eq!(msg.id(), id);
    }

    #[test]
    fn test_enrich_keeps_producer_id() {
        let mut msg = RealtimeMessage::new(MessageType::DeviceAlert, serde_json::Value::Null);
        msg.message_id = Some("m-1".to_string());
        msg.enrich();
        assert_eq!(msg.id(), "m-1");
    }

    #[test]
    fn test_message_type_names() {
        assert_eq!(MessageType::from_name("DEVICE_ALERT"), MessageType::DeviceAlert);
        assert_eq!(
            MessageType::from_name("firmware_rollout"),
            MessageType::Custom("firmware_rollout".to_string())
        );
        assert_eq!(MessageType::TaskCompleted.to_string(), "TASK_COMPLETED");
    }
}

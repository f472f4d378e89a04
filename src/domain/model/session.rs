//! 会话模型
//!
//! 每个活跃连接对应一个 Session。本地注册表只保存本节点拥有的会话，
//! 会话存储中保存所有节点的会话镜像。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// 握手阶段已认证的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub user_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            roles: Vec::new(),
        }
    }
}

/// 客户端信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub device_type: String,
    pub client_ip: String,
    pub user_agent: String,
}

/// 会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub organization_id: String,
    pub device_type: String,
    pub client_ip: String,
    pub user_agent: String,
    pub connect_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
    pub last_heartbeat_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub node_id: String,
    pub retry_count: u32,
}

impl Session {
    /// 握手成功后创建会话
    pub fn connect(
        session_id: impl Into<String>,
        identity: &ClientIdentity,
        client_info: &ClientInfo,
        node_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: identity.user_id.clone(),
            organization_id: identity.organization_id.clone(),
            device_type: client_info.device_type.clone(),
            client_ip: client_info.client_ip.clone(),
            user_agent: client_info.user_agent.clone(),
            connect_time: now,
            last_activity_time: now,
            last_heartbeat_time: now,
            status: SessionStatus::Connected,
            node_id: node_id.into(),
            retry_count: 0,
        }
    }

    /// 刷新心跳（同时视为一次活动）
    pub fn refresh_heartbeat(&mut self) {
        let now = Utc::now();
        self.last_heartbeat_time = now;
        self.last_activity_time = now;
        if self.status == SessionStatus::Reconnecting {
            self.status = SessionStatus::Connected;
        }
    }

    /// 刷新活动时间
    pub fn record_activity(&mut self) {
        self.last_activity_time = Utc::now();
    }

    /// 心跳是否超时
    pub fn is_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat_time >= timeout
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::new(self.user_id.clone(), self.organization_id.clone())
    }
}

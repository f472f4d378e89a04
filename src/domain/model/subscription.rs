//! 订阅模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 订阅级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionLevel {
    /// 跨重连保留
    Persistent,
    /// 与单个连接同生命周期
    Session,
    /// 一次性，首次投递后移除
    Temporary,
    /// 平台级
    Global,
}

impl SubscriptionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionLevel::Persistent => "PERSISTENT",
            SubscriptionLevel::Session => "SESSION",
            SubscriptionLevel::Temporary => "TEMPORARY",
            SubscriptionLevel::Global => "GLOBAL",
        }
    }
}

/// 订阅记录：(user_id, session_id) -> topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub user_id: String,
    pub session_id: String,
    pub topic: String,
    pub level: SubscriptionLevel,
    pub subscribed_at: DateTime<Utc>,
}

/// 订阅被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// 授权服务明确拒绝
    Forbidden(String),
    /// 授权服务不可用或超时（按拒绝处理）
    AuthorizationUnavailable(String),
}

/// 订阅请求结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// 已授权并生效
    Granted {
        topic: String,
        level: SubscriptionLevel,
    },
    /// 已拒绝，未产生任何状态变更
    Denied { topic: String, reason: DenialReason },
    /// 目的地非法或会话不存在
    Invalid { topic: String, reason: String },
}

impl SubscriptionOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, SubscriptionOutcome::Granted { .. })
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, SubscriptionOutcome::Denied { .. })
    }

    /// 系统无法给出判断（区别于"无权限"）
    pub fn is_undecided(&self) -> bool {
        matches!(
            self,
            SubscriptionOutcome::Denied {
                reason: DenialReason::AuthorizationUnavailable(_),
                ..
            }
        )
    }

    pub fn topic(&self) -> &str {
        match self {
            SubscriptionOutcome::Granted { topic, .. }
            | SubscriptionOutcome::Denied { topic, .. }
            | SubscriptionOutcome::Invalid { topic, .. } => topic,
        }
    }

    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            SubscriptionOutcome::Granted { .. } => "granted",
            SubscriptionOutcome::Denied {
                reason: DenialReason::Forbidden(_),
                ..
            } => "denied",
            SubscriptionOutcome::Denied {
                reason: DenialReason::AuthorizationUnavailable(_),
                ..
            } => "unavailable",
            SubscriptionOutcome::Invalid { .. } => "invalid",
        }
    }
}

/// 取消订阅结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Removed,
    /// 从未订阅过，幂等空操作
    NotSubscribed,
}

//! 协作方接口
//!
//! 会话存储、授权服务、消息持久化、跨节点转发均通过这里的 trait 注入，
//! 便于替换实现以及在测试中模拟。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::model::{ClientIdentity, DispatchResult, RealtimeMessage, ServerFrame};
use crate::error::Result;

/// 分布式会话存储
///
/// 所有服务节点共享，是跨节点在线状态的唯一可信来源。
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// 向集合添加成员，返回新增数量
    async fn set_add(&self, key: &str, member: &str) -> Result<usize>;
    /// 从集合移除成员，返回移除数量
    async fn set_remove(&self, key: &str, member: &str) -> Result<usize>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    /// 成员是否在集合中
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.set_members(key).await?.iter().any(|m| m == member))
    }
    /// 刷新过期时间，键不存在时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    /// 原子自增
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;
}

/// 授权决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub topic: String,
    pub approved: bool,
    pub reason: String,
}

impl AuthorizationDecision {
    pub fn approve(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            approved: true,
            reason: String::new(),
        }
    }

    pub fn deny(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            approved: false,
            reason: reason.into(),
        }
    }
}

/// 外部授权服务
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn verify(
        &self,
        identity: &ClientIdentity,
        topic: &str,
        session_id: &str,
    ) -> Result<AuthorizationDecision>;

    /// 批量校验，默认逐个调用
    async fn verify_batch(
        &self,
        identity: &ClientIdentity,
        topics: &[String],
        session_id: &str,
    ) -> Result<Vec<AuthorizationDecision>> {
        let mut decisions = Vec::with_capacity(topics.len());
        for topic in topics {
            decisions.push(self.verify(identity, topic, session_id).await?);
        }
        Ok(decisions)
    }
}

/// 消息持久化协作方（尽力而为，不影响投递结果）
#[async_trait]
pub trait MessagePersistence: Send + Sync {
    async fn persist(&self, message: &RealtimeMessage, result: &DispatchResult) -> Result<()>;
}

/// 跨节点转发协作方
#[async_trait]
pub trait NodeRelay: Send + Sync {
    async fn relay(&self, node_id: &str, session_id: &str, frame: &ServerFrame) -> Result<()>;
}

/// `/app/...` 上行消息处理方
#[async_trait]
pub trait InboundMessageHandler: Send + Sync {
    async fn on_message(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
        destination: &str,
        body: &str,
    ) -> Result<()>;
}

//! 实时消息核心错误类型定义
//!
//! - 授权拒绝、投递失败、路由降级都不是错误，它们以结果对象返回
//! - 这里只描述基础设施故障和非法输入

use thiserror::Error;

/// 实时消息核心错误类型
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// 目的地不符合主题路径语法
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    /// 无效的参数
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// 会话未找到
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// 会话存储访问失败
    #[error("Session store error: {0}")]
    Store(String),

    /// 会话存储超时
    #[error("Session store operation timed out after {0} ms")]
    StoreTimeout(u64),

    /// 授权服务调用失败
    #[error("Authorization service error: {0}")]
    Authorization(String),

    /// 授权服务超时
    #[error("Authorization service timed out after {0} ms")]
    AuthorizationTimeout(u64),

    /// 单个目标投递失败
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// 路由失败（动态路由和兜底路由均失败）
    #[error("Routing failed: {0}")]
    Routing(String),

    /// 序列化失败
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RealtimeError {
    /// 是否为基础设施超时
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RealtimeError::StoreTimeout(_) | RealtimeError::AuthorizationTimeout(_)
        )
    }
}

impl From<redis::RedisError> for RealtimeError {
    fn from(err: redis::RedisError) -> Self {
        RealtimeError::Store(err.to_string())
    }
}

/// 实时消息核心结果类型
pub type Result<T> = std::result::Result<T, RealtimeError>;

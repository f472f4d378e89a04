//! Flare Realtime 实时消息核心
//!
//! 负责连接/会话生命周期、订阅准入与分级、主题路由、消息投递与结果统计，
//! 以及让多节点保持一致的分布式会话存储。

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interface;
pub mod logging;
pub mod metrics;
pub mod service;

pub use config::RealtimeConfig;
pub use domain::model::{
    ClientIdentity, ClientInfo, DispatchAction, DispatchResult, DispatchType, MessageType,
    RealtimeMessage, RoutingDecision, ServerFrame, Session, SessionStatus, SubscriptionLevel,
    SubscriptionOutcome,
};
pub use error::{RealtimeError, Result};
pub use logging::init_tracing_from_config;
pub use service::{RealtimeRuntime, RuntimeDependencies};

//! 集成测试公共工具

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flare_realtime::domain::model::{ClientIdentity, DispatchResult, RealtimeMessage, ServerFrame};
use flare_realtime::domain::repository::{
    AuthorizationDecision, AuthorizationService, MessagePersistence, NodeRelay,
};
use flare_realtime::domain::service::ConnectionManager;
use flare_realtime::infrastructure::persistence::InMemorySessionStore;
use flare_realtime::{RealtimeConfig, RealtimeError, RealtimeRuntime, Result, RuntimeDependencies};
use prometheus::Registry;
use tokio::sync::mpsc;

/// 统计调用次数的授权服务，拒绝 `denied` 中的主题
#[derive(Default)]
pub struct CountingAuthorizer {
    pub calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub denied: Vec<String>,
}

impl CountingAuthorizer {
    pub fn denying(topics: &[&str]) -> Self {
        Self {
            denied: topics.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthorizationService for CountingAuthorizer {
    async fn verify(
        &self,
        _identity: &ClientIdentity,
        topic: &str,
        _session_id: &str,
    ) -> Result<AuthorizationDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.denied.iter().any(|t| t == topic) {
            Ok(AuthorizationDecision::deny(topic, "not permitted"))
        } else {
            Ok(AuthorizationDecision::approve(topic))
        }
    }

    async fn verify_batch(
        &self,
        identity: &ClientIdentity,
        topics: &[String],
        session_id: &str,
    ) -> Result<Vec<AuthorizationDecision>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut decisions = Vec::with_capacity(topics.len());
        for topic in topics {
            decisions.push(self.verify(identity, topic, session_id).await?);
        }
        Ok(decisions)
    }
}

/// 总是返回错误的授权服务
pub struct FailingAuthorizer;

#[async_trait]
impl AuthorizationService for FailingAuthorizer {
    async fn verify(
        &self,
        _identity: &ClientIdentity,
        _topic: &str,
        _session_id: &str,
    ) -> Result<AuthorizationDecision> {
        Err(RealtimeError::Authorization("authorization backend down".to_string()))
    }
}

/// 超过超时时间才批准的授权服务
pub struct SlowAuthorizer {
    pub delay: Duration,
}

#[async_trait]
impl AuthorizationService for SlowAuthorizer {
    async fn verify(
        &self,
        _identity: &ClientIdentity,
        topic: &str,
        _session_id: &str,
    ) -> Result<AuthorizationDecision> {
        tokio::time::sleep(self.delay).await;
        Ok(AuthorizationDecision::approve(topic))
    }
}

/// 把持久化请求转发到通道，便于测试等待
pub struct RecordingPersistence {
    sender: mpsc::UnboundedSender<(RealtimeMessage, DispatchResult)>,
}

impl RecordingPersistence {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(RealtimeMessage, DispatchResult)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

#[async_trait]
impl MessagePersistence for RecordingPersistence {
    async fn persist(&self, message: &RealtimeMessage, result: &DispatchResult) -> Result<()> {
        let _ = self.sender.send((message.clone(), result.clone()));
        Ok(())
    }
}

/// 直接转发到另一节点连接管理器的转发器
pub struct LoopbackRelay {
    pub target: Arc<ConnectionManager>,
}

#[async_trait]
impl NodeRelay for LoopbackRelay {
    async fn relay(&self, node_id: &str, session_id: &str, frame: &ServerFrame) -> Result<()> {
        if node_id != self.target.node_id() {
            return Err(RealtimeError::Delivery(format!("unknown node {}", node_id)));
        }
        self.target.send_to_session(session_id, frame.clone())
    }
}

pub fn test_config(node_id: &str) -> RealtimeConfig {
    let mut config = RealtimeConfig::default();
    config.node_id = node_id.to_string();
    config.namespace = "it".to_string();
    config.authorization.timeout_ms = 100;
    config.store.operation_timeout_ms = 200;
    config
}

pub fn build_runtime(
    node_id: &str,
    store: Arc<InMemorySessionStore>,
    authorizer: Arc<dyn AuthorizationService>,
    persistence: Arc<dyn MessagePersistence>,
) -> RealtimeRuntime {
    RealtimeRuntime::build(
        test_config(node_id),
        RuntimeDependencies::new(store, authorizer, persistence),
        &Registry::new(),
    )
    .expect("runtime should build")
}

/// 等待持久化记录（带超时）
pub async fn next_persisted(
    receiver: &mut mpsc::UnboundedReceiver<(RealtimeMessage, DispatchResult)>,
) -> (RealtimeMessage, DispatchResult) {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("persistence should be called")
        .expect("persistence channel open")
}

//! 运行时装配 - 负责依赖注入
//!
//! 所有组件都通过构造参数获得共享状态，没有全局单例。

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::RealtimeConfig;
use crate::domain::repository::{
    AuthorizationService, InboundMessageHandler, MessagePersistence, NodeRelay, SessionStore,
};
use crate::domain::service::{
    ConnectionManager, DispatchQueue, MessageDispatcher, QueueOutcome, RoutingEngine,
    SessionDirectory, SubscriberIndex, SubscriptionManager,
};
use crate::infrastructure::authorization::HttpAuthorizationClient;
use crate::infrastructure::persistence::{DiscardingMessageArchive, RedisSessionStore};
use crate::interface::FrameHandler;
use crate::metrics::RealtimeMetrics;
use crate::service::sweeper::{SessionSweeper, SweeperHandle};

/// 外部协作方
pub struct RuntimeDependencies {
    pub store: Arc<dyn SessionStore>,
    pub authorizer: Arc<dyn AuthorizationService>,
    pub persistence: Arc<dyn MessagePersistence>,
    pub relay: Option<Arc<dyn NodeRelay>>,
    pub inbound: Option<Arc<dyn InboundMessageHandler>>,
}

impl RuntimeDependencies {
    pub fn new(
        store: Arc<dyn SessionStore>,
        authorizer: Arc<dyn AuthorizationService>,
        persistence: Arc<dyn MessagePersistence>,
    ) -> Self {
        Self {
            store,
            authorizer,
            persistence,
            relay: None,
            inbound: None,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn NodeRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_inbound_handler(mut self, inbound: Arc<dyn InboundMessageHandler>) -> Self {
        self.inbound = Some(inbound);
        self
    }
}

/// 已装配的运行时
pub struct RealtimeRuntime {
    pub config: Arc<RealtimeConfig>,
    pub metrics: Arc<RealtimeMetrics>,
    pub directory: Arc<SessionDirectory>,
    pub connections: Arc<ConnectionManager>,
    pub subscriber_index: Arc<SubscriberIndex>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub routing: Arc<RoutingEngine>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub frame_handler: Arc<FrameHandler>,
    pub sweeper: Arc<SessionSweeper>,
    persistence: Arc<dyn MessagePersistence>,
}

impl RealtimeRuntime {
    /// 用注入的协作方装配所有组件
    pub fn build(
        config: RealtimeConfig,
        dependencies: RuntimeDependencies,
        registry: &Registry,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let metrics = Arc::new(
            RealtimeMetrics::new(registry).context("Failed to register realtime metrics")?,
        );

        let directory = Arc::new(
            SessionDirectory::new(
                dependencies.store,
                config.namespace.clone(),
                config.session_ttl(),
                config.store_timeout(),
            )
            .with_metrics(metrics.clone()),
        );
        let connections = Arc::new(ConnectionManager::new(
            config.node_id.clone(),
            directory.clone(),
            dependencies.relay,
            metrics.clone(),
        ));
        let subscriber_index = Arc::new(SubscriberIndex::new());
        let subscriptions = Arc::new(SubscriptionManager::new(
            subscriber_index.clone(),
            connections.clone(),
            directory.clone(),
            dependencies.authorizer,
            config.authorization_timeout(),
            metrics.clone(),
        ));
        let routing = Arc::new(RoutingEngine::new(&config.routing, subscriber_index.clone()));
        let dispatcher = Arc::new(MessageDispatcher::new(
            routing.clone(),
            connections.clone(),
            dependencies.persistence.clone(),
            metrics.clone(),
            &config.dispatch,
        ));
        let frame_handler = Arc::new(FrameHandler::new(
            connections.clone(),
            subscriptions.clone(),
            dependencies.inbound,
            config.dispatch.outbound_buffer,
        ));
        let sweeper = Arc::new(SessionSweeper::new(
            connections.clone(),
            subscriptions.clone(),
            directory.clone(),
            metrics.clone(),
            &config.heartbeat,
        ));

        info!(
            node_id = %config.node_id,
            namespace = %config.namespace,
            "realtime runtime assembled"
        );

        Ok(Self {
            config,
            metrics,
            directory,
            connections,
            subscriber_index,
            subscriptions,
            routing,
            dispatcher,
            frame_handler,
            sweeper,
            persistence: dependencies.persistence,
        })
    }

    /// 按配置连接 Redis 和 HTTP 授权服务后装配
    pub async fn from_config(config: RealtimeConfig, registry: &Registry) -> Result<Self> {
        let store = RedisSessionStore::connect(&config.store.redis_url)
            .await
            .with_context(|| format!("Failed to connect session store at {}", config.store.redis_url))?;
        let endpoint = config
            .authorization
            .endpoint
            .clone()
            .context("authorization.endpoint must be configured")?;
        let authorizer = HttpAuthorizationClient::new(endpoint, config.authorization_timeout())
            .context("Failed to create authorization client")?;

        let dependencies = RuntimeDependencies::new(
            Arc::new(store),
            Arc::new(authorizer),
            Arc::new(DiscardingMessageArchive),
        );
        Self::build(config, dependencies, registry)
    }

    /// 启动会话清理任务
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.sweeper.clone().start()
    }

    /// 启动投递队列
    pub fn start_dispatch_queue(
        &self,
        outcomes: Option<mpsc::UnboundedSender<QueueOutcome>>,
    ) -> (DispatchQueue, JoinHandle<()>) {
        DispatchQueue::start(self.dispatcher.clone(), &self.config.dispatch, outcomes)
    }

    pub fn persistence(&self) -> &Arc<dyn MessagePersistence> {
        &self.persistence
    }
}

//! 会话清理任务
//!
//! 周期执行：
//! 1. 清理心跳超时的本地会话（先清订阅再移除连接），按批处理
//! 2. 把本地存活会话重新写回会话存储
//! 3. 分批修剪在线用户集合中已无有效会话的用户

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::domain::service::{ConnectionManager, SessionDirectory, SubscriptionManager};
use crate::metrics::RealtimeMetrics;

/// 单次清理的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reasserted: usize,
    pub pruned_users: usize,
}

pub struct SessionSweeper {
    connections: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionManager>,
    directory: Arc<SessionDirectory>,
    metrics: Arc<RealtimeMetrics>,
    heartbeat_timeout: chrono::Duration,
    interval: Duration,
    batch_size: usize,
    /// 在线用户修剪的轮转游标
    prune_cursor: AtomicUsize,
}

/// 运行中的清理任务
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// 通知停止并等待任务退出
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(error = %err, "session sweeper task ended abnormally");
        }
    }
}

impl SessionSweeper {
    pub fn new(
        connections: Arc<ConnectionManager>,
        subscriptions: Arc<SubscriptionManager>,
        directory: Arc<SessionDirectory>,
        metrics: Arc<RealtimeMetrics>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            directory,
            metrics,
            heartbeat_timeout: chrono::Duration::seconds(config.timeout_seconds as i64),
            interval: Duration::from_secs(config.sweep_interval_seconds.max(1)),
            batch_size: config.sweep_batch_size.max(1),
            prune_cursor: AtomicUsize::new(0),
        }
    }

    /// 启动周期任务
    pub fn start(self: Arc<Self>) -> SweeperHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let sweeper = Arc::clone(&self);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.interval);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            info!(interval_secs = sweeper.interval.as_secs(), "session sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = sweeper.run_once().await;
                        if report != SweepReport::default() {
                            debug!(
                                expired = report.expired,
                                reasserted = report.reasserted,
                                pruned_users = report.pruned_users,
                                "session sweep finished"
                            );
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("session sweeper stopped");
        });
        SweeperHandle { shutdown, join }
    }

    /// 执行一次完整清理
    pub async fn run_once(&self) -> SweepReport {
        let expired = self.expire_stale_sessions().await;
        let reasserted = self.connections.reassert_local_sessions(usize::MAX).await;
        let pruned_users = self.prune_online_users().await;
        SweepReport {
            expired,
            reasserted,
            pruned_users,
        }
    }

    async fn expire_stale_sessions(&self) -> usize {
        let mut total = 0;
        loop {
            let batch = self
                .connections
                .expired_session_ids(self.heartbeat_timeout, self.batch_size);
            let batch_len = batch.len();
            for session_id in batch {
                if let Some(session) = self.connections.local_session(&session_id) {
                    self.subscriptions
                        .cleanup_user_session_subscriptions(&session.identity(), &session_id);
                }
                if let Some(session) = self.connections.remove_connection(&session_id).await {
                    info!(
                        session_id = %session_id,
                        user_id = %session.user_id,
                        last_heartbeat = %session.last_heartbeat_time,
                        "session expired by heartbeat timeout"
                    );
                    total += 1;
                    self.metrics.sweeper_expired_sessions_total.inc();
                }
            }
            if batch_len < self.batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }
        total
    }

    async fn prune_online_users(&self) -> usize {
        let mut users = match self.directory.online_user_ids().await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "skip online user pruning, store unavailable");
                return 0;
            }
        };
        if users.is_empty() {
            return 0;
        }
        users.sort();

        let start = self.prune_cursor.load(Ordering::Relaxed) % users.len();
        let batch: Vec<String> = users
            .iter()
            .cycle()
            .skip(start)
            .take(self.batch_size.min(users.len()))
            .cloned()
            .collect();
        self.prune_cursor
            .store(start + batch.len(), Ordering::Relaxed);

        let mut pruned = 0;
        for user_id in batch {
            if self.connections.has_local_session(&user_id) {
                continue;
            }
            match self.directory.prune_user_sessions(&user_id).await {
                Ok(remaining) if remaining.is_empty() => pruned += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "failed to prune online user");
                    if err.is_timeout() {
                        break;
                    }
                }
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::model::{ClientIdentity, ClientInfo, Session};
    use crate::domain::repository::{AuthorizationDecision, AuthorizationService, SessionStore};
    use crate::domain::service::{ConnectionHandle, SubscriberIndex};
    use crate::error::Result;
    use crate::infrastructure::persistence::InMemorySessionStore;

    struct DenyAll;

    #[async_trait]
    impl AuthorizationService for DenyAll {
        async fn verify(
            &self,
            _identity: &ClientIdentity,
            topic: &str,
            _session_id: &str,
        ) -> Result<AuthorizationDecision> {
            Ok(AuthorizationDecision::deny(topic, "test"))
        }
    }

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        directory: Arc<SessionDirectory>,
        connections: Arc<ConnectionManager>,
        subscriptions: Arc<SubscriptionManager>,
        metrics: Arc<RealtimeMetrics>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let directory = Arc::new(SessionDirectory::new(
            store.clone(),
            "test",
            StdDuration::from_secs(60),
            StdDuration::from_millis(200),
        ));
        let metrics = Arc::new(RealtimeMetrics::standalone());
        let connections = Arc::new(ConnectionManager::new(
            "node-a",
            directory.clone(),
            None,
            metrics.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            Arc::new(SubscriberIndex::new()),
            connections.clone(),
            directory.clone(),
            Arc::new(DenyAll),
            StdDuration::from_millis(100),
            metrics.clone(),
        ));
        Fixture {
            store,
            directory,
            connections,
            subscriptions,
            metrics,
        }
    }

    fn sweeper(fixture: &Fixture, timeout_seconds: u64) -> SessionSweeper {
        SessionSweeper::new(
            fixture.connections.clone(),
            fixture.subscriptions.clone(),
            fixture.directory.clone(),
            fixture.metrics.clone(),
            &HeartbeatConfig {
                timeout_seconds,
                sweep_interval_seconds: 1,
                sweep_batch_size: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_expires_sessions_without_heartbeat() {
        let fixture = fixture();
        let identity = ClientIdentity::new("U1", "O1");
        for session_id in ["S1", "S2"] {
            let (handle, _rx) = ConnectionHandle::channel(session_id, 4);
            fixture
                .connections
                .register_connection(session_id, &identity, &ClientInfo::default(), handle)
                .await
                .unwrap();
            fixture
                .subscriptions
                .perform_auto_subscription(&identity, session_id);
        }

        // 超时为 0：所有会话立即视为过期，批大小为 1 时需要多批处理
        let report = sweeper(&fixture, 0).run_once().await;
        assert_eq!(report.expired, 2);
        assert_eq!(fixture.connections.local_connection_count(), 0);
        assert!(fixture.subscriptions.session_topics("S1").is_empty());
        assert!(!fixture.connections.is_user_online("U1").await);
    }

    #[tokio::test]
    async fn test_reasserts_expired_store_records() {
        let fixture = fixture();
        let (handle, _rx) = ConnectionHandle::channel("S1", 4);
        fixture
            .connections
            .register_connection("S1", &ClientIdentity::new("U1", "O1"), &ClientInfo::default(), handle)
            .await
            .unwrap();
        fixture.store.delete("test:session:S1").await.unwrap();

        let report = sweeper(&fixture, 3600).run_once().await;
        assert_eq!(report.expired, 0);
        assert_eq!(report.reasserted, 1);
        assert!(fixture.store.get("test:session:S1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prunes_users_left_by_crashed_nodes() {
        let fixture = fixture();
        let ghost = Session::connect(
            "S9",
            &ClientIdentity::new("U9", "O1"),
            &ClientInfo::default(),
            "node-b",
        );
        fixture.directory.save_session(&ghost).await.unwrap();
        fixture.store.delete("test:session:S9").await.unwrap();

        let report = sweeper(&fixture, 3600).run_once().await;
        assert_eq!(report.pruned_users, 1);
        assert!(!fixture.connections.is_user_online("U9").await);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let fixture = fixture();
        let handle = Arc::new(sweeper(&fixture, 3600)).start();
        handle.shutdown().await;
    }
}

//! 会话目录 - 会话存储的类型化客户端
//!
//! 键空间：
//! - `{ns}:session:{sessionId}`            会话详情（JSON）
//! - `{ns}:user:sessions:{userId}`         用户会话集合
//! - `{ns}:org:sessions:{orgId}`           组织会话集合
//! - `{ns}:online:users`                   在线用户集合
//! - `{ns}:user:subscriptions:{userId}`    用户的持久订阅集合
//! - `{ns}:counter:connections`            累计接入连接数
//!
//! 所有调用都带超时，超时转为 `RealtimeError::StoreTimeout`。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::model::Session;
use crate::domain::repository::SessionStore;
use crate::error::{RealtimeError, Result};
use crate::metrics::RealtimeMetrics;

pub struct SessionDirectory {
    store: Arc<dyn SessionStore>,
    namespace: String,
    session_ttl: Duration,
    operation_timeout: Duration,
    metrics: Option<Arc<RealtimeMetrics>>,
}

impl SessionDirectory {
    pub fn new(
        store: Arc<dyn SessionStore>,
        namespace: impl Into<String>,
        session_ttl: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            session_ttl,
            operation_timeout,
            metrics: None,
        }
    }

    /// 记录存储调用失败次数
    pub fn with_metrics(mut self, metrics: Arc<RealtimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.namespace, session_id)
    }

    fn user_sessions_key(&self, user_id: &str) -> String {
        format!("{}:user:sessions:{}", self.namespace, user_id)
    }

    fn org_sessions_key(&self, org_id: &str) -> String {
        format!("{}:org:sessions:{}", self.namespace, org_id)
    }

    fn online_users_key(&self) -> String {
        format!("{}:online:users", self.namespace)
    }

    fn user_subscriptions_key(&self, user_id: &str) -> String {
        format!("{}:user:subscriptions:{}", self.namespace, user_id)
    }

    fn connection_counter_key(&self) -> String {
        format!("{}:counter:connections", self.namespace)
    }

    async fn timed<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::StoreTimeout(
                self.operation_timeout.as_millis() as u64,
            )),
        };
        if let (Err(err), Some(metrics)) = (&result, &self.metrics) {
            let kind = if err.is_timeout() { "timeout" } else { "error" };
            metrics.store_errors_total.with_label_values(&[kind]).inc();
        }
        result
    }

    /// 写入会话记录以及用户/组织/在线集合，并刷新所有相关键的过期时间
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let payload = serde_json::to_string(session)?;
        let ttl = self.session_ttl;
        let session_key = self.session_key(&session.session_id);
        let user_key = self.user_sessions_key(&session.user_id);
        let org_key = self.org_sessions_key(&session.organization_id);
        let online_key = self.online_users_key();
        let subscriptions_key = self.user_subscriptions_key(&session.user_id);

        self.timed(async {
            self.store.set(&session_key, &payload, ttl).await?;
            self.store.set_add(&user_key, &session.session_id).await?;
            self.store.expire(&user_key, ttl).await?;
            self.store.set_add(&org_key, &session.session_id).await?;
            self.store.expire(&org_key, ttl).await?;
            self.store.set_add(&online_key, &session.user_id).await?;
            self.store.expire(&online_key, ttl).await?;
            // 持久订阅随用户活跃续期
            self.store.expire(&subscriptions_key, ttl).await?;
            Ok(())
        })
        .await
    }

    /// 读取会话记录
    pub async fn load_session(&self, session_id: &str) -> Result<Option<Session>> {
        let key = self.session_key(session_id);
        let payload = self.timed(self.store.get(&key)).await?;
        match payload {
            Some(json) => match serde_json::from_str::<Session>(&json) {
                Ok(session) => Ok(Some(session)),
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "corrupted session record, ignoring");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// 删除会话记录，并从用户/组织集合中移除
    ///
    /// 返回用户剩余的会话ID（已剔除过期记录）。剩余为空时同时移出在线集合。
    pub async fn remove_session(
        &self,
        session_id: &str,
        user_id: &str,
        org_id: &str,
    ) -> Result<Vec<String>> {
        let session_key = self.session_key(session_id);
        let user_key = self.user_sessions_key(user_id);
        let org_key = self.org_sessions_key(org_id);

        self.timed(async {
            self.store.delete(&session_key).await?;
            self.store.set_remove(&user_key, session_id).await?;
            self.store.set_remove(&org_key, session_id).await?;
            Ok(())
        })
        .await?;

        let remaining = self.prune_user_sessions(user_id).await?;
        debug!(
            session_id = %session_id,
            user_id = %user_id,
            remaining = remaining.len(),
            "session removed from store"
        );
        Ok(remaining)
    }

    /// 剔除用户集合中已过期的会话ID，返回仍然有效的会话ID
    ///
    /// 用户没有任何有效会话时从在线集合移除。移除后再读一次用户集合，
    /// 其它节点在此期间写入的会话会把用户重新放回在线集合。
    pub async fn prune_user_sessions(&self, user_id: &str) -> Result<Vec<String>> {
        let alive = self.live_user_sessions(user_id, true).await?;
        if !alive.is_empty() {
            return Ok(alive);
        }

        let online_key = self.online_users_key();
        self.timed(self.store.set_remove(&online_key, user_id)).await?;

        let late = self.live_user_sessions(user_id, false).await?;
        if !late.is_empty() {
            debug!(user_id = %user_id, sessions = late.len(), "session registered during prune, user kept online");
            self.timed(async {
                self.store.set_add(&online_key, user_id).await?;
                self.store.expire(&online_key, self.session_ttl).await?;
                Ok(())
            })
            .await?;
        }
        Ok(late)
    }

    /// 用户集合中会话记录仍存在的成员，`evict` 为 true 时移除失效成员
    async fn live_user_sessions(&self, user_id: &str, evict: bool) -> Result<Vec<String>> {
        let user_key = self.user_sessions_key(user_id);
        let members = self.timed(self.store.set_members(&user_key)).await?;

        let mut alive = Vec::with_capacity(members.len());
        for member in members {
            let key = self.session_key(&member);
            if self.timed(self.store.get(&key)).await?.is_some() {
                alive.push(member);
            } else if evict {
                self.timed(self.store.set_remove(&user_key, &member)).await?;
            }
        }
        Ok(alive)
    }

    /// 刷新会话相关键的过期时间
    ///
    /// 会话记录本身用 `save_session` 重写，保证过期后可以被重新建立。
    pub async fn touch_session(&self, session: &Session) -> Result<()> {
        self.save_session(session).await
    }

    /// 用户的全部会话（跨节点）
    pub async fn user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let user_key = self.user_sessions_key(user_id);
        let members = self.timed(self.store.set_members(&user_key)).await?;
        let mut sessions = Vec::with_capacity(members.len());
        for session_id in members {
            if let Some(session) = self.load_session(&session_id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// 组织下的全部会话ID
    pub async fn org_session_ids(&self, org_id: &str) -> Result<Vec<String>> {
        let key = self.org_sessions_key(org_id);
        self.timed(self.store.set_members(&key)).await
    }

    /// 用户是否在任意节点在线
    pub async fn is_user_online(&self, user_id: &str) -> Result<bool> {
        let online_key = self.online_users_key();
        if !self.timed(self.store.set_contains(&online_key, user_id)).await? {
            return Ok(false);
        }
        let user_key = self.user_sessions_key(user_id);
        let sessions = self.timed(self.store.set_members(&user_key)).await?;
        Ok(!sessions.is_empty())
    }

    /// 在线用户ID（跨节点）
    pub async fn online_user_ids(&self) -> Result<Vec<String>> {
        let online_key = self.online_users_key();
        self.timed(self.store.set_members(&online_key)).await
    }

    /// 记录一次连接接入，返回累计值
    pub async fn increment_connection_counter(&self) -> Result<i64> {
        let key = self.connection_counter_key();
        self.timed(self.store.increment(&key, 1)).await
    }

    /// 保存持久订阅
    pub async fn add_persistent_subscription(&self, user_id: &str, topic: &str) -> Result<()> {
        let key = self.user_subscriptions_key(user_id);
        self.timed(async {
            self.store.set_add(&key, topic).await?;
            self.store.expire(&key, self.session_ttl).await?;
            Ok(())
        })
        .await
    }

    /// 移除持久订阅
    pub async fn remove_persistent_subscription(&self, user_id: &str, topic: &str) -> Result<bool> {
        let key = self.user_subscriptions_key(user_id);
        let removed = self.timed(self.store.set_remove(&key, topic)).await?;
        Ok(removed > 0)
    }

    /// 用户的持久订阅
    pub async fn persistent_subscriptions(&self, user_id: &str) -> Result<Vec<String>> {
        let key = self.user_subscriptions_key(user_id);
        let mut topics = self.timed(self.store.set_members(&key)).await?;
        topics.sort();
        Ok(topics)
    }
}

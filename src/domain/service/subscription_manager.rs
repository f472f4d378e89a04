//! 订阅管理
//!
//! 每个 (session, topic) 的状态流转：REQUESTED -> APPROVED/DENIED -> ACTIVE -> REMOVED。
//! 授权服务出错或超时一律按拒绝处理。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::domain::model::{
    ClientIdentity, DenialReason, Subscription, SubscriptionLevel, SubscriptionOutcome,
    UnsubscribeOutcome,
};
use crate::domain::repository::{AuthorizationDecision, AuthorizationService};
use crate::domain::service::connection_manager::ConnectionManager;
use crate::domain::service::session_directory::SessionDirectory;
use crate::domain::service::subscriber_index::SubscriberIndex;
use crate::domain::value_object::Destination;
use crate::error::{RealtimeError, Result};
use crate::metrics::RealtimeMetrics;

/// 用户个人通知主题
pub fn user_notification_topic(user_id: &str) -> String {
    format!("/topic/user/{}/notifications", user_id)
}

/// 组织公告主题
pub fn org_announcement_topic(org_id: &str) -> String {
    format!("/topic/org/{}/announcements", org_id)
}

/// 由身份推导的自动订阅主题（固定顺序）
pub fn auto_subscription_topics(identity: &ClientIdentity) -> Vec<String> {
    vec![
        user_notification_topic(&identity.user_id),
        org_announcement_topic(&identity.organization_id),
    ]
}

pub struct SubscriptionManager {
    index: Arc<SubscriberIndex>,
    connections: Arc<ConnectionManager>,
    directory: Arc<SessionDirectory>,
    authorizer: Arc<dyn AuthorizationService>,
    authorization_timeout: Duration,
    metrics: Arc<RealtimeMetrics>,
}

impl SubscriptionManager {
    pub fn new(
        index: Arc<SubscriberIndex>,
        connections: Arc<ConnectionManager>,
        directory: Arc<SessionDirectory>,
        authorizer: Arc<dyn AuthorizationService>,
        authorization_timeout: Duration,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            index,
            connections,
            directory,
            authorizer,
            authorization_timeout,
            metrics,
        }
    }

    pub fn index(&self) -> &Arc<SubscriberIndex> {
        &self.index
    }

    /// 处理订阅请求
    pub async fn handle_subscription(
        &self,
        identity: &ClientIdentity,
        topic: &str,
        session_id: &str,
    ) -> SubscriptionOutcome {
        let outcome = self.admit(identity, topic, session_id).await;
        self.metrics
            .subscriptions_total
            .with_label_values(&[outcome.label()])
            .inc();

        match &outcome {
            SubscriptionOutcome::Granted { level, .. } => {
                info!(
                    user_id = %identity.user_id,
                    session_id = %session_id,
                    topic = %topic,
                    level = level.as_str(),
                    "subscription granted"
                );
            }
            SubscriptionOutcome::Denied { reason, .. } => {
                warn!(
                    user_id = %identity.user_id,
                    session_id = %session_id,
                    topic = %topic,
                    reason = ?reason,
                    "subscription denied"
                );
            }
            SubscriptionOutcome::Invalid { reason, .. } => {
                debug!(
                    user_id = %identity.user_id,
                    session_id = %session_id,
                    topic = %topic,
                    reason = %reason,
                    "subscription rejected as invalid"
                );
            }
        }
        outcome
    }

    async fn admit(
        &self,
        identity: &ClientIdentity,
        topic: &str,
        session_id: &str,
    ) -> SubscriptionOutcome {
        let destination = match Destination::parse(topic) {
            Ok(destination) => destination,
            Err(err) => return invalid(topic, err.to_string()),
        };
        let Some(level) = destination.subscription_level() else {
            return invalid(topic, "destination is not subscribable".to_string());
        };
        if let Err(reason) = self.check_session(identity, session_id) {
            return invalid(topic, reason);
        }

        let decision = match self.verify(identity, destination.as_str(), session_id).await {
            Ok(decision) => decision,
            Err(err) => {
                return SubscriptionOutcome::Denied {
                    topic: destination.as_str().to_string(),
                    reason: DenialReason::AuthorizationUnavailable(err.to_string()),
                };
            }
        };
        if !decision.approved {
            return SubscriptionOutcome::Denied {
                topic: destination.as_str().to_string(),
                reason: DenialReason::Forbidden(decision.reason),
            };
        }

        self.index.add(Subscription {
            user_id: identity.user_id.clone(),
            session_id: session_id.to_string(),
            topic: destination.as_str().to_string(),
            level,
            subscribed_at: Utc::now(),
        });

        if level == SubscriptionLevel::Persistent
            && !self.is_auto_topic(identity, destination.as_str())
        {
            if let Err(err) = self
                .directory
                .add_persistent_subscription(&identity.user_id, destination.as_str())
                .await
            {
                warn!(
                    user_id = %identity.user_id,
                    topic = %topic,
                    error = %err,
                    "failed to record persistent subscription"
                );
            }
        }

        SubscriptionOutcome::Granted {
            topic: destination.as_str().to_string(),
            level,
        }
    }

    fn check_session(&self, identity: &ClientIdentity, session_id: &str) -> std::result::Result<(), String> {
        match self.connections.local_session(session_id) {
            Some(session) if session.user_id == identity.user_id => Ok(()),
            Some(_) => Err(format!("session {} belongs to another user", session_id)),
            None => Err(format!("session {} is not connected", session_id)),
        }
    }

    fn is_auto_topic(&self, identity: &ClientIdentity, topic: &str) -> bool {
        auto_subscription_topics(identity).iter().any(|t| t == topic)
    }

    async fn verify(
        &self,
        identity: &ClientIdentity,
        topic: &str,
        session_id: &str,
    ) -> Result<AuthorizationDecision> {
        match tokio::time::timeout(
            self.authorization_timeout,
            self.authorizer.verify(identity, topic, session_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::AuthorizationTimeout(
                self.authorization_timeout.as_millis() as u64,
            )),
        }
    }

    async fn verify_batch(
        &self,
        identity: &ClientIdentity,
        topics: &[String],
        session_id: &str,
    ) -> Result<Vec<AuthorizationDecision>> {
        match tokio::time::timeout(
            self.authorization_timeout,
            self.authorizer.verify_batch(identity, topics, session_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::AuthorizationTimeout(
                self.authorization_timeout.as_millis() as u64,
            )),
        }
    }

    /// 取消订阅，不经过授权
    ///
    /// 主题按订阅时的同一规则规范化，无法解析的主题视为未订阅。
    pub async fn handle_unsubscription(
        &self,
        identity: &ClientIdentity,
        topic: &str,
        session_id: &str,
    ) -> UnsubscribeOutcome {
        let destination = match Destination::parse(topic) {
            Ok(destination) => destination,
            Err(err) => {
                debug!(session_id = %session_id, topic = %topic, error = %err, "unsubscribe for unparsable destination");
                return UnsubscribeOutcome::NotSubscribed;
            }
        };
        let topic = destination.as_str();
        let Some(removed) = self.index.remove(session_id, topic) else {
            debug!(session_id = %session_id, topic = %topic, "unsubscribe for unknown subscription");
            return UnsubscribeOutcome::NotSubscribed;
        };

        if removed.level == SubscriptionLevel::Persistent {
            if let Err(err) = self
                .directory
                .remove_persistent_subscription(&identity.user_id, topic)
                .await
            {
                warn!(
                    user_id = %identity.user_id,
                    topic = %topic,
                    error = %err,
                    "failed to drop persistent subscription"
                );
            }
        }

        info!(
            user_id = %identity.user_id,
            session_id = %session_id,
            topic = %topic,
            "subscription removed"
        );
        UnsubscribeOutcome::Removed
    }

    /// 连接建立后的自动订阅，不调用授权服务
    ///
    /// 终端主题从不自动订阅。
    pub fn perform_auto_subscription(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
    ) -> Vec<String> {
        let mut subscribed = Vec::with_capacity(2);
        for topic in auto_subscription_topics(identity) {
            let destination = match Destination::parse(&topic) {
                Ok(destination) => destination,
                Err(err) => {
                    warn!(
                        user_id = %identity.user_id,
                        topic = %topic,
                        error = %err,
                        "skip auto subscription with invalid identity segment"
                    );
                    continue;
                }
            };
            let level = destination
                .subscription_level()
                .unwrap_or(SubscriptionLevel::Session);
            self.index.add(Subscription {
                user_id: identity.user_id.clone(),
                session_id: session_id.to_string(),
                topic: topic.clone(),
                level,
                subscribed_at: Utc::now(),
            });
            subscribed.push(topic);
        }

        debug!(
            user_id = %identity.user_id,
            session_id = %session_id,
            topics = ?subscribed,
            "auto subscription completed"
        );
        subscribed
    }

    /// 为新会话恢复用户的持久订阅
    ///
    /// 一次批量授权；明确被拒绝的主题从存储中移除，授权不可用时不恢复也不删除。
    pub async fn restore_persistent_subscriptions(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
    ) -> Vec<String> {
        let stored = match self.directory.persistent_subscriptions(&identity.user_id).await {
            Ok(topics) => topics,
            Err(err) => {
                warn!(user_id = %identity.user_id, error = %err, "failed to load persistent subscriptions");
                return Vec::new();
            }
        };

        let candidates: Vec<String> = stored
            .into_iter()
            .filter(|topic| !self.index.is_subscribed(session_id, topic))
            .filter(|topic| {
                Destination::parse(topic)
                    .ok()
                    .and_then(|d| d.subscription_level())
                    == Some(SubscriptionLevel::Persistent)
            })
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let decisions = match self.verify_batch(identity, &candidates, session_id).await {
            Ok(decisions) => decisions,
            Err(err) => {
                warn!(
                    user_id = %identity.user_id,
                    session_id = %session_id,
                    error = %err,
                    "authorization unavailable, persistent subscriptions not restored"
                );
                return Vec::new();
            }
        };

        let mut restored = Vec::new();
        for decision in decisions {
            if !candidates.contains(&decision.topic) {
                continue;
            }
            if decision.approved {
                self.index.add(Subscription {
                    user_id: identity.user_id.clone(),
                    session_id: session_id.to_string(),
                    topic: decision.topic.clone(),
                    level: SubscriptionLevel::Persistent,
                    subscribed_at: Utc::now(),
                });
                restored.push(decision.topic);
            } else if let Err(err) = self
                .directory
                .remove_persistent_subscription(&identity.user_id, &decision.topic)
                .await
            {
                warn!(
                    user_id = %identity.user_id,
                    topic = %decision.topic,
                    error = %err,
                    "failed to drop revoked persistent subscription"
                );
            }
        }

        info!(
            user_id = %identity.user_id,
            session_id = %session_id,
            restored = restored.len(),
            "persistent subscriptions restored"
        );
        restored
    }

    /// 清理会话的全部订阅（不影响同一用户的其它会话，也不删除存储中的持久订阅）
    pub fn cleanup_user_session_subscriptions(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
    ) -> usize {
        let removed = self.index.remove_session(session_id);
        debug!(
            user_id = %identity.user_id,
            session_id = %session_id,
            removed = removed.len(),
            "session subscriptions cleaned up"
        );
        removed.len()
    }

    /// 批量权限检查，只返回被批准的主题
    ///
    /// 非法目的地直接剔除；授权服务不可用时返回空集合。
    pub async fn batch_check_permissions(
        &self,
        identity: &ClientIdentity,
        topics: &[String],
        session_id: &str,
    ) -> Vec<String> {
        let valid: Vec<String> = topics
            .iter()
            .filter(|topic| {
                Destination::parse(topic)
                    .map(|d| d.is_subscribable())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if valid.is_empty() {
            return Vec::new();
        }

        match self.verify_batch(identity, &valid, session_id).await {
            Ok(decisions) => {
                let approved: HashSet<String> = decisions
                    .into_iter()
                    .filter(|d| d.approved)
                    .map(|d| d.topic)
                    .collect();
                valid.into_iter().filter(|t| approved.contains(t)).collect()
            }
            Err(err) => {
                warn!(
                    user_id = %identity.user_id,
                    error = %err,
                    "batch authorization unavailable, denying all"
                );
                Vec::new()
            }
        }
    }

    pub fn session_topics(&self, session_id: &str) -> Vec<String> {
        self.index.session_topics(session_id)
    }
}

fn invalid(topic: &str, reason: String) -> SubscriptionOutcome {
    SubscriptionOutcome::Invalid {
        topic: topic.to_string(),
        reason,
    }
}

//! 消息投递
//!
//! 生产方的统一入口：补全消息 -> 路由 -> 按目标并发扇出 -> 汇总结果 -> 异步持久化。
//! 所有投递接口都返回 `DispatchResult`，不向调用方返回错误。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::config::DispatchConfig;
use crate::domain::model::{
    DispatchAccumulator, DispatchResult, DispatchType, MessageType, RealtimeMessage,
    RoutingDecision, ServerFrame, TargetOutcome,
};
use crate::domain::repository::MessagePersistence;
use crate::domain::service::connection_manager::ConnectionManager;
use crate::domain::service::routing_engine::{DIRECT_USER_STRATEGY, RoutingEngine};
use crate::domain::value_object::{Destination, DestinationKind};
use crate::metrics::RealtimeMetrics;

pub const EXPLICIT_TOPIC_STRATEGY: &str = "explicit-topic";
pub const GLOBAL_BROADCAST_STRATEGY: &str = "global-broadcast";

const MESSAGE_TYPE_HEADER: &str = "message-type";
const AGGREGATED_COUNT_HEADER: &str = "aggregated-count";

pub struct MessageDispatcher {
    routing: Arc<RoutingEngine>,
    connections: Arc<ConnectionManager>,
    persistence: Arc<dyn MessagePersistence>,
    metrics: Arc<RealtimeMetrics>,
    max_concurrency: usize,
    broadcast_topic: String,
}

impl MessageDispatcher {
    pub fn new(
        routing: Arc<RoutingEngine>,
        connections: Arc<ConnectionManager>,
        persistence: Arc<dyn MessagePersistence>,
        metrics: Arc<RealtimeMetrics>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            routing,
            connections,
            persistence,
            metrics,
            max_concurrency: config.max_concurrency.max(1),
            broadcast_topic: config.broadcast_topic.clone(),
        }
    }

    /// 按路由引擎的决策投递
    #[instrument(skip(self, message), fields(message_type = %message.message_type))]
    pub async fn dispatch(&self, message: RealtimeMessage) -> DispatchResult {
        self.execute(message, None, DispatchType::Normal, 0, true).await
    }

    /// 单次投递尝试，不触发持久化（由投递队列在最终结果确定后持久化）
    ///
    /// `decision` 为空时走路由引擎，重试时只带上次失败的目标。
    pub(crate) async fn dispatch_attempt(
        &self,
        message: RealtimeMessage,
        decision: Option<RoutingDecision>,
    ) -> DispatchResult {
        self.execute(message, decision, DispatchType::Normal, 0, false)
            .await
    }

    /// 点对点投递给用户的所有会话
    #[instrument(skip(self, message), fields(user_id = %user_id))]
    pub async fn send_to_user(&self, user_id: &str, mut message: RealtimeMessage) -> DispatchResult {
        message.recipient_user_id = Some(user_id.to_string());
        let decision = RoutingDecision::dynamic(DIRECT_USER_STRATEGY, vec![user_queue_target(user_id)]);
        self.execute(message, Some(decision), DispatchType::Normal, 0, true)
            .await
    }

    /// 投递给多个用户，每个用户一个目标（重复用户只投递一次）
    #[instrument(skip(self, user_ids, message), fields(users = user_ids.len()))]
    pub async fn send_to_users(&self, user_ids: &[String], message: RealtimeMessage) -> DispatchResult {
        let mut seen = HashSet::new();
        let targets: Vec<String> = user_ids
            .iter()
            .filter(|user_id| seen.insert(user_id.as_str()))
            .map(|user_id| user_queue_target(user_id))
            .collect();
        let decision = RoutingDecision::dynamic(DIRECT_USER_STRATEGY, targets);
        self.execute(message, Some(decision), DispatchType::Normal, 0, true)
            .await
    }

    /// 广播到指定主题
    #[instrument(skip(self, message), fields(topic = %topic))]
    pub async fn send_to_topic(&self, topic: &str, message: RealtimeMessage) -> DispatchResult {
        let decision = RoutingDecision::dynamic(EXPLICIT_TOPIC_STRATEGY, vec![topic.to_string()]);
        self.execute(message, Some(decision), DispatchType::Normal, 0, true)
            .await
    }

    /// 全局广播：系统主题 + 每个在线用户的直达队列
    ///
    /// 同时订阅了系统主题的会话会收到两份。
    #[instrument(skip(self, message))]
    pub async fn global_broadcast(&self, message: RealtimeMessage) -> DispatchResult {
        let mut targets = vec![self.broadcast_topic.clone()];
        targets.extend(
            self.connections
                .get_all_online_user_ids()
                .await
                .iter()
                .map(|user_id| user_queue_target(user_id)),
        );
        let decision = RoutingDecision::dynamic(GLOBAL_BROADCAST_STRATEGY, targets);
        self.execute(message, Some(decision), DispatchType::Normal, 0, true)
            .await
    }

    /// 聚合投递：同一显式接收人的多条消息合并为一个信封
    ///
    /// 没有显式接收人的消息逐条普通投递。返回结果与分组顺序一致。
    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    pub async fn dispatch_aggregated(&self, messages: Vec<RealtimeMessage>) -> Vec<DispatchResult> {
        let mut groups: Vec<(Option<String>, Vec<RealtimeMessage>)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for message in messages {
            match message.recipient_user_id.clone() {
                Some(user_id) => match positions.get(&user_id) {
                    Some(&position) => groups[position].1.push(message),
                    None => {
                        positions.insert(user_id.clone(), groups.len());
                        groups.push((Some(user_id), vec![message]));
                    }
                },
                None => groups.push((None, vec![message])),
            }
        }

        let mut results = Vec::with_capacity(groups.len());
        for (recipient, mut group) in groups {
            let result = match recipient {
                Some(user_id) if group.len() > 1 => {
                    let count = group.len();
                    let envelope = aggregate_envelope(&user_id, group);
                    self.execute(envelope, None, DispatchType::Aggregated, count, true)
                        .await
                }
                _ => match group.pop() {
                    Some(message) => self.dispatch(message).await,
                    None => continue,
                },
            };
            results.push(result);
        }
        results
    }

    async fn execute(
        &self,
        mut message: RealtimeMessage,
        decision: Option<RoutingDecision>,
        dispatch_type: DispatchType,
        aggregated_count: usize,
        persist: bool,
    ) -> DispatchResult {
        message.enrich();
        let message_id = message.id().to_string();
        let mut accumulator = DispatchAccumulator::new(message_id.clone(), dispatch_type);
        accumulator.set_aggregated_count(aggregated_count);

        let decision = match decision {
            Some(decision) => Ok(decision),
            None => self.routing.route(&message),
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "dispatch failed at routing");
                let result = DispatchResult::failed(message_id, accumulator.start_time(), err.to_string());
                self.observe(&result);
                if persist {
                    self.persist_in_background(message, result.clone());
                }
                return result;
            }
        };

        accumulator.set_routing(&decision.strategy, decision.used_fallback);
        if decision.used_fallback {
            self.metrics.routing_fallback_total.inc();
        }

        let mut headers = message.headers.clone();
        headers.insert(
            MESSAGE_TYPE_HEADER.to_string(),
            message.message_type.as_str().to_string(),
        );
        if aggregated_count > 0 {
            headers.insert(AGGREGATED_COUNT_HEADER.to_string(), aggregated_count.to_string());
        }
        let body = serde_json::to_value(&message).unwrap_or_else(|err| {
            warn!(message_id = %message_id, error = %err, "failed to encode envelope, sending payload only");
            message.payload.clone()
        });

        let accumulator_ref = &accumulator;
        let headers_ref = &headers;
        let body_ref = &body;
        let message_id_ref = message_id.as_str();
        stream::iter(decision.target_topics.into_iter().enumerate())
            .map(|(index, target)| async move {
                let frame = ServerFrame::message(
                    target.as_str(),
                    message_id_ref,
                    headers_ref.clone(),
                    body_ref.clone(),
                );
                let outcome = self.deliver(&target, frame).await;
                if let TargetOutcome::Failed(reason) = &outcome {
                    debug!(message_id = %message_id_ref, target = %target, reason = %reason, "target delivery failed");
                }
                accumulator_ref.record(index, &target, outcome);
            })
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<()>>()
            .await;

        let result = accumulator.finish();
        self.observe(&result);
        info!(
            message_id = %result.message_id(),
            strategy = result.routing_strategy().unwrap_or_default(),
            used_fallback = result.used_fallback_routing(),
            success = result.success_count(),
            failure = result.failure_count(),
            skipped = result.skipped_targets().len(),
            "message dispatched"
        );
        if persist {
            self.persist_in_background(message, result.clone());
        }
        result
    }

    async fn deliver(&self, target: &str, frame: ServerFrame) -> TargetOutcome {
        let destination = match Destination::parse(target) {
            Ok(destination) => destination,
            Err(err) => return TargetOutcome::Failed(err.to_string()),
        };

        match destination.kind() {
            DestinationKind::UserQueue { user_id } => self.deliver_to_user(user_id, frame).await,
            DestinationKind::Application => {
                TargetOutcome::Failed("application destinations are not deliverable".to_string())
            }
            _ => self.deliver_to_topic(destination.as_str(), frame),
        }
    }

    async fn deliver_to_user(&self, user_id: &str, frame: ServerFrame) -> TargetOutcome {
        if !self.connections.is_user_online(user_id).await {
            return TargetOutcome::Skipped("user offline".to_string());
        }

        let delivery = self.connections.send_to_user(user_id, &frame).await;
        if !delivery.delivered.is_empty() {
            return TargetOutcome::Delivered(delivery.delivered.len());
        }
        if delivery.is_offline() {
            // 在线检查与发送之间会话全部断开
            return TargetOutcome::Skipped("user went offline".to_string());
        }
        let reasons: Vec<String> = delivery
            .failed
            .into_iter()
            .map(|(session_id, reason)| format!("{}: {}", session_id, reason))
            .collect();
        TargetOutcome::Failed(reasons.join("; "))
    }

    fn deliver_to_topic(&self, topic: &str, frame: ServerFrame) -> TargetOutcome {
        let subscribers = self.routing.subscribers(topic);
        if subscribers.is_empty() {
            return TargetOutcome::Delivered(0);
        }

        let mut delivered = 0;
        let mut last_error = None;
        for subscription in &subscribers {
            match self
                .connections
                .send_to_session(&subscription.session_id, frame.clone())
            {
                Ok(()) => {
                    delivered += 1;
                    self.routing
                        .index()
                        .consume_temporary(&subscription.session_id, topic);
                }
                Err(err) => last_error = Some(err.to_string()),
            }
        }

        match (delivered, last_error) {
            (0, Some(err)) => TargetOutcome::Failed(format!(
                "all {} subscribers failed, last error: {}",
                subscribers.len(),
                err
            )),
            (n, _) => TargetOutcome::Delivered(n),
        }
    }

    fn observe(&self, result: &DispatchResult) {
        self.metrics
            .dispatch_total
            .with_label_values(&[result.dispatch_type().as_str()])
            .inc();
        self.metrics
            .dispatch_target_failures_total
            .inc_by(result.failure_count() as u64);
        let seconds = result.duration().num_microseconds().unwrap_or(0) as f64 / 1_000_000.0;
        self.metrics.dispatch_duration_seconds.observe(seconds.max(0.0));
    }

    /// 异步持久化，失败只记录日志
    pub(crate) fn persist_in_background(&self, message: RealtimeMessage, result: DispatchResult) {
        let persistence = self.persistence.clone();
        tokio::spawn(async move {
            if let Err(err) = persistence.persist(&message, &result).await {
                warn!(
                    message_id = %result.message_id(),
                    error = %err,
                    "failed to persist dispatched message"
                );
            }
        });
    }

    pub fn metrics(&self) -> &Arc<RealtimeMetrics> {
        &self.metrics
    }
}

fn user_queue_target(user_id: &str) -> String {
    format!("/queue/user/{}/messages", user_id)
}

fn aggregate_envelope(user_id: &str, messages: Vec<RealtimeMessage>) -> RealtimeMessage {
    let message_type = match messages.first() {
        Some(first) if messages.iter().all(|m| m.message_type == first.message_type) => {
            first.message_type.clone()
        }
        _ => MessageType::Custom("AGGREGATED".to_string()),
    };
    let organization_id = messages.iter().find_map(|m| m.organization_id.clone());
    let payloads: Vec<serde_json::Value> = messages.into_iter().map(|m| m.payload).collect();

    let mut envelope = RealtimeMessage::new(message_type, serde_json::Value::Array(payloads))
        .with_recipient(user_id);
    envelope.organization_id = organization_id;
    envelope.timestamp = Some(Utc::now());
    envelope
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::RoutingConfig;
    use crate::domain::model::{ClientIdentity, ClientInfo, Subscription, SubscriptionLevel};
    use crate::domain::service::connection_manager::ConnectionHandle;
    use crate::domain::service::session_directory::SessionDirectory;
    use crate::domain::service::subscriber_index::SubscriberIndex;
    use crate::infrastructure::persistence::{DiscardingMessageArchive, InMemorySessionStore};

    struct Fixture {
        dispatcher: MessageDispatcher,
        connections: Arc<ConnectionManager>,
        index: Arc<SubscriberIndex>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemorySessionStore::new());
        let directory = Arc::new(SessionDirectory::new(
            store,
            "test",
            Duration::from_secs(60),
            Duration::from_millis(200),
        ));
        let metrics = Arc::new(RealtimeMetrics::standalone());
        let connections = Arc::new(ConnectionManager::new(
            "node-a",
            directory,
            None,
            metrics.clone(),
        ));
        let index = Arc::new(SubscriberIndex::new());
        let routing = Arc::new(RoutingEngine::new(&RoutingConfig::default(), index.clone()));
        let dispatcher = MessageDispatcher::new(
            routing,
            connections.clone(),
            Arc::new(DiscardingMessageArchive),
            metrics,
            &DispatchConfig::default(),
        );
        Fixture {
            dispatcher,
            connections,
            index,
        }
    }

    fn subscribe(index: &SubscriberIndex, session_id: &str, topic: &str, level: SubscriptionLevel) {
        index.add(Subscription {
            user_id: "U1".to_string(),
            session_id: session_id.to_string(),
            topic: topic.to_string(),
            level,
            subscribed_at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn test_send_to_offline_user_is_skipped() {
        let fixture = fixture();
        let message = RealtimeMessage::new(MessageType::UserNotification, serde_json::json!({}));
        let result = fixture.dispatcher.send_to_user("U1", message).await;
        assert_eq!(result.success_count(), 0);
        assert_eq!(result.failure_count(), 0);
        assert_eq!(result.skipped_targets(), &["/queue/user/U1/messages".to_string()]);
    }

    #[tokio::test]
    async fn test_topic_partial_failure() {
        let fixture = fixture();
        let identity = ClientIdentity::new("U1", "O1");
        let (h1, mut rx1) = ConnectionHandle::channel("S1", 4);
        let (h2, rx2) = ConnectionHandle::channel("S2", 4);
        fixture
            .connections
            .register_connection("S1", &identity, &ClientInfo::default(), h1)
            .await
            .unwrap();
        fixture
            .connections
            .register_connection("S2", &identity, &ClientInfo::default(), h2)
            .await
            .unwrap();
        drop(rx2);

        subscribe(&fixture.index, "S1", "/topic/global/a", SubscriptionLevel::Global);
        subscribe(&fixture.index, "S2", "/topic/global/b", SubscriptionLevel::Global);

        let message = RealtimeMessage::new(MessageType::SystemNotice, serde_json::json!({}));
        let a = fixture.dispatcher.send_to_topic("/topic/global/a", message.clone()).await;
        let b = fixture.dispatcher.send_to_topic("/topic/global/b", message).await;

        assert_eq!(a.success_count(), 1);
        assert!(rx1.try_recv().is_ok());
        assert_eq!(b.failure_count(), 1);
        assert!(b.failed_topics().contains_key("/topic/global/b"));
    }

    #[tokio::test]
    async fn test_topic_subscriber_with_vanished_session() {
        let fixture = fixture();
        let identity = ClientIdentity::new("U1", "O1");
        let (h1, _rx1) = ConnectionHandle::channel("S1", 4);
        let (h2, mut rx2) = ConnectionHandle::channel("S2", 4);
        fixture
            .connections
            .register_connection("S1", &identity, &ClientInfo::default(), h1)
            .await
            .unwrap();
        fixture
            .connections
            .register_connection("S2", &identity, &ClientInfo::default(), h2)
            .await
            .unwrap();
        subscribe(&fixture.index, "S1", "/topic/global/gone", SubscriptionLevel::Global);
        subscribe(&fixture.index, "S1", "/topic/global/mixed", SubscriptionLevel::Global);
        subscribe(&fixture.index, "S2", "/topic/global/mixed", SubscriptionLevel::Global);

        // 连接已移除，订阅索引尚未清理
        assert!(fixture.connections.remove_connection("S1").await.is_some());
        assert_eq!(fixture.index.subscriber_count("/topic/global/gone"), 1);

        let message = RealtimeMessage::new(MessageType::SystemNotice, serde_json::json!({}));
        let gone = fixture
            .dispatcher
            .send_to_topic("/topic/global/gone", message.clone())
            .await;
        assert_eq!(gone.success_count(), 0);
        assert_eq!(gone.failure_count(), 1);
        let reason = gone.failed_topics().get("/topic/global/gone").unwrap();
        assert!(reason.contains("Session not found: S1"));

        let mixed = fixture
            .dispatcher
            .send_to_topic("/topic/global/mixed", message)
            .await;
        assert_eq!(mixed.success_count(), 1);
        assert_eq!(mixed.failure_count(), 0);
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_temporary_subscription_consumed() {
        let fixture = fixture();
        let identity = ClientIdentity::new("U1", "O1");
        let (handle, mut rx) = ConnectionHandle::channel("S1", 4);
        fixture
            .connections
            .register_connection("S1", &identity, &ClientInfo::default(), handle)
            .await
            .unwrap();
        subscribe(&fixture.index, "S1", "/topic/commandTask/42/status", SubscriptionLevel::Temporary);

        let message = RealtimeMessage::new(MessageType::TaskCompleted, serde_json::json!({"ok": true}))
            .with_task("42");
        let result = fixture.dispatcher.dispatch(message.clone()).await;
        assert_eq!(result.routing_strategy(), Some("task-progress"));
        assert!(rx.try_recv().is_ok());
        assert!(!fixture.index.is_subscribed("S1", "/topic/commandTask/42/status"));

        fixture.dispatcher.dispatch(message).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_topic_counts_as_failure() {
        let fixture = fixture();
        let message = RealtimeMessage::new(MessageType::SystemNotice, serde_json::json!({}));
        let result = fixture.dispatcher.send_to_topic("/exchange/x", message).await;
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_aggregated_dispatch() {
        let fixture = fixture();
        let identity = ClientIdentity::new("U1", "O1");
        let (handle, mut rx) = ConnectionHandle::channel("S1", 4);
        fixture
            .connections
            .register_connection("S1", &identity, &ClientInfo::default(), handle)
            .await
            .unwrap();

        let messages = (0..3)
            .map(|i| {
                RealtimeMessage::new(MessageType::UserNotification, serde_json::json!({"n": i}))
                    .with_recipient("U1")
            })
            .collect();
        let results = fixture.dispatcher.dispatch_aggregated(messages).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dispatch_type(), DispatchType::Aggregated);
        assert_eq!(results[0].aggregated_message_count(), 3);
        assert_eq!(results[0].success_count(), 1);

        match rx.try_recv().unwrap() {
            ServerFrame::Message { body, headers, .. } => {
                assert_eq!(body["payload"].as_array().map(|a| a.len()), Some(3));
                assert_eq!(headers.get(AGGREGATED_COUNT_HEADER).map(String::as_str), Some("3"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

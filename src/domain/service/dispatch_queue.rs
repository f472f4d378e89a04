//! 投递队列
//!
//! 生产方入队后立即拿到 QUEUED 结果，后台 worker 逐条投递并按
//! `DispatchAction` 决定确认、重试、放弃或拒绝。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::domain::model::{DispatchAction, DispatchResult, RealtimeMessage, RoutingDecision};
use crate::domain::service::message_dispatcher::MessageDispatcher;

#[derive(Debug)]
struct QueuedMessage {
    message: RealtimeMessage,
    attempt: u32,
    /// 重试时只投递这些目标，首次投递为空
    retry_decision: Option<RoutingDecision>,
    /// 之前各次尝试合并后的结果
    previous: Option<DispatchResult>,
}

/// 队列中一条消息的最终处理结果
#[derive(Debug, Clone)]
pub struct QueueOutcome {
    pub message_id: String,
    pub action: DispatchAction,
    pub result: DispatchResult,
}

pub struct DispatchQueue {
    sender: mpsc::Sender<QueuedMessage>,
}

impl DispatchQueue {
    /// 创建队列并启动 worker
    ///
    /// `outcomes` 可选，用于观察每条消息的最终动作（Ack/Nack/Reject）。
    pub fn start(
        dispatcher: Arc<MessageDispatcher>,
        config: &DispatchConfig,
        outcomes: Option<mpsc::UnboundedSender<QueueOutcome>>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let worker = QueueWorker {
            dispatcher,
            retry_sender: sender.downgrade(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            outcomes,
        };
        let handle = tokio::spawn(worker.run(receiver));
        (Self { sender }, handle)
    }

    /// 入队，队列满或已关闭时返回 FAILED 结果
    pub fn enqueue(&self, mut message: RealtimeMessage) -> DispatchResult {
        message.enrich();
        let message_id = message.id().to_string();
        match self.sender.try_send(QueuedMessage {
            message,
            attempt: 1,
            retry_decision: None,
            previous: None,
        }) {
            Ok(()) => {
                debug!(message_id = %message_id, "message queued for dispatch");
                DispatchResult::queued(message_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(message_id = %message_id, "dispatch queue full");
                DispatchResult::failed(message_id, Utc::now(), "dispatch queue full")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(message_id = %message_id, "dispatch queue closed");
                DispatchResult::failed(message_id, Utc::now(), "dispatch queue closed")
            }
        }
    }
}

struct QueueWorker {
    dispatcher: Arc<MessageDispatcher>,
    /// 弱引用，所有 `DispatchQueue` 被释放后 worker 自然退出
    retry_sender: mpsc::WeakSender<QueuedMessage>,
    max_attempts: u32,
    retry_delay: Duration,
    outcomes: Option<mpsc::UnboundedSender<QueueOutcome>>,
}

impl QueueWorker {
    async fn run(self, mut receiver: mpsc::Receiver<QueuedMessage>) {
        info!("dispatch queue worker started");
        while let Some(queued) = receiver.recv().await {
            self.handle(queued).await;
        }
        info!("dispatch queue worker stopped");
    }

    async fn handle(&self, queued: QueuedMessage) {
        let QueuedMessage {
            message,
            attempt,
            retry_decision,
            previous,
        } = queued;
        let result = self
            .dispatcher
            .dispatch_attempt(message.clone(), retry_decision)
            .await;
        let result = match previous {
            Some(previous) => previous.merge_retry(result),
            None => result,
        };
        let action = DispatchAction::decide(&result, attempt, self.max_attempts, self.retry_delay);

        match &action {
            DispatchAction::Ack => {
                debug!(message_id = %result.message_id(), attempt, "queued message acknowledged");
            }
            DispatchAction::Retry { attempt: next, delay } => {
                debug!(
                    message_id = %result.message_id(),
                    attempt = *next,
                    delay_ms = delay.as_millis() as u64,
                    "queued message scheduled for retry"
                );
                let decision = RoutingDecision::dynamic(
                    result.routing_strategy().unwrap_or("retry"),
                    result.failed_targets(),
                );
                self.schedule_retry(
                    QueuedMessage {
                        message,
                        attempt: *next,
                        retry_decision: Some(decision),
                        previous: Some(result),
                    },
                    *delay,
                );
                return;
            }
            DispatchAction::Nack { reason } => {
                warn!(message_id = %result.message_id(), reason = %reason, "queued message gave up, handing to persistence");
            }
            DispatchAction::Reject { reason } => {
                warn!(message_id = %result.message_id(), reason = %reason, "queued message rejected");
            }
        }

        self.dispatcher
            .persist_in_background(message, result.clone());
        if let Some(outcomes) = &self.outcomes {
            let _ = outcomes.send(QueueOutcome {
                message_id: result.message_id().to_string(),
                action,
                result,
            });
        }
    }

    fn schedule_retry(&self, queued: QueuedMessage, delay: Duration) {
        let Some(sender) = self.retry_sender.upgrade() else {
            warn!(message_id = %queued.message.id(), "dispatch queue closed, retry dropped");
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let message_id = queued.message.id().to_string();
            if sender.send(queued).await.is_err() {
                warn!(message_id = %message_id, "dispatch queue closed before retry");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::domain::model::{
        ClientIdentity, ClientInfo, DispatchType, MessageType, Subscription, SubscriptionLevel,
    };
    use crate::domain::service::connection_manager::{ConnectionHandle, ConnectionManager};
    use crate::domain::service::routing_engine::RoutingEngine;
    use crate::domain::service::session_directory::SessionDirectory;
    use crate::domain::service::subscriber_index::SubscriberIndex;
    use crate::infrastructure::persistence::{DiscardingMessageArchive, InMemorySessionStore};
    use crate::metrics::RealtimeMetrics;

    fn build(
        config: &DispatchConfig,
    ) -> (Arc<MessageDispatcher>, Arc<ConnectionManager>, Arc<SubscriberIndex>) {
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
        let dispatcher = Arc::new(MessageDispatcher::new(
            routing,
            connections.clone(),
            Arc::new(DiscardingMessageArchive),
            metrics,
            config,
        ));
        (dispatcher, connections, index)
    }

    #[tokio::test]
    async fn test_enqueue_acknowledges_delivery() {
        let config = DispatchConfig::default();
        let (dispatcher, connections, _) = build(&config);
        let (handle, mut rx) = ConnectionHandle::channel("S1", 4);
        connections
            .register_connection("S1", &ClientIdentity::new("U1", "O1"), &ClientInfo::default(), handle)
            .await
            .unwrap();

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (queue, _worker) = DispatchQueue::start(dispatcher, &config, Some(outcome_tx));

        let message = RealtimeMessage::new(MessageType::UserNotification, serde_json::json!({}))
            .with_recipient("U1");
        let queued = queue.enqueue(message);
        assert_eq!(queued.dispatch_type(), DispatchType::Queued);

        let outcome = outcome_rx.recv().await.unwrap();
        assert_eq!(outcome.action, DispatchAction::Ack);
        assert_eq!(outcome.message_id, queued.message_id());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_then_nacked() {
        let config = DispatchConfig {
            max_attempts: 2,
            retry_delay_ms: 5,
            ..DispatchConfig::default()
        };
        let (dispatcher, connections, _) = build(&config);
        let (handle, rx) = ConnectionHandle::channel("S1", 4);
        connections
            .register_connection("S1", &ClientIdentity::new("U1", "O1"), &ClientInfo::default(), handle)
            .await
            .unwrap();
        drop(rx);

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (queue, _worker) = DispatchQueue::start(dispatcher, &config, Some(outcome_tx));
        queue.enqueue(
            RealtimeMessage::new(MessageType::UserNotification, serde_json::json!({}))
                .with_recipient("U1"),
        );

        let outcome = outcome_rx.recv().await.unwrap();
        assert!(matches!(outcome.action, DispatchAction::Nack { .. }));
        assert_eq!(outcome.result.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_only_redelivers_failed_targets() {
        let config = DispatchConfig {
            max_attempts: 3,
            retry_delay_ms: 5,
            ..DispatchConfig::default()
        };
        let (dispatcher, connections, index) = build(&config);

        let (live, mut live_rx) = ConnectionHandle::channel("S1", 8);
        connections
            .register_connection("S1", &ClientIdentity::new("U1", "O1"), &ClientInfo::default(), live)
            .await
            .unwrap();
        let (closed, closed_rx) = ConnectionHandle::channel("S2", 8);
        connections
            .register_connection("S2", &ClientIdentity::new("U2", "O1"), &ClientInfo::default(), closed)
            .await
            .unwrap();
        drop(closed_rx);

        for (session_id, user_id, topic) in [
            ("S1", "U1", "/topic/org/O1/tasks"),
            ("S2", "U2", "/topic/commandTask/42/status"),
        ] {
            index.add(Subscription {
                user_id: user_id.to_string(),
                session_id: session_id.to_string(),
                topic: topic.to_string(),
                level: SubscriptionLevel::Session,
                subscribed_at: Utc::now(),
            });
        }

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (queue, _worker) = DispatchQueue::start(dispatcher, &config, Some(outcome_tx));
        queue.enqueue(
            RealtimeMessage::new(MessageType::TaskProgress, serde_json::json!({"progress": 50}))
                .with_task("42")
                .with_organization("O1"),
        );

        let outcome = outcome_rx.recv().await.unwrap();
        assert!(matches!(outcome.action, DispatchAction::Nack { .. }));
        assert_eq!(outcome.result.success_count(), 1);
        assert_eq!(outcome.result.failure_count(), 1);
        assert_eq!(
            outcome.result.successful_topics(),
            &["/topic/org/O1/tasks".to_string()]
        );
        assert_eq!(
            outcome.result.failed_targets(),
            vec!["/topic/commandTask/42/status".to_string()]
        );

        // 成功的目标在三次尝试中只收到一次
        let mut received = 0;
        while live_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn test_worker_stops_when_queue_dropped() {
        let config = DispatchConfig::default();
        let (dispatcher, _, _) = build(&config);
        let (queue, worker) = DispatchQueue::start(dispatcher, &config, None);
        drop(queue);
        worker.await.unwrap();
    }
}

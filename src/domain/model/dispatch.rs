//! 投递结果
//!
//! `DispatchAccumulator` 在并发扇出期间以原子计数累积每个目标的结果，
//! `finish` 之后得到不可变的 `DispatchResult`。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// 投递类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchType {
    Normal,
    Aggregated,
    Queued,
    Failed,
}

impl DispatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchType::Normal => "normal",
            DispatchType::Aggregated => "aggregated",
            DispatchType::Queued => "queued",
            DispatchType::Failed => "failed",
        }
    }
}

/// 单个目标的投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// 已送达 n 个会话
    Delivered(usize),
    /// 用户离线，不计入成功或失败
    Skipped(String),
    Failed(String),
}

/// 队列消费后的处理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAction {
    /// 全部成功
    Ack,
    /// 部分失败，稍后重试
    Retry { attempt: u32, delay: Duration },
    /// 重试耗尽，交给持久化协作方做离线处理
    Nack { reason: String },
    /// 路由失败，不再重试
    Reject { reason: String },
}

impl DispatchAction {
    /// 根据投递结果决定动作
    pub fn decide(
        result: &DispatchResult,
        attempt: u32,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        if result.dispatch_type() == DispatchType::Failed {
            return DispatchAction::Reject {
                reason: result
                    .error_message()
                    .unwrap_or("routing failed")
                    .to_string(),
            };
        }
        if result.failure_count() == 0 {
            return DispatchAction::Ack;
        }
        if attempt < max_attempts {
            DispatchAction::Retry {
                attempt: attempt + 1,
                delay: retry_delay * attempt.max(1),
            }
        } else {
            DispatchAction::Nack {
                reason: format!(
                    "{} of {} targets failed after {} attempts",
                    result.failure_count(),
                    result.attempted_count(),
                    attempt
                ),
            }
        }
    }
}

/// 单条消息的投递结果
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    message_id: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    success_count: usize,
    failure_count: usize,
    successful_topics: Vec<String>,
    failed_topics: HashMap<String, String>,
    skipped_targets: Vec<String>,
    aggregated_message_count: usize,
    dispatch_type: DispatchType,
    used_fallback_routing: bool,
    routing_strategy: Option<String>,
    error_message: Option<String>,
}

impl DispatchResult {
    /// 路由彻底失败
    pub fn failed(
        message_id: impl Into<String>,
        start_time: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            start_time,
            end_time: Utc::now(),
            success_count: 0,
            failure_count: 0,
            successful_topics: Vec::new(),
            failed_topics: HashMap::new(),
            skipped_targets: Vec::new(),
            aggregated_message_count: 0,
            dispatch_type: DispatchType::Failed,
            used_fallback_routing: false,
            routing_strategy: None,
            error_message: Some(error.into()),
        }
    }

    /// 已进入投递队列
    pub fn queued(message_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            start_time: now,
            end_time: now,
            success_count: 0,
            failure_count: 0,
            successful_topics: Vec::new(),
            failed_topics: HashMap::new(),
            skipped_targets: Vec::new(),
            aggregated_message_count: 0,
            dispatch_type: DispatchType::Queued,
            used_fallback_routing: false,
            routing_strategy: None,
            error_message: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn success_count(&self) -> usize {
        self.success_count
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    /// 实际尝试过的目标数
    pub fn attempted_count(&self) -> usize {
        self.success_count + self.failure_count
    }

    pub fn successful_topics(&self) -> &[String] {
        &self.successful_topics
    }

    pub fn failed_topics(&self) -> &HashMap<String, String> {
        &self.failed_topics
    }

    pub fn skipped_targets(&self) -> &[String] {
        &self.skipped_targets
    }

    pub fn aggregated_message_count(&self) -> usize {
        self.aggregated_message_count
    }

    pub fn dispatch_type(&self) -> DispatchType {
        self.dispatch_type
    }

    pub fn used_fallback_routing(&self) -> bool {
        self.used_fallback_routing
    }

    pub fn routing_strategy(&self) -> Option<&str> {
        self.routing_strategy.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// 成功率，没有尝试任何目标时为 0
    pub fn success_rate(&self) -> f64 {
        let attempted = self.attempted_count();
        if attempted == 0 {
            return 0.0;
        }
        self.success_count as f64 / attempted as f64
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    pub fn is_complete_success(&self) -> bool {
        self.dispatch_type != DispatchType::Failed && self.failure_count == 0
    }

    /// 失败目标，按目标字符串排序
    pub fn failed_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.failed_topics.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// 合并一次只针对失败目标的重试结果
    ///
    /// 之前成功或跳过的目标保留，失败集合以重试结果为准。
    /// 路由信息和起始时间沿用首次尝试。
    pub fn merge_retry(mut self, retry: DispatchResult) -> DispatchResult {
        if retry.dispatch_type == DispatchType::Failed {
            self.end_time = retry.end_time;
            self.dispatch_type = DispatchType::Failed;
            self.error_message = retry.error_message;
            return self;
        }
        self.end_time = retry.end_time;
        self.success_count += retry.success_count;
        self.failure_count = retry.failure_count;
        self.successful_topics.extend(retry.successful_topics);
        self.failed_topics = retry.failed_topics;
        self.skipped_targets.extend(retry.skipped_targets);
        self
    }
}

/// 并发扇出期间的结果累加器
#[derive(Debug)]
pub struct DispatchAccumulator {
    message_id: String,
    start_time: DateTime<Utc>,
    dispatch_type: DispatchType,
    aggregated_message_count: usize,
    used_fallback_routing: bool,
    routing_strategy: Option<String>,
    success_count: AtomicUsize,
    failure_count: AtomicUsize,
    /// 目标序号 -> 目标，用于在完成时恢复路由顺序
    successful: DashMap<usize, String>,
    failed: DashMap<String, String>,
    skipped: DashMap<usize, String>,
}

impl DispatchAccumulator {
    pub fn new(message_id: impl Into<String>, dispatch_type: DispatchType) -> Self {
        Self {
            message_id: message_id.into(),
            start_time: Utc::now(),
            dispatch_type,
            aggregated_message_count: 0,
            used_fallback_routing: false,
            routing_strategy: None,
            success_count: AtomicUsize::new(0),
            failure_count: AtomicUsize::new(0),
            successful: DashMap::new(),
            failed: DashMap::new(),
            skipped: DashMap::new(),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn set_routing(&mut self, strategy: &str, used_fallback: bool) {
        self.routing_strategy = Some(strategy.to_string());
        self.used_fallback_routing = used_fallback;
    }

    pub fn set_aggregated_count(&mut self, count: usize) {
        self.aggregated_message_count = count;
    }

    /// 记录单个目标的结果（可并发调用）
    pub fn record(&self, index: usize, target: &str, outcome: TargetOutcome) {
        match outcome {
            TargetOutcome::Delivered(_) => {
                self.success_count.fetch_add(1, Ordering::Relaxed);
                self.successful.insert(index, target.to_string());
            }
            TargetOutcome::Failed(reason) => {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
                self.failed.insert(target.to_string(), reason);
            }
            TargetOutcome::Skipped(_) => {
                self.skipped.insert(index, target.to_string());
            }
        }
    }

    /// 标记完成，生成不可变结果
    pub fn finish(self) -> DispatchResult {
        let mut successful: Vec<(usize, String)> = self.successful.into_iter().collect();
        successful.sort_by_key(|(index, _)| *index);
        let mut skipped: Vec<(usize, String)> = self.skipped.into_iter().collect();
        skipped.sort_by_key(|(index, _)| *index);

        DispatchResult {
            message_id: self.message_id,
            start_time: self.start_time,
            end_time: Utc::now(),
            success_count: self.success_count.into_inner(),
            failure_count: self.failure_count.into_inner(),
            successful_topics: successful.into_iter().map(|(_, t)| t).collect(),
            failed_topics: self.failed.into_iter().collect(),
            skipped_targets: skipped.into_iter().map(|(_, t)| t).collect(),
            aggregated_message_count: self.aggregated_message_count,
            dispatch_type: self.dispatch_type,
            used_fallback_routing: self.used_fallback_routing,
            routing_strategy: self.routing_strategy,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_failure_accounting() {
        let acc = DispatchAccumulator::new("m1", DispatchType::Normal);
        let targets = ["/topic/a/1", "/topic/b/2", "/topic/c/3", "/topic/d/4"];
        acc.record(0, targets[0], TargetOutcome::Delivered(2));
        acc.record(1, targets[1], TargetOutcome::Failed("closed".to_string()));
        acc.record(2, targets[2], TargetOutcome::Delivered(1));
        acc.record(3, targets[3], TargetOutcome::Delivered(0));

        let result = acc.finish();
        assert_eq!(result.success_count() + result.failure_count(), 4);
        assert_eq!(result.success_rate(), 0.75);
        assert_eq!(
            result.successful_topics(),
            &["/topic/a/1".to_string(), "/topic/c/3".to_string(), "/topic/d/4".to_string()]
        );
        assert_eq!(
            result.failed_topics().get("/topic/b/2").map(String::as_str),
            Some("closed")
        );
        assert!(result.end_time() >= result.start_time());
    }

    #[test]
    fn test_skipped_targets_are_not_counted() {
        let acc = DispatchAccumulator::new("m2", DispatchType::Normal);
        acc.record(0, "/queue/user/U1/messages", TargetOutcome::Skipped("offline".into()));
        let result = acc.finish();
        assert_eq!(result.attempted_count(), 0);
        assert_eq!(result.success_rate(), 0.0);
        assert_eq!(result.skipped_targets().len(), 1);
        assert!(result.is_complete_success());
    }

    #[test]
    fn test_merge_retry_keeps_earlier_successes() {
        let first = DispatchAccumulator::new("m", DispatchType::Normal);
        first.record(0, "/topic/org/O1/tasks", TargetOutcome::Delivered(1));
        first.record(1, "/topic/commandTask/42/status", TargetOutcome::Failed("closed".into()));
        let first = first.finish();
        assert_eq!(first.failed_targets(), vec!["/topic/commandTask/42/status".to_string()]);

        let retry = DispatchAccumulator::new("m", DispatchType::Normal);
        retry.record(0, "/topic/commandTask/42/status", TargetOutcome::Delivered(1));
        let merged = first.merge_retry(retry.finish());

        assert_eq!(merged.success_count(), 2);
        assert_eq!(merged.failure_count(), 0);
        assert!(merged.failed_topics().is_empty());
        assert_eq!(
            merged.successful_topics(),
            &["/topic/org/O1/tasks".to_string(), "/topic/commandTask/42/status".to_string()]
        );
    }

    #[test]
    fn test_decide_action() {
        let delay = Duration::from_millis(100);

        let ok = DispatchAccumulator::new("m", DispatchType::Normal);
        ok.record(0, "/topic/global/x", TargetOutcome::Delivered(1));
        assert_eq!(DispatchAction::decide(&ok.finish(), 1, 3, delay), DispatchAction::Ack);

        let partial = DispatchAccumulator::new("m", DispatchType::Normal);
        partial.record(0, "/topic/global/x", TargetOutcome::Failed("x".into()));
        let partial = partial.finish();
        assert_eq!(
            DispatchAction::decide(&partial, 1, 3, delay),
            DispatchAction::Retry {
                attempt: 2,
                delay: Duration::from_millis(100)
            }
        );
        assert!(matches!(
            DispatchAction::decide(&partial, 3, 3, delay),
            DispatchAction::Nack { .. }
        ));

        let failed = DispatchResult::failed("m", Utc::now(), "no route");
        assert_eq!(
            DispatchAction::decide(&failed, 1, 3, delay),
            DispatchAction::Reject {
                reason: "no route".to_string()
            }
        );
    }
}

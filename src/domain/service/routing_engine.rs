//! 主题路由引擎
//!
//! 规则求值顺序：显式接收人 -> 动态规则（按注册顺序，首个产出目标的规则生效）
//! -> 静态兜底表。路由只做内存计算，不调用任何外部服务。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RoutingConfig;
use crate::domain::model::{MessageType, RealtimeMessage, RoutingDecision, Subscription};
use crate::domain::service::subscriber_index::SubscriberIndex;
use crate::domain::value_object::Destination;
use crate::error::{RealtimeError, Result};

pub const DIRECT_USER_STRATEGY: &str = "direct-user";

/// 动态路由规则
pub trait RoutingRule: Send + Sync {
    /// 规则标识，作为 `RoutingDecision::strategy`
    fn name(&self) -> &str;

    /// 返回目标主题；空集合表示该规则不适用
    fn route(&self, message: &RealtimeMessage) -> Result<Vec<String>>;
}

/// 任务进度/完成
pub struct TaskProgressRule;

impl RoutingRule for TaskProgressRule {
    fn name(&self) -> &str {
        "task-progress"
    }

    fn route(&self, message: &RealtimeMessage) -> Result<Vec<String>> {
        if !matches!(
            message.message_type,
            MessageType::TaskProgress | MessageType::TaskCompleted
        ) {
            return Ok(Vec::new());
        }
        let Some(task_id) = &message.task_id else {
            return Ok(Vec::new());
        };

        let mut targets = vec![format!("/topic/commandTask/{}/status", task_id)];
        if let Some(org_id) = &message.organization_id {
            targets.push(format!("/topic/org/{}/tasks", org_id));
        }
        Ok(targets)
    }
}

/// 设备告警/状态
pub struct DeviceEventRule;

impl RoutingRule for DeviceEventRule {
    fn name(&self) -> &str {
        "device-event"
    }

    fn route(&self, message: &RealtimeMessage) -> Result<Vec<String>> {
        let Some(terminal_id) = &message.terminal_id else {
            return Ok(Vec::new());
        };
        match message.message_type {
            MessageType::DeviceAlert => {
                let mut targets = vec![format!("/topic/terminal/{}/alerts", terminal_id)];
                if let Some(org_id) = &message.organization_id {
                    targets.push(format!("/topic/org/{}/alerts", org_id));
                }
                Ok(targets)
            }
            MessageType::DeviceStatus => {
                Ok(vec![format!("/topic/terminal/{}/status", terminal_id)])
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// 组织公告
pub struct OrgAnnouncementRule;

impl RoutingRule for OrgAnnouncementRule {
    fn name(&self) -> &str {
        "org-announcement"
    }

    fn route(&self, message: &RealtimeMessage) -> Result<Vec<String>> {
        match (&message.message_type, &message.organization_id) {
            (MessageType::OrgAnnouncement, Some(org_id)) => {
                Ok(vec![format!("/topic/org/{}/announcements", org_id)])
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// 系统通知
pub struct SystemNoticeRule;

impl RoutingRule for SystemNoticeRule {
    fn name(&self) -> &str {
        "system-notice"
    }

    fn route(&self, message: &RealtimeMessage) -> Result<Vec<String>> {
        if message.message_type == MessageType::SystemNotice {
            Ok(vec!["/topic/global/notices".to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}

/// 内置兜底表
fn builtin_fallback(message_type: &MessageType) -> Option<&'static str> {
    match message_type {
        MessageType::TaskProgress | MessageType::TaskCompleted => Some("/topic/commandTask/all"),
        MessageType::DeviceAlert | MessageType::DeviceStatus => {
            Some("/topic/global/device-events")
        }
        MessageType::OrgAnnouncement => Some("/topic/global/announcements"),
        MessageType::SystemNotice => Some("/topic/global/notices"),
        MessageType::UserNotification => Some("/topic/global/notifications"),
        MessageType::Custom(_) => None,
    }
}

pub struct RoutingEngine {
    rules: Vec<Box<dyn RoutingRule>>,
    fallback_overrides: HashMap<String, String>,
    default_topic: String,
    index: Arc<SubscriberIndex>,
}

impl RoutingEngine {
    /// 使用内置规则集创建
    pub fn new(config: &RoutingConfig, index: Arc<SubscriberIndex>) -> Self {
        Self {
            rules: vec![
                Box::new(TaskProgressRule),
                Box::new(DeviceEventRule),
                Box::new(OrgAnnouncementRule),
                Box::new(SystemNoticeRule),
            ],
            fallback_overrides: config.fallback.clone(),
            default_topic: config.default_topic.trim_end_matches('/').to_string(),
            index,
        }
    }

    /// 追加自定义规则（排在内置规则之后）
    pub fn with_rule(mut self, rule: Box<dyn RoutingRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// 计算路由决策
    ///
    /// 只有兜底表也无法给出合法目标时才返回错误。
    pub fn route(&self, message: &RealtimeMessage) -> Result<RoutingDecision> {
        if let Some(user_id) = &message.recipient_user_id {
            match Destination::user_queue(user_id) {
                Ok(queue) => {
                    return Ok(RoutingDecision::dynamic(
                        DIRECT_USER_STRATEGY,
                        vec![queue.as_str().to_string()],
                    ));
                }
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "explicit recipient is not addressable");
                }
            }
        }

        for rule in &self.rules {
            match self.evaluate(rule.as_ref(), message) {
                Ok(targets) if !targets.is_empty() => {
                    debug!(
                        message_type = %message.message_type,
                        strategy = rule.name(),
                        targets = targets.len(),
                        "dynamic routing matched"
                    );
                    return Ok(RoutingDecision::dynamic(rule.name(), targets));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        message_type = %message.message_type,
                        strategy = rule.name(),
                        error = %err,
                        "routing rule failed"
                    );
                }
            }
        }

        let topic = self.fallback_topic(&message.message_type);
        Destination::parse(&topic).map_err(|err| {
            RealtimeError::Routing(format!(
                "no route for message type {}: {}",
                message.message_type, err
            ))
        })?;
        debug!(message_type = %message.message_type, topic = %topic, "fallback routing used");
        Ok(RoutingDecision::fallback(vec![topic]))
    }

    fn evaluate(&self, rule: &dyn RoutingRule, message: &RealtimeMessage) -> Result<Vec<String>> {
        let targets = rule.route(message)?;
        for target in &targets {
            Destination::parse(target)?;
        }
        Ok(targets)
    }

    /// 兜底主题：配置覆盖 > 内置表 > `{default_topic}/{type}`
    pub fn fallback_topic(&self, message_type: &MessageType) -> String {
        if let Some(topic) = self.fallback_overrides.get(message_type.as_str()) {
            return topic.clone();
        }
        match builtin_fallback(message_type) {
            Some(topic) => topic.to_string(),
            None => format!("{}/{}", self.default_topic, message_type.as_str()),
        }
    }

    /// 主题当前的本地订阅者
    pub fn subscribers(&self, topic: &str) -> Vec<Subscription> {
        self.index.subscribers(topic)
    }

    pub fn index(&self) -> &Arc<SubscriberIndex> {
        &self.index
    }
}

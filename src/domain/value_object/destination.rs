//! Destination 值对象
//!
//! 主题路径语法：
//! - `/queue/user/{userId}/...`        点对点投递到用户的所有活跃会话
//! - `/topic/user/{userId}/...`        用户级主题
//! - `/topic/org/{orgId}/...`          组织级主题
//! - `/topic/terminal/{terminalId}/...` 终端（设备）级主题
//! - `/topic/global/...`               平台级主题
//! - `/topic/commandTask/...`          指令任务主题
//! - `/app/...`                        应用可寻址目的地（仅用于 SEND）
//!
//! 其余前缀一律拒绝。

use std::fmt;

use crate::domain::model::SubscriptionLevel;
use crate::error::{RealtimeError, Result};

pub const QUEUE_PREFIX: &str = "/queue/";
pub const TOPIC_USER_PREFIX: &str = "/topic/user/";
pub const TOPIC_ORG_PREFIX: &str = "/topic/org/";
pub const TOPIC_TERMINAL_PREFIX: &str = "/topic/terminal/";
pub const TOPIC_GLOBAL_PREFIX: &str = "/topic/global/";
pub const TOPIC_COMMAND_TASK_PREFIX: &str = "/topic/commandTask/";
pub const APP_PREFIX: &str = "/app/";

const MAX_DESTINATION_LEN: usize = 256;

/// 目的地类别
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationKind {
    /// 用户直达队列
    UserQueue { user_id: String },
    /// 用户主题
    UserTopic { user_id: String },
    /// 组织主题
    OrgTopic { org_id: String },
    /// 终端主题
    TerminalTopic { terminal_id: String },
    /// 平台主题
    GlobalTopic,
    /// 指令任务主题
    CommandTaskTopic,
    /// 应用目的地
    Application,
}

/// 解析后的目的地
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    path: String,
    kind: DestinationKind,
}

impl Destination {
    /// 解析目的地字符串
    pub fn parse(raw: &str) -> Result<Self> {
        let path = raw.trim();
        if path.is_empty() {
            return Err(RealtimeError::InvalidDestination(
                "destination cannot be empty".to_string(),
            ));
        }
        if path.len() > MAX_DESTINATION_LEN {
            return Err(RealtimeError::InvalidDestination(format!(
                "destination exceeds {} characters",
                MAX_DESTINATION_LEN
            )));
        }

        let kind = if let Some(rest) = path.strip_prefix(QUEUE_PREFIX) {
            let segments = split_segments(path, rest)?;
            match segments.as_slice() {
                ["user", user_id, ..] => DestinationKind::UserQueue {
                    user_id: (*user_id).to_string(),
                },
                _ => {
                    return Err(RealtimeError::InvalidDestination(format!(
                        "queue destination must address a user: {}",
                        path
                    )));
                }
            }
        } else if let Some(rest) = path.strip_prefix(TOPIC_USER_PREFIX) {
            DestinationKind::UserTopic {
                user_id: first_segment(path, rest)?,
            }
        } else if let Some(rest) = path.strip_prefix(TOPIC_ORG_PREFIX) {
            DestinationKind::OrgTopic {
                org_id: first_segment(path, rest)?,
            }
        } else if let Some(rest) = path.strip_prefix(TOPIC_TERMINAL_PREFIX) {
            DestinationKind::TerminalTopic {
                terminal_id: first_segment(path, rest)?,
            }
        } else if let Some(rest) = path.strip_prefix(TOPIC_GLOBAL_PREFIX) {
            split_segments(path, rest)?;
            DestinationKind::GlobalTopic
        } else if let Some(rest) = path.strip_prefix(TOPIC_COMMAND_TASK_PREFIX) {
            split_segments(path, rest)?;
            DestinationKind::CommandTaskTopic
        } else if let Some(rest) = path.strip_prefix(APP_PREFIX) {
            split_segments(path, rest)?;
            DestinationKind::Application
        } else {
            return Err(RealtimeError::InvalidDestination(format!(
                "unknown destination prefix: {}",
                path
            )));
        };

        Ok(Self {
            path: path.to_string(),
            kind,
        })
    }

    /// 构造用户直达队列地址
    pub fn user_queue(user_id: &str) -> Result<Self> {
        Self::parse(&format!("{}user/{}/messages", QUEUE_PREFIX, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &DestinationKind {
        &self.kind
    }

    /// 是否为点对点队列
    pub fn is_direct(&self) -> bool {
        matches!(self.kind, DestinationKind::UserQueue { .. })
    }

    /// 是否可作为订阅目标（应用目的地只能用于 SEND）
    pub fn is_subscribable(&self) -> bool {
        !matches!(self.kind, DestinationKind::Application)
    }

    /// 是否为应用可寻址目的地
    pub fn is_application(&self) -> bool {
        matches!(self.kind, DestinationKind::Application)
    }

    /// 直达队列的目标用户
    pub fn direct_user(&self) -> Option<&str> {
        match &self.kind {
            DestinationKind::UserQueue { user_id } => Some(user_id),
            _ => None,
        }
    }

    /// 按前缀规则计算订阅级别
    pub fn subscription_level(&self) -> Option<SubscriptionLevel> {
        match self.kind {
            DestinationKind::GlobalTopic => Some(SubscriptionLevel::Global),
            DestinationKind::UserTopic { .. } | DestinationKind::OrgTopic { .. } => {
                Some(SubscriptionLevel::Persistent)
            }
            DestinationKind::TerminalTopic { .. } | DestinationKind::UserQueue { .. } => {
                Some(SubscriptionLevel::Session)
            }
            DestinationKind::CommandTaskTopic => Some(SubscriptionLevel::Temporary),
            DestinationKind::Application => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl AsRef<str> for Destination {
    fn as_ref(&self) -> &str {
        &self.path
    }
}

/// 校验单个路径段
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

fn split_segments<'a>(path: &str, rest: &'a str) -> Result<Vec<&'a str>> {
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.iter().any(|s| !is_valid_segment(s)) {
        return Err(RealtimeError::InvalidDestination(format!(
            "malformed destination path: {}",
            path
        )));
    }
    Ok(segments)
}

fn first_segment(path: &str, rest: &str) -> Result<String> {
    let segments = split_segments(path, rest)?;
    // split 至少返回一个元素，且已经通过了非空校验
    Ok(segments[0].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_prefixes() {
        let d = Destination::parse("/topic/user/U1/notifications").unwrap();
        assert_eq!(
            d.kind(),
            &DestinationKind::UserTopic {
                user_id: "U1".to_string()
            }
        );

        let d = Destination::parse("/topic/org/O1/announcements").unwrap();
        assert_eq!(
            d.kind(),
            &DestinationKind::OrgTopic {
                org_id: "O1".to_string()
            }
        );

        let d = Destination::parse("/topic/terminal/T-9/status").unwrap();
        assert_eq!(d.subscription_level(), Some(SubscriptionLevel::Session));

        let d = Destination::parse("/topic/global/notices").unwrap();
        assert_eq!(d.subscription_level(), Some(SubscriptionLevel::Global));

        let d = Destination::parse("/topic/commandTask/42/status").unwrap();
        assert_eq!(d.subscription_level(), Some(SubscriptionLevel::Temporary));
    }

    #[test]
    fn test_user_queue() {
        let d = Destination::user_queue("U1").unwrap();
        assert_eq!(d.as_str(), "/queue/user/U1/messages");
        assert!(d.is_direct());
        assert_eq!(d.direct_user(), Some("U1"));
    }

    #[test]
    fn test_reject_unknown_and_malformed() {
        assert!(Destination::parse("/exchange/amq.topic").is_err());
        assert!(Destination::parse("/topic/other/x").is_err());
        assert!(Destination::parse("/topic/user//notifications").is_err());
        assert!(Destination::parse("/topic/user/U1/").is_err());
        assert!(Destination::parse("/topic/global/*").is_err());
        assert!(Destination::parse("/queue/orders").is_err());
        assert!(Destination::parse("").is_err());
    }

    #[test]
    fn test_application_destination_is_not_subscribable() {
        let d = Destination::parse("/app/chat.send").unwrap();
        assert!(d.is_application());
        assert!(!d.is_subscribable());
        assert_eq!(d.subscription_level(), None);
    }
}

//! 路由决策

/// 单条出站消息的路由决策（不持久化）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub target_topics: Vec<String>,
    /// 产生该决策的规则集标识
    pub strategy: String,
    pub used_fallback: bool,
}

impl RoutingDecision {
    pub fn dynamic(strategy: impl Into<String>, target_topics: Vec<String>) -> Self {
        Self {
            target_topics,
            strategy: strategy.into(),
            used_fallback: false,
        }
    }

    pub fn fallback(target_topics: Vec<String>) -> Self {
        Self {
            target_topics,
            strategy: "fallback".to_string(),
            used_fallback: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_topics.is_empty()
    }
}

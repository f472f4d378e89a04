//! 订阅者索引
//!
//! topic -> (session_id -> Subscription) 以及 session_id -> topics 的反向索引，
//! 路由引擎和订阅管理共享同一份索引。

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

use crate::domain::model::{Subscription, SubscriptionLevel};

#[derive(Debug, Default)]
pub struct SubscriberIndex {
    topics: DashMap<String, HashMap<String, Subscription>>,
    sessions: DashMap<String, HashSet<String>>,
}

impl SubscriberIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加订阅，已存在时返回 false（保留原订阅）
    pub fn add(&self, subscription: Subscription) -> bool {
        let session_id = subscription.session_id.clone();
        let topic = subscription.topic.clone();

        let inserted = {
            let mut subscribers = self.topics.entry(topic.clone()).or_default();
            if subscribers.contains_key(&session_id) {
                false
            } else {
                subscribers.insert(session_id.clone(), subscription);
                true
            }
        };

        if inserted {
            self.sessions.entry(session_id).or_default().insert(topic);
        }
        inserted
    }

    /// 移除单个订阅
    pub fn remove(&self, session_id: &str, topic: &str) -> Option<Subscription> {
        let removed = self
            .topics
            .get_mut(topic)
            .and_then(|mut subscribers| subscribers.remove(session_id));
        self.topics
            .remove_if(topic, |_, subscribers| subscribers.is_empty());

        if removed.is_some() {
            if let Some(mut topics) = self.sessions.get_mut(session_id) {
                topics.remove(topic);
            }
            self.sessions
                .remove_if(session_id, |_, topics| topics.is_empty());
        }
        removed
    }

    /// 移除会话的全部订阅，不影响同一用户的其它会话
    pub fn remove_session(&self, session_id: &str) -> Vec<Subscription> {
        let Some((_, topics)) = self.sessions.remove(session_id) else {
            return Vec::new();
        };

        let mut removed = Vec::with_capacity(topics.len());
        for topic in topics {
            if let Some(subscription) = self
                .topics
                .get_mut(&topic)
                .and_then(|mut subscribers| subscribers.remove(session_id))
            {
                removed.push(subscription);
            }
            self.topics
                .remove_if(&topic, |_, subscribers| subscribers.is_empty());
        }
        removed
    }

    /// 主题的当前订阅者
    pub fn subscribers(&self, topic: &str) -> Vec<Subscription> {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, session_id: &str, topic: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|topics| topics.contains(topic))
    }

    /// 会话已订阅的主题（排序后返回）
    pub fn session_topics(&self, session_id: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .sessions
            .get(session_id)
            .map(|topics| topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// 投递成功后调用：一次性订阅在首次投递后移除
    pub fn consume_temporary(&self, session_id: &str, topic: &str) -> bool {
        let is_temporary = self
            .topics
            .get(topic)
            .and_then(|subscribers| {
                subscribers
                    .get(session_id)
                    .map(|s| s.level == SubscriptionLevel::Temporary)
            })
            .unwrap_or(false);

        is_temporary && self.remove(session_id, topic).is_some()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

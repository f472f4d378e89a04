//! 连接/会话管理
//!
//! 本地注册表只保存本节点拥有的连接，是"连接是否在本节点存活"的权威来源；
//! 会话存储是"用户是否在任意节点在线"的权威来源。

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::model::{ClientIdentity, ClientInfo, ServerFrame, Session};
use crate::domain::repository::NodeRelay;
use crate::domain::service::session_directory::SessionDirectory;
use crate::error::{RealtimeError, Result};
use crate::metrics::RealtimeMetrics;

/// 连接下行句柄
///
/// 每个连接的执行上下文持有对应的 `Receiver`，把帧写到底层传输。
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    session_id: String,
    sender: mpsc::Sender<ServerFrame>,
}

impl ConnectionHandle {
    /// 创建有界下行通道
    pub fn channel(
        session_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                session_id: session_id.into(),
                sender,
            },
            receiver,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 非阻塞写入，缓冲区满或连接已关闭视为投递失败
    pub fn send(&self, frame: ServerFrame) -> Result<()> {
        self.sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RealtimeError::Delivery(format!(
                "outbound buffer full for session {}",
                self.session_id
            )),
            mpsc::error::TrySendError::Closed(_) => RealtimeError::Delivery(format!(
                "connection closed for session {}",
                self.session_id
            )),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Clone)]
struct LocalConnection {
    session: Session,
    handle: ConnectionHandle,
}

/// 在线状态（存储不可用时 `degraded = true`，结果只反映本节点）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnlineStatus {
    pub online: bool,
    pub degraded: bool,
}

/// 面向单个用户的投递结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDelivery {
    /// 已送达的会话
    pub delivered: Vec<String>,
    /// 投递失败的会话及原因
    pub failed: Vec<(String, String)>,
    /// 会话存储不可用，只尝试了本节点会话
    pub degraded: bool,
}

impl UserDelivery {
    /// 没有任何会话（用户离线）
    pub fn is_offline(&self) -> bool {
        self.delivered.is_empty() && self.failed.is_empty()
    }
}

pub struct ConnectionManager {
    node_id: String,
    directory: Arc<SessionDirectory>,
    /// session_id -> 本地连接
    connections: DashMap<String, LocalConnection>,
    /// user_id -> 本地 session_id 集合
    user_sessions: DashMap<String, HashSet<String>>,
    relay: Option<Arc<dyn NodeRelay>>,
    metrics: Arc<RealtimeMetrics>,
}

impl ConnectionManager {
    pub fn new(
        node_id: impl Into<String>,
        directory: Arc<SessionDirectory>,
        relay: Option<Arc<dyn NodeRelay>>,
        metrics: Arc<RealtimeMetrics>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            directory,
            connections: DashMap::new(),
            user_sessions: DashMap::new(),
            relay,
            metrics,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 注册连接
    ///
    /// 先写本地注册表，再镜像到会话存储。存储失败只记录告警，
    /// 会话保留在本地，由后台清理任务重新写回存储。
    /// 相同 session_id 重复注册时只刷新句柄和存储记录。
    pub async fn register_connection(
        &self,
        session_id: &str,
        identity: &ClientIdentity,
        client_info: &ClientInfo,
        handle: ConnectionHandle,
    ) -> Result<Session> {
        if session_id.is_empty() {
            return Err(RealtimeError::InvalidParameter(
                "session_id cannot be empty".to_string(),
            ));
        }
        if identity.user_id.is_empty() || identity.organization_id.is_empty() {
            return Err(RealtimeError::InvalidParameter(
                "identity must carry user_id and organization_id".to_string(),
            ));
        }

        let (session, is_new) = match self.connections.entry(session_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if existing.session.user_id != identity.user_id {
                    return Err(RealtimeError::InvalidParameter(format!(
                        "session {} already belongs to another user",
                        session_id
                    )));
                }
                existing.handle = handle;
                existing.session.refresh_heartbeat();
                (existing.session.clone(), false)
            }
            Entry::Vacant(vacant) => {
                let session = Session::connect(session_id, identity, client_info, &self.node_id);
                vacant.insert(LocalConnection {
                    session: session.clone(),
                    handle,
                });
                (session, true)
            }
        };

        if is_new {
            self.user_sessions
                .entry(session.user_id.clone())
                .or_default()
                .insert(session.session_id.clone());
            self.metrics.connections_active.inc();
            self.metrics.connections_accepted_total.inc();
        }

        if let Err(err) = self.directory.save_session(&session).await {
            warn!(
                session_id = %session_id,
                user_id = %session.user_id,
                error = %err,
                "failed to mirror session into store, keeping local registration"
            );
        } else if is_new {
            if let Err(err) = self.directory.increment_connection_counter().await {
                debug!(error = %err, "failed to increment connection counter");
            }
        }

        info!(
            session_id = %session_id,
            user_id = %session.user_id,
            organization_id = %session.organization_id,
            node_id = %self.node_id,
            reconnect = !is_new,
            "connection registered"
        );
        Ok(session)
    }

    /// 移除连接，重复调用返回 `None`
    pub async fn remove_connection(&self, session_id: &str) -> Option<Session> {
        let session = match self.connections.remove(session_id) {
            Some((_, connection)) => {
                self.detach_user_session(&connection.session.user_id, session_id);
                self.metrics.connections_active.dec();
                Some(connection.session)
            }
            // 本地不存在时，可能是其它节点遗留在存储中的会话
            None => match self.directory.load_session(session_id).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(session_id = %session_id, error = %err, "failed to look up session in store");
                    None
                }
            },
        }?;

        match self
            .directory
            .remove_session(session_id, &session.user_id, &session.organization_id)
            .await
        {
            Ok(remaining) => {
                info!(
                    session_id = %session_id,
                    user_id = %session.user_id,
                    remaining_sessions = remaining.len(),
                    "connection removed"
                );
            }
            Err(err) => {
                // 存储中的记录会随 TTL 过期
                warn!(
                    session_id = %session_id,
                    user_id = %session.user_id,
                    error = %err,
                    "failed to remove session from store"
                );
            }
        }
        Some(session)
    }

    fn detach_user_session(&self, user_id: &str, session_id: &str) {
        if let Some(mut sessions) = self.user_sessions.get_mut(user_id) {
            sessions.remove(session_id);
        }
        self.user_sessions
            .remove_if(user_id, |_, sessions| sessions.is_empty());
    }

    /// 心跳：刷新心跳与活动时间，并重写存储记录（延长 TTL）
    pub async fn touch_session(&self, session_id: &str) -> Result<()> {
        let session = {
            let mut connection = self
                .connections
                .get_mut(session_id)
                .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
            connection.session.refresh_heartbeat();
            connection.session.clone()
        };
        self.directory.touch_session(&session).await
    }

    /// 记录一次活动（不影响心跳超时判定）
    pub fn record_activity(&self, session_id: &str) -> bool {
        match self.connections.get_mut(session_id) {
            Some(mut connection) => {
                connection.session.record_activity();
                true
            }
            None => false,
        }
    }

    /// 用户是否在线
    pub async fn is_user_online(&self, user_id: &str) -> bool {
        self.online_status(user_id).await.online
    }

    /// 在线状态
    ///
    /// 本地有存活连接直接返回在线；否则查询会话存储。
    /// 存储不可用时退回本地结果并标记降级。
    pub async fn online_status(&self, user_id: &str) -> OnlineStatus {
        if self.has_local_session(user_id) {
            return OnlineStatus {
                online: true,
                degraded: false,
            };
        }
        match self.directory.is_user_online(user_id).await {
            Ok(online) => OnlineStatus {
                online,
                degraded: false,
            },
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "online status degraded to local registry");
                OnlineStatus {
                    online: false,
                    degraded: true,
                }
            }
        }
    }

    pub fn has_local_session(&self, user_id: &str) -> bool {
        self.user_sessions
            .get(user_id)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    /// 在线用户ID（本地 + 存储）
    pub async fn get_all_online_user_ids(&self) -> Vec<String> {
        let mut users: BTreeSet<String> = self
            .user_sessions
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        match self.directory.online_user_ids().await {
            Ok(remote) => users.extend(remote),
            Err(err) => {
                warn!(error = %err, "online user enumeration limited to local registry");
            }
        }
        users.into_iter().collect()
    }

    pub async fn get_online_user_count(&self) -> usize {
        self.get_all_online_user_ids().await.len()
    }

    pub fn local_session(&self, session_id: &str) -> Option<Session> {
        self.connections
            .get(session_id)
            .map(|connection| connection.session.clone())
    }

    pub fn local_sessions(&self) -> Vec<Session> {
        self.connections
            .iter()
            .map(|connection| connection.session.clone())
            .collect()
    }

    pub fn local_session_ids_for_user(&self, user_id: &str) -> Vec<String> {
        self.user_sessions
            .get(user_id)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn local_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// 写到本节点的单个会话
    ///
    /// 会话刚好断开时返回 `SessionNotFound`，由调用方按普通失败处理。
    pub fn send_to_session(&self, session_id: &str, frame: ServerFrame) -> Result<()> {
        let handle = self
            .connections
            .get(session_id)
            .map(|connection| connection.handle.clone())
            .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
        handle.send(frame)?;
        self.record_activity(session_id);
        Ok(())
    }

    /// 投递给用户的所有会话
    ///
    /// 本节点会话直接写入连接；其它节点的会话通过 `NodeRelay` 转发，
    /// 未配置转发时该会话记为失败。
    pub async fn send_to_user(&self, user_id: &str, frame: &ServerFrame) -> UserDelivery {
        let mut delivery = UserDelivery::default();

        let local_ids = self.local_session_ids_for_user(user_id);
        for session_id in &local_ids {
            match self.send_to_session(session_id, frame.clone()) {
                Ok(()) => delivery.delivered.push(session_id.clone()),
                Err(err) => delivery.failed.push((session_id.clone(), err.to_string())),
            }
        }

        let remote_sessions = match self.directory.user_sessions(user_id).await {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "remote sessions unavailable, local delivery only");
                delivery.degraded = true;
                Vec::new()
            }
        };

        for session in remote_sessions
            .into_iter()
            .filter(|s| !local_ids.contains(&s.session_id))
        {
            if session.is_owned_by(&self.node_id) {
                // 存储中残留的本节点会话，本地已不存在
                delivery
                    .failed
                    .push((session.session_id, "session no longer connected".to_string()));
                continue;
            }
            match &self.relay {
                Some(relay) => match relay.relay(&session.node_id, &session.session_id, frame).await {
                    Ok(()) => delivery.delivered.push(session.session_id),
                    Err(err) => delivery.failed.push((session.session_id, err.to_string())),
                },
                None => delivery.failed.push((
                    session.session_id,
                    format!("session owned by node {}", session.node_id),
                )),
            }
        }

        debug!(
            user_id = %user_id,
            delivered = delivery.delivered.len(),
            failed = delivery.failed.len(),
            "user delivery finished"
        );
        delivery
    }

    /// 心跳超时的本地会话ID（最多 `limit` 个）
    pub fn expired_session_ids(&self, timeout: chrono::Duration, limit: usize) -> Vec<String> {
        let now = Utc::now();
        self.connections
            .iter()
            .filter(|connection| {
                connection.session.is_expired(timeout, now) || connection.handle.is_closed()
            })
            .take(limit)
            .map(|connection| connection.key().clone())
            .collect()
    }

    /// 把本地存活会话重新写回存储，返回成功写入的数量
    pub async fn reassert_local_sessions(&self, limit: usize) -> usize {
        let sessions: Vec<Session> = self
            .connections
            .iter()
            .take(limit)
            .map(|connection| connection.session.clone())
            .collect();

        let mut restored = 0;
        for session in sessions {
            match self.directory.save_session(&session).await {
                Ok(()) => restored += 1,
                Err(err) => {
                    warn!(session_id = %session.session_id, error = %err, "failed to reassert session");
                    if err.is_timeout() {
                        break;
                    }
                }
            }
        }
        restored
    }
}

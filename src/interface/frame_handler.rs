//! 连接帧处理器
//!
//! 每个连接的执行上下文调用 `on_connect` 获得下行接收端，
//! 之后把每个上行帧交给 `handle_frame`，返回值是需要立即回给客户端的帧。

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::model::{ClientIdentity, ClientInfo, ServerFrame, Session, SubscriptionOutcome};
use crate::domain::repository::InboundMessageHandler;
use crate::domain::service::{ConnectionHandle, ConnectionManager, SubscriptionManager};
use crate::domain::value_object::Destination;
use crate::error::{RealtimeError, Result};
use crate::interface::frame::ClientFrame;

/// 连接建立结果
#[derive(Debug)]
pub struct ConnectionAccepted {
    pub session: Session,
    /// 下行帧接收端，由连接上下文写到传输层
    pub receiver: mpsc::Receiver<ServerFrame>,
    pub auto_subscribed: Vec<String>,
    pub restored: Vec<String>,
}

pub struct FrameHandler {
    connections: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionManager>,
    inbound: Option<Arc<dyn InboundMessageHandler>>,
    outbound_buffer: usize,
}

impl FrameHandler {
    pub fn new(
        connections: Arc<ConnectionManager>,
        subscriptions: Arc<SubscriptionManager>,
        inbound: Option<Arc<dyn InboundMessageHandler>>,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            connections,
            subscriptions,
            inbound,
            outbound_buffer,
        }
    }

    /// CONNECT：注册会话，自动订阅，恢复持久订阅
    pub async fn on_connect(
        &self,
        session_id: &str,
        identity: &ClientIdentity,
        client_info: &ClientInfo,
    ) -> Result<ConnectionAccepted> {
        let (handle, receiver) = ConnectionHandle::channel(session_id, self.outbound_buffer);
        let session = self
            .connections
            .register_connection(session_id, identity, client_info, handle)
            .await?;

        let auto_subscribed = self
            .subscriptions
            .perform_auto_subscription(identity, session_id);
        let restored = self
            .subscriptions
            .restore_persistent_subscriptions(identity, session_id)
            .await;

        info!(
            session_id = %session_id,
            user_id = %identity.user_id,
            auto_subscribed = auto_subscribed.len(),
            restored = restored.len(),
            "client connected"
        );
        Ok(ConnectionAccepted {
            session,
            receiver,
            auto_subscribed,
            restored,
        })
    }

    /// DISCONNECT 或传输层断开，可重复调用
    pub async fn on_disconnect(&self, session_id: &str) -> Option<Session> {
        if let Some(session) = self.connections.local_session(session_id) {
            self.subscriptions
                .cleanup_user_session_subscriptions(&session.identity(), session_id);
        }
        let removed = self.connections.remove_connection(session_id).await;
        if let Some(session) = &removed {
            info!(session_id = %session_id, user_id = %session.user_id, "client disconnected");
        }
        removed
    }

    /// 处理已建立连接上的帧
    pub async fn handle_frame(&self, session_id: &str, frame: ClientFrame) -> Result<Option<ServerFrame>> {
        debug!(session_id = %session_id, command = frame.command(), "frame received");

        if let ClientFrame::Disconnect = frame {
            self.on_disconnect(session_id).await;
            return Ok(None);
        }

        let identity = self
            .connections
            .local_session(session_id)
            .map(|session| session.identity())
            .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;

        match frame {
            ClientFrame::Connect { .. } => Ok(Some(ServerFrame::Error {
                message: "session already connected".to_string(),
            })),
            ClientFrame::Subscribe { id, destination } => {
                self.connections.record_activity(session_id);
                let outcome = self
                    .subscriptions
                    .handle_subscription(&identity, &destination, session_id)
                    .await;
                Ok(Some(subscription_reply(id, outcome)))
            }
            ClientFrame::Unsubscribe { id, destination } => {
                self.connections.record_activity(session_id);
                self.subscriptions
                    .handle_unsubscription(&identity, &destination, session_id)
                    .await;
                Ok(Some(ServerFrame::Receipt { receipt_id: id }))
            }
            ClientFrame::Send { destination, body } => {
                self.connections.record_activity(session_id);
                Ok(self.on_send(&identity, session_id, &destination, &body).await)
            }
            ClientFrame::Heartbeat => {
                if let Err(err) = self.connections.touch_session(session_id).await {
                    warn!(session_id = %session_id, error = %err, "failed to refresh session heartbeat");
                }
                Ok(None)
            }
            ClientFrame::Disconnect => Ok(None),
        }
    }

    async fn on_send(
        &self,
        identity: &ClientIdentity,
        session_id: &str,
        destination: &str,
        body: &str,
    ) -> Option<ServerFrame> {
        let is_application = Destination::parse(destination)
            .map(|d| d.is_application())
            .unwrap_or(false);
        if !is_application {
            warn!(
                session_id = %session_id,
                destination = %destination,
                "SEND rejected, destination is not application-addressable"
            );
            return Some(ServerFrame::Error {
                message: format!("destination {} does not accept SEND", destination),
            });
        }

        let Some(inbound) = &self.inbound else {
            return Some(ServerFrame::Error {
                message: "no application handler configured".to_string(),
            });
        };
        match inbound.on_message(identity, session_id, destination, body).await {
            Ok(()) => None,
            Err(err) => {
                warn!(session_id = %session_id, destination = %destination, error = %err, "inbound handler failed");
                Some(ServerFrame::Error {
                    message: err.to_string(),
                })
            }
        }
    }
}

fn subscription_reply(id: String, outcome: SubscriptionOutcome) -> ServerFrame {
    match outcome {
        SubscriptionOutcome::Granted { .. } => ServerFrame::Receipt { receipt_id: id },
        SubscriptionOutcome::Denied { topic, reason } => ServerFrame::Error {
            message: format!("subscription to {} denied: {:?}", topic, reason),
        },
        SubscriptionOutcome::Invalid { topic, reason } => ServerFrame::Error {
            message: format!("invalid subscription {}: {}", topic, reason),
        },
    }
}

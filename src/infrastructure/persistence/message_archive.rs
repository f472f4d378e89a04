//! 默认的消息持久化实现
//!
//! 长期存储由外部服务负责，这里只记录投递摘要。

use async_trait::async_trait;
use tracing::debug;

use crate::domain::model::{DispatchResult, RealtimeMessage};
use crate::domain::repository::MessagePersistence;
use crate::error::Result;

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingMessageArchive;

#[async_trait]
impl MessagePersistence for DiscardingMessageArchive {
    async fn persist(&self, message: &RealtimeMessage, result: &DispatchResult) -> Result<()> {
        debug!(
            message_id = %message.id(),
            message_type = %message.message_type,
            dispatch_type = result.dispatch_type().as_str(),
            success = result.success_count(),
            failure = result.failure_count(),
            "message persistence not configured, dropping archive record"
        );
        Ok(())
    }
}

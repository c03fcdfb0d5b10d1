//! `server_reply` consumer: hands each event to the session's connection

use async_trait::async_trait;
use std::sync::Arc;

use super::{Dispatch, Hub};
use crate::bus::{BusMessage, HandlerError, MessageHandler};
use crate::session::SessionKey;

/// Routes reply events to live connections by their partition key
pub struct ReplyRouter {
    hub: Arc<Hub>,
}

impl ReplyRouter {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl MessageHandler for ReplyRouter {
    async fn handle(&self, message: &BusMessage) -> Result<(), HandlerError> {
        let key = SessionKey::from_token(message.key_str())
            .ok_or_else(|| HandlerError::malformed("reply without a session key"))?;
        let payload = String::from_utf8(message.payload.clone()).map_err(HandlerError::malformed)?;

        match self.hub.dispatch(&key, payload) {
            Dispatch::Queued => {}
            Dispatch::Dropped => tracing::warn!(
                user_id = %key.user_id,
                chat_id = %key.chat_id,
                offset = message.offset,
                "Outbound queue full, reply dropped"
            ),
            Dispatch::NotConnected => tracing::trace!(
                user_id = %key.user_id,
                chat_id = %key.chat_id,
                "No connection for reply"
            ),
        }
        Ok(())
    }
}

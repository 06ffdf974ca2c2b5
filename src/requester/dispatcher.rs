//! Reply dispatcher: the client's single consumer on the broker's
//! direct-reply pseudo-queue.
//!
//! Requests are published on the dispatcher's channel (the broker only
//! routes direct replies back to the channel that consumes them), in
//! confirm mode so that mandatory messages the broker could not route come
//! back attached to their confirmation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use lapin::{
    message::BasicReturnMessage,
    options::{BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Consumer,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::pending::{PendingCall, PendingCalls, Settlement};
use crate::client::Client;
use crate::codec;
use crate::error::{Result, TemitError};

/// The broker's built-in direct-reply pseudo-queue.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

pub(crate) struct ReplyDispatcher {
    channel: Channel,
    replies: Arc<ReplyTable>,
}

/// Pending calls plus the failure that ended the reply path, if any.
#[derive(Default)]
pub(crate) struct ReplyTable {
    pending: Arc<PendingCalls>,
    failure: Mutex<Option<TemitError>>,
}

impl ReplyTable {
    /// Register a call. Fails once the reply path has died.
    pub fn register(&self, message_id: &str) -> Result<PendingCall> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(self.pending.register(message_id))
    }

    /// Hand one reply to its waiting call.
    ///
    /// A reply without a correlation id or with a malformed body means the
    /// reply path can no longer be trusted; the error is returned for the
    /// caller to `fail` with.
    pub fn route(&self, correlation_id: Option<&str>, body: &[u8]) -> Result<()> {
        let Some(correlation_id) = correlation_id else {
            return Err(TemitError::Protocol(
                "Received reply without correlation id".to_string(),
            ));
        };
        let outcome = codec::decode_reply(body).map_err(|e| {
            TemitError::Protocol(format!("Malformed reply for {}: {}", correlation_id, e))
        })?;
        if !self.pending.settle(correlation_id, Settlement::Reply(outcome)) {
            debug!(correlation_id = %correlation_id, "Discarding reply with no waiting call");
        }
        Ok(())
    }

    /// Settle a returned request.
    pub fn returned(&self, message_id: &str) -> bool {
        self.pending.settle(message_id, Settlement::Returned)
    }

    /// Fail every pending call and refuse new ones.
    pub fn fail(&self, error: TemitError) {
        *self.failure.lock() = Some(error.clone());
        self.pending.fail_all(error);
    }
}

impl ReplyDispatcher {
    /// Open the reply channel and start consuming replies.
    pub async fn start(client: &Client) -> Result<Arc<Self>> {
        let transport = client.transport().await?;

        let channel = transport
            .connection
            .create_channel()
            .await
            .map_err(|e| TemitError::Setup(format!("Failed to create reply channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TemitError::Setup(format!("Failed to enable confirms: {}", e)))?;

        let consumer_tag = format!("{}:replies:{}", client.name(), uuid::Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                DIRECT_REPLY_TO,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TemitError::Setup(format!("Failed to consume replies: {}", e)))?;

        let dispatcher = Arc::new(Self {
            channel,
            replies: Arc::new(ReplyTable::default()),
        });

        tokio::spawn(dispatch(
            consumer,
            dispatcher.replies.clone(),
            client.closing_flag(),
        ));

        info!(consumer_tag = %consumer_tag, "Reply dispatcher started");
        Ok(dispatcher)
    }

    /// Register a call. Fails if the reply path has died.
    pub fn register(&self, message_id: &str) -> Result<PendingCall> {
        self.replies.register(message_id)
    }

    /// Publish a mandatory request and wait for the broker's confirmation.
    ///
    /// An unroutable request settles its pending call as `Returned`.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| TemitError::Publish(format!("Failed to publish: {}", e)))?;

        match confirm
            .await
            .map_err(|e| TemitError::Publish(format!("Publish confirmation failed: {}", e)))?
        {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                self.on_return(*returned);
                Ok(())
            }
            Confirmation::Nack(None) => Err(TemitError::Publish(format!(
                "Broker rejected request to '{}'",
                routing_key
            ))),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }

    fn on_return(&self, returned: BasicReturnMessage) {
        let Some(message_id) = returned.delivery.properties.message_id().clone() else {
            warn!(
                reply_code = returned.reply_code,
                "Broker returned a message without id"
            );
            return;
        };
        debug!(
            message_id = %message_id,
            routing_key = %returned.delivery.routing_key,
            reply_text = %returned.reply_text,
            "Request returned unroutable"
        );
        self.replies.returned(message_id.as_str());
    }

    /// Fail every pending call and refuse new ones.
    pub fn shutdown(&self, error: TemitError) {
        self.replies.fail(error);
    }

    /// Shut down and close the reply channel.
    pub async fn stop(&self, error: TemitError) {
        self.shutdown(error);
        if let Err(e) = self.channel.close(200, "reply dispatcher stopped").await {
            debug!(error = %e, "Ignoring error closing reply channel");
        }
    }
}

/// Route each reply to its pending call by correlation id.
async fn dispatch(mut consumer: Consumer, replies: Arc<ReplyTable>, closing: Arc<AtomicBool>) {
    let error = loop {
        let delivery = match consumer.next().await {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => break TemitError::Transport(format!("Reply consumer error: {}", e)),
            None => break TemitError::Transport("Reply consumer cancelled by broker".to_string()),
        };
        let correlation_id = delivery.properties.correlation_id().as_ref();
        if let Err(e) = replies.route(correlation_id.map(|id| id.as_str()), &delivery.data) {
            break e;
        }
    };

    if closing.load(Ordering::SeqCst) {
        debug!(error = %error, "Reply consumer stopped during shutdown");
    } else {
        error!(error = %error, "Reply dispatcher failed");
    }
    replies.fail(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reply_settles_matching_call() {
        let replies = ReplyTable::default();
        let mut call = replies.register("m1").unwrap();

        replies.route(Some("m1"), br#"[null, {"ok": true}]"#).unwrap();

        match call.settled().await {
            Settlement::Reply(Ok(value)) => assert_eq!(value, json!({ "ok": true })),
            other => panic!("unexpected settlement: {:?}", other),
        }
    }

    #[test]
    fn test_reply_for_unknown_call_is_discarded() {
        let replies = ReplyTable::default();
        assert!(replies.route(Some("gone"), b"[null, 1]").is_ok());
        assert!(replies.register("next").is_ok());
    }

    #[tokio::test]
    async fn test_reply_without_correlation_id_is_fatal() {
        let replies = ReplyTable::default();
        let mut call = replies.register("m1").unwrap();

        let error = replies.route(None, b"[null, 1]").unwrap_err();
        assert!(matches!(error, TemitError::Protocol(_)));
        replies.fail(error);

        assert!(matches!(
            call.settled().await,
            Settlement::Failed(TemitError::Protocol(_))
        ));
        assert!(matches!(replies.register("m2"), Err(TemitError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_fatal() {
        let replies = ReplyTable::default();
        let mut call = replies.register("m1").unwrap();

        let error = replies.route(Some("m1"), b"not json").unwrap_err();
        assert!(matches!(error, TemitError::Protocol(_)));
        replies.fail(error);

        assert!(matches!(
            call.settled().await,
            Settlement::Failed(TemitError::Protocol(_))
        ));
        assert!(matches!(replies.register("m2"), Err(TemitError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_returned_request_settles_as_returned() {
        let replies = ReplyTable::default();
        let mut call = replies.register("m1").unwrap();

        assert!(replies.returned("m1"));
        assert!(matches!(call.settled().await, Settlement::Returned));
        assert!(!replies.returned("m1"));
    }
}

//! Endpoint: the answering side of request/reply.
//!
//! Consumes a shared queue named after the event, so several instances of
//! a service split the calls between them. Deliveries are consumed without
//! acknowledgement: a request in flight when the process dies is lost, and
//! its caller sees a timeout.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use tracing::{debug, warn};

use crate::client::{Client, WorkerPool};
use crate::codec::{self, CONTENT_TYPE};
use crate::config::ClientConfig;
use crate::consumer::{Consumer, DeliveryHandler, QueueSpec};
use crate::error::{Result, TemitError};
use crate::event::Event;
use crate::handler::Responder;
use crate::requester::MAX_PRIORITY;

/// Endpoint options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointOptions {
    /// Queue to consume. Defaults to the event name, which is what every
    /// Requester on the exchange routes to.
    pub queue: Option<String>,
    /// Requests handled at once. Requests are consumed without
    /// acknowledgement, so the cap is enforced locally. `None` is unlimited.
    pub prefetch: Option<u16>,
}

impl EndpointOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            queue: None,
            prefetch: config.default_prefetch(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }
}

/// Serves calls for one event.
pub struct Endpoint {
    consumer: Consumer,
}

struct EndpointHandler {
    event: String,
    responder: Responder,
    options: EndpointOptions,
    client: Client,
}

impl Endpoint {
    pub fn new(
        client: &Client,
        event: impl Into<String>,
        responder: Responder,
        options: EndpointOptions,
    ) -> Self {
        let event = event.into();
        let handler = Arc::new(EndpointHandler {
            event: event.clone(),
            responder,
            options,
            client: client.clone(),
        });
        Self {
            consumer: Consumer::new(client, event, handler),
        }
    }

    pub fn event(&self) -> &str {
        self.consumer.event()
    }

    /// Name of the consumed queue once open.
    pub fn queue(&self) -> Option<String> {
        self.consumer.queue()
    }

    /// Start serving. Idempotent; a failed attempt may be retried.
    pub async fn open(&self) -> Result<()> {
        self.consumer.open().await.map(|_| ())
    }

    /// Stop serving. The endpoint may be opened again later.
    pub async fn close(&self) -> Result<()> {
        self.consumer.close().await
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("event", &self.event())
            .field("queue", &self.queue())
            .finish()
    }
}

/// Queue shared by every instance serving `event`.
fn endpoint_queue(event: &str, options: &EndpointOptions) -> QueueSpec {
    let mut arguments = FieldTable::default();
    arguments.insert("x-max-priority".into(), AMQPValue::LongInt(MAX_PRIORITY.into()));

    QueueSpec {
        name: options.queue.clone().unwrap_or_else(|| event.to_string()),
        options: QueueDeclareOptions {
            durable: true,
            exclusive: false,
            auto_delete: true,
            ..Default::default()
        },
        arguments,
    }
}

#[async_trait]
impl DeliveryHandler for EndpointHandler {
    fn kind(&self) -> &'static str {
        "endpoint"
    }

    fn queue(&self) -> QueueSpec {
        endpoint_queue(&self.event, &self.options)
    }

    fn no_ack(&self) -> bool {
        true
    }

    fn prefetch(&self) -> Option<u16> {
        self.options.prefetch
    }

    async fn handle(&self, delivery: Delivery) {
        let Some(reply) = self.answer(&delivery).await else {
            return;
        };

        let Ok(transport) = self.client.transport().await else {
            debug!(event = %self.event, "Client closed before reply could be sent");
            return;
        };
        let sent = send_reply(&transport.pool, &reply.to, &reply.body, reply.properties).await;
        if let Err(e) = sent {
            if self.client.is_closing() {
                debug!(event = %self.event, error = %e, "Reply dropped during shutdown");
            } else {
                warn!(event = %self.event, error = %e, "Failed to send reply");
            }
        }
    }
}

/// A reply ready to publish.
#[derive(Debug)]
struct Reply {
    to: String,
    body: Vec<u8>,
    properties: BasicProperties,
}

impl EndpointHandler {
    /// Run the responder for one request and build its reply.
    ///
    /// `None` when there is nothing to send: the body could not be decoded
    /// (the request is dropped without running the responder) or the caller
    /// asked for no reply.
    async fn answer(&self, delivery: &Delivery) -> Option<Reply> {
        let arg = match codec::decode_args(&delivery.data) {
            Ok(arg) => arg,
            Err(e) => {
                warn!(
                    event = %self.event,
                    error = %e,
                    "Dropping request with undecodable body"
                );
                return None;
            }
        };

        let event = Event::incoming(delivery.routing_key.as_str(), &delivery.properties);
        let outcome = self.responder.respond(event.clone(), arg).await;

        let Some(reply_to) = delivery.properties.reply_to().clone() else {
            debug!(event = %self.event, message_id = %event.id(), "Request expects no reply");
            return None;
        };

        let body = match codec::encode_reply(&outcome) {
            Ok(body) => body,
            Err(e) => {
                warn!(event = %self.event, error = %e, "Failed to encode reply");
                return None;
            }
        };

        let mut properties = BasicProperties::default().with_content_type(CONTENT_TYPE.into());
        if let Some(correlation_id) = delivery.properties.correlation_id().clone() {
            properties = properties.with_correlation_id(correlation_id);
        }

        Some(Reply {
            to: reply_to.to_string(),
            body,
            properties,
        })
    }
}

/// Single-shot send of a reply on a pool worker.
async fn send_reply(
    pool: &WorkerPool,
    reply_to: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<()> {
    pool.run(|channel| async move {
        channel
            .basic_publish("", reply_to, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| TemitError::Publish(format!("Failed to publish reply: {}", e)))?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lapin::{acker::Acker, types::ShortString};
    use serde_json::json;

    use crate::requester::DIRECT_REPLY_TO;

    #[test]
    fn test_queue_defaults_to_event_name() {
        let spec = endpoint_queue("user.get", &EndpointOptions::default());
        assert_eq!(spec.name, "user.get");
        assert!(spec.options.durable);
        assert!(spec.options.auto_delete);
        assert!(!spec.options.exclusive);
        assert_eq!(
            spec.arguments.inner().get(&ShortString::from("x-max-priority")),
            Some(&AMQPValue::LongInt(10))
        );
    }

    #[test]
    fn test_queue_override() {
        let options = EndpointOptions::default().with_queue("user.get.v2");
        assert_eq!(endpoint_queue("user.get", &options).name, "user.get.v2");
    }

    fn handler(responder: Responder) -> EndpointHandler {
        let client = Client::new(ClientConfig::default().with_name("tests"));
        EndpointHandler {
            event: "user.get".to_string(),
            responder,
            options: EndpointOptions::default(),
            client,
        }
    }

    fn request(body: &[u8], properties: BasicProperties) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "temit".into(),
            routing_key: "user.get".into(),
            redelivered: false,
            properties,
            data: body.to_vec(),
            acker: Acker::default(),
        }
    }

    fn counting(calls: &Arc<AtomicUsize>) -> Responder {
        let calls = calls.clone();
        Responder::handler(move |_event: Event, arg: serde_json::Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Some(json!({ "echo": arg }))) }
        })
    }

    fn expecting_reply() -> BasicProperties {
        BasicProperties::default()
            .with_reply_to(DIRECT_REPLY_TO.into())
            .with_correlation_id("m1".into())
    }

    #[tokio::test]
    async fn test_reply_carries_correlation_id() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler(counting(&calls));

        let reply = handler
            .answer(&request(b"[7]", expecting_reply()))
            .await
            .expect("expected a reply");

        assert_eq!(reply.to, DIRECT_REPLY_TO);
        assert_eq!(
            reply.properties.correlation_id().as_ref().map(|id| id.as_str()),
            Some("m1")
        );
        assert_eq!(
            codec::decode_reply(&reply.body).unwrap(),
            Ok(json!({ "echo": 7 }))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecodable_request_is_dropped_without_reply() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler(counting(&calls));

        for body in [&b"not json"[..], &b"{\"a\": 1}"[..], &b"[1, 2]"[..]] {
            assert!(handler.answer(&request(body, expecting_reply())).await.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_without_reply_to_still_runs_responder() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler(counting(&calls));

        let reply = handler.answer(&request(b"[7]", BasicProperties::default())).await;

        assert!(reply.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_requests_are_consumed_without_ack() {
        let client = Client::new(ClientConfig::default().with_name("tests"));
        let handler = EndpointHandler {
            event: "user.get".to_string(),
            responder: Responder::data(serde_json::Value::Null),
            options: EndpointOptions::from_config(client.config()),
            client,
        };
        assert!(handler.no_ack());
        assert_eq!(handler.prefetch(), Some(48));
    }
}

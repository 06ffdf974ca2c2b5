//! Listener: the receiving side of publish/subscribe.
//!
//! Buffered listeners share a durable queue per (event, client, group), so
//! emissions wait for the group while it is offline and each one is handled
//! by a single member. Unbuffered listeners get a private, broker-named queue
//! that lives only as long as the consumer.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::{debug, warn};

use crate::client::Client;
use crate::codec;
use crate::config::ClientConfig;
use crate::consumer::{Consumer, DeliveryHandler, QueueSpec};
use crate::error::Result;
use crate::event::Event;
use crate::handler::Responder;

/// Listener options.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerOptions {
    /// Keep emissions in a durable queue while no member of the group is
    /// consuming.
    pub buffer: bool,
    /// Consumer group. Members of one group share the work; every group gets
    /// its own copy of each emission. Defaults to the client name.
    pub group: Option<String>,
    /// Unacknowledged deliveries in flight. `None` is unlimited.
    pub prefetch: Option<u16>,
    /// Requeue an emission whose handler failed, so another attempt is made.
    /// When false the emission is acknowledged and dropped.
    pub requeue_on_error: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            buffer: true,
            group: None,
            prefetch: None,
            requeue_on_error: true,
        }
    }
}

impl ListenerOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            prefetch: config.default_prefetch(),
            ..Default::default()
        }
    }

    pub fn with_buffer(mut self, buffer: bool) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = requeue;
        self
    }
}

/// Subscribes to one event (or a wildcard family of events).
pub struct Listener {
    consumer: Consumer,
}

struct ListenerHandler {
    event: String,
    client_name: String,
    responder: Responder,
    options: ListenerOptions,
}

impl Listener {
    pub fn new(
        client: &Client,
        event: impl Into<String>,
        responder: Responder,
        options: ListenerOptions,
    ) -> Self {
        let event = event.into();
        let handler = Arc::new(ListenerHandler {
            event: event.clone(),
            client_name: client.name().to_string(),
            responder,
            options,
        });
        Self {
            consumer: Consumer::new(client, event, handler),
        }
    }

    pub fn event(&self) -> &str {
        self.consumer.event()
    }

    /// Name of the consumed queue once open. For unbuffered listeners this
    /// is the name the broker generated.
    pub fn queue(&self) -> Option<String> {
        self.consumer.queue()
    }

    /// Start listening. Idempotent; a failed attempt may be retried.
    pub async fn open(&self) -> Result<()> {
        self.consumer.open().await.map(|_| ())
    }

    /// Stop listening. The listener may be opened again later.
    pub async fn close(&self) -> Result<()> {
        self.consumer.close().await
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("event", &self.event())
            .field("queue", &self.queue())
            .finish()
    }
}

/// Queue name for a buffered listener: `<event>:l:<client>:<group>`.
pub fn buffered_queue_name(event: &str, client_name: &str, group: &str) -> String {
    format!("{}:l:{}:{}", event, client_name, group)
}

fn listener_queue(event: &str, client_name: &str, options: &ListenerOptions) -> QueueSpec {
    if options.buffer {
        let group = options.group.as_deref().unwrap_or(client_name);
        QueueSpec {
            name: buffered_queue_name(event, client_name, group),
            options: QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            arguments: FieldTable::default(),
        }
    } else {
        QueueSpec {
            name: String::new(),
            options: QueueDeclareOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                ..Default::default()
            },
            arguments: FieldTable::default(),
        }
    }
}

#[async_trait]
impl DeliveryHandler for ListenerHandler {
    fn kind(&self) -> &'static str {
        "listener"
    }

    fn queue(&self) -> QueueSpec {
        listener_queue(&self.event, &self.client_name, &self.options)
    }

    fn no_ack(&self) -> bool {
        !self.options.buffer
    }

    fn prefetch(&self) -> Option<u16> {
        self.options.prefetch
    }

    async fn handle(&self, delivery: Delivery) {
        let settled = match self.verdict(&delivery).await {
            Verdict::NoAck => return,
            Verdict::Ack => delivery.ack(BasicAckOptions::default()).await,
            Verdict::Nack { requeue } => {
                delivery
                    .nack(BasicNackOptions {
                        requeue,
                        ..Default::default()
                    })
                    .await
            }
        };

        if let Err(e) = settled {
            debug!(delivery_tag = delivery.delivery_tag, error = %e, "Failed to settle message");
        }
    }
}

/// How a handled delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Consumed without acknowledgement; nothing to settle.
    NoAck,
    Ack,
    Nack { requeue: bool },
}

impl ListenerHandler {
    /// Decode and handle one emission, and decide how to settle it.
    async fn verdict(&self, delivery: &Delivery) -> Verdict {
        let arg = match codec::decode_args(&delivery.data) {
            Ok(arg) => arg,
            Err(e) => {
                warn!(
                    event = %self.event,
                    error = %e,
                    "Rejecting emission with undecodable body"
                );
                return match self.options.buffer {
                    true => Verdict::Nack { requeue: false },
                    false => Verdict::NoAck,
                };
            }
        };

        let event = Event::incoming(delivery.routing_key.as_str(), &delivery.properties);
        let outcome = self.responder.respond(event.clone(), arg).await;

        if !self.options.buffer {
            if let Err(e) = outcome {
                warn!(
                    event = %event.event_type(),
                    message_id = %event.id(),
                    error = %e,
                    "Listener handler failed"
                );
            }
            return Verdict::NoAck;
        }

        match outcome {
            Ok(_) => Verdict::Ack,
            Err(e) if self.options.requeue_on_error => {
                warn!(
                    event = %event.event_type(),
                    message_id = %event.id(),
                    error = %e,
                    "Listener handler failed, requeueing"
                );
                Verdict::Nack { requeue: true }
            }
            Err(e) => {
                warn!(
                    event = %event.event_type(),
                    message_id = %event.id(),
                    error = %e,
                    "Listener handler failed, dropping"
                );
                Verdict::Ack
            }
        }
    }
}

//! Emitter: fire-and-forget publishing, now or later.

mod delay;

use std::time::Duration;

use chrono::{DateTime, Utc};
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel,
};
use serde::Serialize;
use tracing::debug;

pub use delay::BUCKET_GRACE;
pub(crate) use delay::DelayPlan;

use crate::client::{Client, WorkerPool};
use crate::codec;
use crate::error::{Result, TemitError};
use crate::event::Event;
use crate::requester::validate_priority;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

/// Per-emission options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitOptions {
    /// Deliver after this long.
    pub delay: Option<Duration>,
    /// Deliver at this instant. Takes precedence over `delay`.
    pub schedule: Option<DateTime<Utc>>,
    /// Message priority, 1 to 10.
    pub priority: Option<u8>,
}

impl EmitOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay given as a human-readable duration such as `"1s"` or `"5m 30s"`.
    pub fn with_delay_str(self, delay: &str) -> Result<Self> {
        Ok(self.with_delay(parse_delay(delay)?))
    }

    pub fn with_schedule(mut self, at: DateTime<Utc>) -> Self {
        self.schedule = Some(at);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Parse a human-readable delay.
pub fn parse_delay(delay: &str) -> Result<Duration> {
    humantime::parse_duration(delay)
        .map_err(|e| TemitError::InvalidOption(format!("invalid delay '{}': {}", delay, e)))
}

/// Publishes one event.
#[derive(Debug, Clone)]
pub struct Emitter {
    client: Client,
    event: String,
    options: EmitOptions,
}

impl Emitter {
    pub fn new(client: &Client, event: impl Into<String>, options: EmitOptions) -> Self {
        Self {
            client: client.clone(),
            event: event.into(),
            options,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Bootstrap the publish channel eagerly.
    pub async fn open(&self) -> Result<()> {
        self.client.ensure_open()?;
        self.client.publish_channel(&self.event).await.map(|_| ())
    }

    /// Emit with this emitter's options. Returns the emitted envelope.
    pub async fn send<T: Serialize + ?Sized>(&self, arg: &T) -> Result<Event> {
        self.send_with(arg, &self.options).await
    }

    /// Emit with per-call options.
    pub async fn send_with<T: Serialize + ?Sized>(
        &self,
        arg: &T,
        options: &EmitOptions,
    ) -> Result<Event> {
        self.client.ensure_open()?;
        validate_priority(options.priority)?;

        let body = codec::encode_args(arg)?;
        let channel = self.client.publish_channel(&self.event).await?;

        let event = Event::outgoing(&self.event, self.client.name());
        let mut properties = event.properties().with_delivery_mode(PERSISTENT);
        if let Some(priority) = options.priority {
            properties = properties.with_priority(priority);
        }

        let now = event.timestamp();
        match DelayPlan::new(
            self.client.exchange(),
            &self.event,
            options.delay,
            options.schedule,
            now,
        ) {
            None => {
                publish(&channel, self.client.exchange(), &self.event, &body, properties).await?;
                debug!(event = %self.event, message_id = %event.id(), "Emitted");
            }
            Some(plan) => {
                let transport = self.client.transport().await?;
                assert_bucket(&transport.pool, &plan, self.client.exchange(), &self.event).await?;

                if let Some(expiration) = &plan.expiration {
                    properties = properties.with_expiration(expiration.as_str().into());
                }
                // Straight into the bucket; dead-lettering routes it later.
                publish(&channel, "", &plan.queue, &body, properties).await?;
                debug!(
                    event = %self.event,
                    message_id = %event.id(),
                    queue = %plan.queue,
                    "Emission parked in delay bucket"
                );
            }
        }

        Ok(event)
    }
}

async fn publish(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    properties: BasicProperties,
) -> Result<()> {
    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            body,
            properties,
        )
        .await
        .map_err(|e| TemitError::Publish(format!("Failed to publish: {}", e)))?;

    match confirm
        .await
        .map_err(|e| TemitError::Publish(format!("Publish confirmation failed: {}", e)))?
    {
        Confirmation::Nack(_) => Err(TemitError::Publish(format!(
            "Broker rejected emission to '{}'",
            routing_key
        ))),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

/// Make sure the bucket queue exists.
///
/// Delay buckets are redeclared on every send, which also restarts their
/// idle expiry. Schedule buckets are only declared when missing.
async fn assert_bucket(
    pool: &WorkerPool,
    plan: &DelayPlan,
    exchange: &str,
    event: &str,
) -> Result<()> {
    if plan.is_scheduled() && bucket_exists(pool, &plan.queue).await? {
        return Ok(());
    }

    let declared = pool
        .run(|channel| async move {
            channel
                .queue_declare(
                    &plan.queue,
                    QueueDeclareOptions {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        ..Default::default()
                    },
                    plan.arguments(exchange, event),
                )
                .await
                .map(|_| ())
                .map_err(|e| TemitError::Setup(format!("Failed to declare delay queue: {}", e)))
        })
        .await;

    match declared {
        // A concurrent first send declared it with its own arguments.
        Err(e) if plan.is_scheduled() => match bucket_exists(pool, &plan.queue).await? {
            true => Ok(()),
            false => Err(e),
        },
        other => other,
    }
}

/// Passive declare. A missing queue closes the channel, so the worker is
/// destroyed rather than released.
async fn bucket_exists(pool: &WorkerPool, queue: &str) -> Result<bool> {
    let worker = pool.acquire().await?;
    let passive = QueueDeclareOptions {
        passive: true,
        ..Default::default()
    };
    match worker.queue_declare(queue, passive, FieldTable::default()).await {
        Ok(_) => {
            pool.release(worker);
            Ok(true)
        }
        Err(e) => {
            debug!(queue = %queue, error = %e, "Delay bucket not found");
            pool.destroy(worker).await;
            Ok(false)
        }
    }
}

//! Consumer bootstrap shared by Endpoint and Listener.
//!
//! Bootstrap asserts the queue through a pool worker, then opens the
//! consumer's own long-lived channel, applies prefetch, binds the queue to
//! the exchange under the event name and starts consuming. `open` is
//! idempotent and retryable through `Lifecycle`; a consumer whose stream
//! ends while nobody asked it to stop is dead for good.
//!
//! Consumers without acknowledgements get no flow control from the broker,
//! so their prefetch caps the number of handlers running at once instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, Instrument};

use crate::client::Client;
use crate::error::{Result, TemitError};
use crate::lifecycle::Lifecycle;

/// How a consumer's queue is asserted.
#[derive(Debug, Clone)]
pub(crate) struct QueueSpec {
    /// Queue name. Empty asks the broker to generate one.
    pub name: String,
    pub options: QueueDeclareOptions,
    pub arguments: FieldTable,
}

/// Per-component behaviour plugged into the shared bootstrap.
#[async_trait]
pub(crate) trait DeliveryHandler: Send + Sync + 'static {
    /// Short component label for logs and consumer tags.
    fn kind(&self) -> &'static str;

    fn queue(&self) -> QueueSpec;

    /// Consume without acknowledgements.
    fn no_ack(&self) -> bool;

    fn prefetch(&self) -> Option<u16>;

    /// Process one delivery. Runs on its own task; acknowledgement, if any,
    /// is the handler's job.
    async fn handle(&self, delivery: Delivery);
}

/// A running consumption.
#[derive(Clone)]
pub(crate) struct Active {
    pub channel: Channel,
    pub queue: String,
    pub consumer_tag: String,
    stopped: Arc<AtomicBool>,
}

impl Active {
    /// Mark the consumption as intentionally stopped and close its channel.
    async fn stop(&self, reason: &str) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, reason)
            .await
            .map_err(|e| TemitError::Transport(format!("Failed to close channel: {}", e)))
    }
}

pub(crate) struct Consumer {
    client: Client,
    event: String,
    handler: Arc<dyn DeliveryHandler>,
    lifecycle: Arc<Lifecycle<Active>>,
}

impl Consumer {
    pub fn new(client: &Client, event: String, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            client: client.clone(),
            event,
            handler,
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Bootstrap, or join the bootstrap already in flight.
    pub async fn open(&self) -> Result<Active> {
        self.client.ensure_open()?;
        let client = self.client.clone();
        let event = self.event.clone();
        let handler = self.handler.clone();
        let lifecycle = Arc::downgrade(&self.lifecycle);
        self.lifecycle
            .open(
                move || Box::pin(bootstrap(client, event, handler, lifecycle)),
                |active| {
                    Box::pin(async move {
                        if let Err(e) = active.stop("consumer closed while starting").await {
                            debug!(queue = %active.queue, error = %e, "Ignoring close error");
                        }
                        debug!(queue = %active.queue, "Abandoned consumer torn down");
                    })
                },
            )
            .await
    }

    /// Name of the consumed queue once bootstrapped.
    pub fn queue(&self) -> Option<String> {
        self.lifecycle.get().map(|active| active.queue)
    }

    /// Stop consuming and close the dedicated channel.
    ///
    /// The consumer returns to not-bootstrapped and may be opened again.
    pub async fn close(&self) -> Result<()> {
        let Some(active) = self.lifecycle.reset() else {
            return Ok(());
        };
        active.stop("consumer closed").await?;

        info!(
            kind = self.handler.kind(),
            event = %self.event,
            queue = %active.queue,
            consumer_tag = %active.consumer_tag,
            "Consumer closed"
        );
        Ok(())
    }
}

async fn bootstrap(
    client: Client,
    event: String,
    handler: Arc<dyn DeliveryHandler>,
    lifecycle: std::sync::Weak<Lifecycle<Active>>,
) -> Result<Active> {
    let transport = client.transport().await?;
    let spec = handler.queue();

    // (1) Assert the queue on a pool worker.
    let queue = transport
        .pool
        .run(|channel| async move {
            channel
                .queue_declare(&spec.name, spec.options, spec.arguments)
                .await
                .map(|queue| queue.name().to_string())
                .map_err(|e| TemitError::Setup(format!("Failed to declare queue: {}", e)))
        })
        .await?;

    // (2) Dedicated channel: prefetch, bind, consume.
    let channel = transport
        .connection
        .create_channel()
        .await
        .map_err(|e| TemitError::Setup(format!("Failed to create channel: {}", e)))?;

    if let Some(prefetch) = handler.prefetch() {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TemitError::Setup(format!("Failed to set prefetch: {}", e)))?;
    }

    channel
        .queue_bind(
            &queue,
            client.exchange(),
            &event,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| TemitError::Setup(format!("Failed to bind queue: {}", e)))?;

    let consumer_tag = format!(
        "{}:{}:{}",
        client.name(),
        handler.kind(),
        uuid::Uuid::new_v4()
    );
    let consumer = channel
        .basic_consume(
            &queue,
            &consumer_tag,
            BasicConsumeOptions {
                no_ack: handler.no_ack(),
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TemitError::Setup(format!("Failed to start consumer: {}", e)))?;

    info!(
        kind = handler.kind(),
        event = %event,
        queue = %queue,
        "Consumer started"
    );

    let active = Active {
        channel: channel.clone(),
        queue: queue.clone(),
        consumer_tag,
        stopped: Arc::new(AtomicBool::new(false)),
    };

    let limit = in_flight_limit(handler.as_ref());
    tokio::spawn(consume(
        consumer,
        handler,
        Context {
            client,
            queue,
            stopped: active.stopped.clone(),
            lifecycle,
            limit,
        },
    ));

    Ok(active)
}

struct Context {
    client: Client,
    queue: String,
    stopped: Arc<AtomicBool>,
    lifecycle: std::sync::Weak<Lifecycle<Active>>,
    limit: Option<Arc<Semaphore>>,
}

/// Cap on concurrent handlers, for consumers the broker does not pace.
fn in_flight_limit(handler: &dyn DeliveryHandler) -> Option<Arc<Semaphore>> {
    match handler.prefetch() {
        Some(prefetch) if handler.no_ack() && prefetch > 0 => {
            Some(Arc::new(Semaphore::new(prefetch.into())))
        }
        _ => None,
    }
}

/// Hand each delivery to its own task until the stream ends.
async fn consume<S>(mut deliveries: S, handler: Arc<dyn DeliveryHandler>, context: Context)
where
    S: Stream<Item = lapin::Result<Delivery>> + Unpin,
{
    let reason = loop {
        match deliveries.next().await {
            Some(Ok(delivery)) => {
                let permit = match &context.limit {
                    Some(limit) => limit.clone().acquire_owned().await.ok(),
                    None => None,
                };
                let span = tracing::info_span!(
                    "consumer.delivery",
                    kind = handler.kind(),
                    routing_key = %delivery.routing_key
                );
                let handler = handler.clone();
                tokio::spawn(
                    async move {
                        handler.handle(delivery).await;
                        drop(permit);
                    }
                    .instrument(span),
                );
            }
            Some(Err(e)) => break format!("Consumer error: {}", e),
            None => break "Consumer cancelled by broker".to_string(),
        }
    };

    if context.stopped.load(Ordering::SeqCst) || context.client.is_closing() {
        debug!(queue = %context.queue, reason = %reason, "Consumer stopped during shutdown");
        return;
    }

    error!(kind = handler.kind(), queue = %context.queue, reason = %reason, "Consumer died");
    if let Some(lifecycle) = context.lifecycle.upgrade() {
        lifecycle.kill(TemitError::Transport(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use lapin::{acker::Acker, BasicProperties};

    use crate::config::ClientConfig;

    /// Records how many deliveries it is handling at once.
    #[derive(Default)]
    struct Gauge {
        no_ack: bool,
        prefetch: Option<u16>,
        running: AtomicUsize,
        peak: AtomicUsize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for Gauge {
        fn kind(&self) -> &'static str {
            "gauge"
        }

        fn queue(&self) -> QueueSpec {
            QueueSpec {
                name: "gauge".to_string(),
                options: QueueDeclareOptions::default(),
                arguments: FieldTable::default(),
            }
        }

        fn no_ack(&self) -> bool {
            self.no_ack
        }

        fn prefetch(&self) -> Option<u16> {
            self.prefetch
        }

        async fn handle(&self, _delivery: Delivery) {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn delivery(tag: u64) -> lapin::Result<Delivery> {
        Ok(Delivery {
            delivery_tag: tag,
            exchange: "temit".into(),
            routing_key: "user.get".into(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: b"[null]".to_vec(),
            acker: Acker::default(),
        })
    }

    fn context(
        client: &Client,
        lifecycle: &Arc<Lifecycle<Active>>,
        handler: &dyn DeliveryHandler,
    ) -> Context {
        Context {
            client: client.clone(),
            queue: "gauge".to_string(),
            stopped: Arc::new(AtomicBool::new(false)),
            lifecycle: Arc::downgrade(lifecycle),
            limit: in_flight_limit(handler),
        }
    }

    async fn wait_for(gauge: &Gauge, handled: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while gauge.handled.load(Ordering::SeqCst) < handled {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handlers did not finish");
    }

    async fn reopen(lifecycle: &Lifecycle<Active>) -> Result<Active> {
        lifecycle
            .open(
                || Box::pin(async { Err(TemitError::Setup("not reached".into())) }),
                |_| Box::pin(async {}),
            )
            .await
    }

    #[test]
    fn test_limit_only_applies_without_acks() {
        let gauge = |no_ack, prefetch| Gauge {
            no_ack,
            prefetch,
            ..Default::default()
        };
        assert!(in_flight_limit(&gauge(true, Some(4))).is_some());
        assert!(in_flight_limit(&gauge(true, None)).is_none());
        assert!(in_flight_limit(&gauge(true, Some(0))).is_none());
        assert!(in_flight_limit(&gauge(false, Some(4))).is_none());
    }

    #[tokio::test]
    async fn test_no_ack_consumer_bounds_handlers_to_prefetch() {
        let client = Client::new(ClientConfig::default().with_name("tests"));
        let lifecycle = Arc::new(Lifecycle::new());
        let gauge = Arc::new(Gauge {
            no_ack: true,
            prefetch: Some(2),
            ..Default::default()
        });
        let context = context(&client, &lifecycle, &*gauge);
        context.stopped.store(true, Ordering::SeqCst);

        let deliveries = futures::stream::iter((1..=6).map(delivery));
        consume(deliveries, gauge.clone(), context).await;
        wait_for(&gauge, 6).await;

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acked_consumer_leaves_pacing_to_the_broker() {
        let client = Client::new(ClientConfig::default().with_name("tests"));
        let lifecycle = Arc::new(Lifecycle::new());
        let gauge = Arc::new(Gauge {
            no_ack: false,
            prefetch: Some(2),
            ..Default::default()
        });
        let context = context(&client, &lifecycle, &*gauge);
        context.stopped.store(true, Ordering::SeqCst);

        let deliveries = futures::stream::iter((1..=6).map(delivery));
        consume(deliveries, gauge.clone(), context).await;
        wait_for(&gauge, 6).await;

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_cancelled_consumer_is_dead() {
        let client = Client::new(ClientConfig::default().with_name("tests"));
        let lifecycle = Arc::new(Lifecycle::new());
        let gauge = Arc::new(Gauge::default());
        let context = context(&client, &lifecycle, &*gauge);

        consume(futures::stream::empty::<lapin::Result<Delivery>>(), gauge, context).await;

        assert!(matches!(reopen(&lifecycle).await, Err(TemitError::Transport(_))));
    }

    #[tokio::test]
    async fn test_stream_end_after_stop_is_not_fatal() {
        let client = Client::new(ClientConfig::default().with_name("tests"));
        let lifecycle = Arc::new(Lifecycle::new());
        let gauge = Arc::new(Gauge::default());
        let context = context(&client, &lifecycle, &*gauge);
        context.stopped.store(true, Ordering::SeqCst);

        consume(futures::stream::empty::<lapin::Result<Delivery>>(), gauge, context).await;

        // Still retryable: the start runs and reports its own failure.
        assert!(matches!(reopen(&lifecycle).await, Err(TemitError::Setup(_))));
    }
}

//! The client: owner of the broker connection and everything shared by the
//! components created from it.
//!
//! A `Client` is a cheap handle; clones share one connection, one worker
//! pool, one reply dispatcher and one table of per-event publish channels.
//! Several independent clients may live in the same process.

mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lapin::{
    options::{ConfirmSelectOptions, ExchangeDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info};

pub(crate) use pool::WorkerPool;

use crate::config::ClientConfig;
use crate::emitter::{EmitOptions, Emitter};
use crate::endpoint::{Endpoint, EndpointOptions};
use crate::error::{Result, TemitError};
use crate::handler::Responder;
use crate::lifecycle::Lifecycle;
use crate::listener::{Listener, ListenerOptions};
use crate::requester::{ReplyDispatcher, RequestOptions, Requester};

/// The live connection and its worker pool.
pub(crate) struct Transport {
    pub connection: Arc<Connection>,
    pub pool: WorkerPool,
}

struct ClientInner {
    config: ClientConfig,
    closing: Arc<AtomicBool>,
    transport: Lifecycle<Arc<Transport>>,
    replies: Lifecycle<Arc<ReplyDispatcher>>,
    publishers: DashMap<String, Channel>,
}

/// Handle to a temit client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client. Nothing touches the network until the first
    /// component opens or `connect` is called.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                closing: Arc::new(AtomicBool::new(false)),
                transport: Lifecycle::new(),
                replies: Lifecycle::new(),
                publishers: DashMap::new(),
            }),
        }
    }

    /// Service identity stamped on outgoing messages.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Shared topic exchange.
    pub fn exchange(&self) -> &str {
        &self.inner.config.exchange
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// True once `close` has started. Never flips back.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn closing_flag(&self) -> Arc<AtomicBool> {
        self.inner.closing.clone()
    }

    /// Fail fast if the client has been closed.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closing() {
            Err(TemitError::Closed)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connect and declare the exchange.
    ///
    /// Idempotent: concurrent callers share one attempt. A failed attempt is
    /// reported to every caller awaiting it and may be retried.
    pub async fn connect(&self) -> Result<()> {
        self.transport().await.map(|_| ())
    }

    pub(crate) async fn transport(&self) -> Result<Arc<Transport>> {
        self.ensure_open()?;
        let config = self.inner.config.clone();
        let closing = self.closing_flag();
        self.inner
            .transport
            .open(move || Box::pin(establish(config, closing)), |transport| {
                Box::pin(async move { transport.shutdown().await })
            })
            .await
    }

    /// Tear the client down.
    ///
    /// In-flight handlers are not awaited and pending requests fail with
    /// `TemitError::Closed`. The client cannot be reused afterwards.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(replies) = self.inner.replies.kill(TemitError::Closed) {
            replies.shutdown(TemitError::Closed);
        }
        self.inner.publishers.clear();

        if let Some(transport) = self.inner.transport.kill(TemitError::Closed) {
            transport.pool.close();
            transport
                .connection
                .close(200, "Goodbye")
                .await
                .map_err(|e| TemitError::Connection(format!("Failed to close connection: {}", e)))?;
        }

        info!(name = %self.name(), "Client closed");
        Ok(())
    }

    // ========================================================================
    // Shared channels
    // ========================================================================

    /// The reply dispatcher, started on first use.
    pub(crate) async fn replies(&self) -> Result<Arc<ReplyDispatcher>> {
        self.ensure_open()?;
        let client = self.clone();
        self.inner
            .replies
            .open(
                move || Box::pin(async move { ReplyDispatcher::start(&client).await }),
                |replies| Box::pin(async move { replies.stop(TemitError::Closed).await }),
            )
            .await
    }

    /// Long-lived publish channel for `event`, in confirm mode.
    pub(crate) async fn publish_channel(&self, event: &str) -> Result<Channel> {
        if let Some(channel) = self.inner.publishers.get(event) {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let transport = self.transport().await?;
        let channel = transport
            .connection
            .create_channel()
            .await
            .map_err(|e| TemitError::Setup(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TemitError::Setup(format!("Failed to enable confirms: {}", e)))?;

        let (chosen, spare) = match self.inner.publishers.entry(event.to_string()) {
            Entry::Occupied(existing) if existing.get().status().connected() => {
                (existing.get().clone(), Some(channel))
            }
            Entry::Occupied(mut stale) => {
                stale.insert(channel.clone());
                (channel, None)
            }
            Entry::Vacant(slot) => {
                slot.insert(channel.clone());
                (channel, None)
            }
        };

        // Lost a race with another emitter of the same event.
        if let Some(spare) = spare {
            if let Err(e) = spare.close(200, "duplicate publish channel").await {
                debug!(error = %e, "Ignoring error closing spare publish channel");
            }
        }

        Ok(chosen)
    }

    // ========================================================================
    // Components
    // ========================================================================

    /// A Requester for `event` with default options.
    pub fn requester(&self, event: impl Into<String>) -> Requester {
        Requester::new(self, event, RequestOptions::from_config(self.config()))
    }

    pub fn requester_with(&self, event: impl Into<String>, options: RequestOptions) -> Requester {
        Requester::new(self, event, options)
    }

    /// An Endpoint answering `event` with `responder`.
    pub fn endpoint(&self, event: impl Into<String>, responder: Responder) -> Endpoint {
        Endpoint::new(self, event, responder, EndpointOptions::from_config(self.config()))
    }

    pub fn endpoint_with(
        &self,
        event: impl Into<String>,
        responder: Responder,
        options: EndpointOptions,
    ) -> Endpoint {
        Endpoint::new(self, event, responder, options)
    }

    /// A buffered Listener for `event` in this client's default group.
    pub fn listener(&self, event: impl Into<String>, responder: Responder) -> Listener {
        Listener::new(self, event, responder, ListenerOptions::from_config(self.config()))
    }

    pub fn listener_with(
        &self,
        event: impl Into<String>,
        responder: Responder,
        options: ListenerOptions,
    ) -> Listener {
        Listener::new(self, event, responder, options)
    }

    /// An Emitter for `event`.
    pub fn emitter(&self, event: impl Into<String>) -> Emitter {
        Emitter::new(self, event, EmitOptions::default())
    }

    pub fn emitter_with(&self, event: impl Into<String>, options: EmitOptions) -> Emitter {
        Emitter::new(self, event, options)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name())
            .field("exchange", &self.exchange())
            .field("connected", &self.inner.transport.is_ready())
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Transport {
    /// Close the pool and the connection of a transport nobody will use.
    async fn shutdown(&self) {
        self.pool.close();
        if let Err(e) = self.connection.close(200, "Goodbye").await {
            debug!(error = %e, "Ignoring error closing abandoned connection");
        }
    }
}

/// Open the connection, build the worker pool and declare the exchange.
async fn establish(config: ClientConfig, closing: Arc<AtomicBool>) -> Result<Arc<Transport>> {
    let properties =
        ConnectionProperties::default().with_connection_name(config.name.clone().into());
    let connection = Connection::connect(&config.url, properties)
        .await
        .map_err(|e| TemitError::Connection(format!("Failed to connect: {}", e)))?;

    connection.on_error(move |e| {
        if closing.load(Ordering::SeqCst) {
            debug!(error = %e, "Connection closed during shutdown");
        } else {
            error!(error = %e, "AMQP connection error");
        }
    });

    let connection = Arc::new(connection);
    let pool = WorkerPool::new(connection.clone(), config.pool_max_size)?;

    // Leaves one worker idle in the pool, warm for the first operation.
    let exchange = config.exchange.clone();
    pool.run(|channel| async move {
        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TemitError::Setup(format!("Failed to declare exchange: {}", e)))
    })
    .await?;

    info!(
        exchange = %config.exchange,
        name = %config.name,
        "Connected to AMQP"
    );

    Ok(Arc::new(Transport { connection, pool }))
}

#[cfg(test)]
mod tests;

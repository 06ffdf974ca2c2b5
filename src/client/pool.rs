//! Pool of short-lived worker channels over the shared connection.
//!
//! Workers are used for administrative one-offs: queue assertions and
//! single-shot sends such as replies. Every checkout ends in exactly one of
//! release (the `Worker` guard is dropped) or destroy (the channel is taken
//! out of the pool and closed), never both.

use std::future::Future;
use std::sync::Arc;

use deadpool::managed::{self, Metrics, Object, RecycleError, RecycleResult};
use lapin::{Channel, ChannelState, Connection};
use tracing::{debug, warn};

use crate::error::{Result, TemitError};

/// Creates channels on the shared connection and rejects dead ones on return.
pub(crate) struct ChannelManager {
    connection: Arc<Connection>,
}

impl managed::Manager for ChannelManager {
    type Type = Channel;
    type Error = lapin::Error;

    async fn create(&self) -> std::result::Result<Channel, lapin::Error> {
        let channel = self.connection.create_channel().await?;
        debug!(channel = channel.id(), "Opened worker channel");
        Ok(channel)
    }

    async fn recycle(
        &self,
        channel: &mut Channel,
        _metrics: &Metrics,
    ) -> RecycleResult<lapin::Error> {
        match channel.status().state() {
            ChannelState::Connected => Ok(()),
            state => Err(RecycleError::Backend(lapin::Error::InvalidChannelState(
                state,
            ))),
        }
    }
}

/// A checked-out worker channel. Dropping it releases it back to the pool.
pub(crate) type Worker = Object<ChannelManager>;

/// Bounded pool of worker channels.
#[derive(Clone)]
pub(crate) struct WorkerPool {
    pool: managed::Pool<ChannelManager>,
}

impl WorkerPool {
    pub fn new(connection: Arc<Connection>, max_size: usize) -> Result<Self> {
        let pool = managed::Pool::builder(ChannelManager { connection })
            .max_size(max_size.max(1))
            .build()
            .map_err(|e| TemitError::Connection(format!("Failed to create pool: {}", e)))?;
        Ok(Self { pool })
    }

    /// Check out a worker, waiting while the pool is at capacity.
    pub async fn acquire(&self) -> Result<Worker> {
        self.pool.get().await.map_err(|e| {
            if self.pool.is_closed() {
                TemitError::Closed
            } else {
                TemitError::Connection(format!("Failed to get worker channel: {}", e))
            }
        })
    }

    /// Return a healthy worker for reuse.
    pub fn release(&self, worker: Worker) {
        drop(worker);
    }

    /// Remove a worker from the pool for good and close its channel.
    ///
    /// Close failures are swallowed: the operation that broke the channel
    /// has already reported the real error.
    pub async fn destroy(&self, worker: Worker) {
        let channel = Object::take(worker);
        if channel.status().connected() {
            if let Err(e) = channel.close(200, "worker destroyed").await {
                debug!(error = %e, "Ignoring error closing destroyed worker");
            }
        }
    }

    /// Run `op` on a worker: release it on success, destroy it on error.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let worker = self.acquire().await?;
        match op(Channel::clone(&worker)).await {
            Ok(value) => {
                self.release(worker);
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "Worker operation failed, destroying channel");
                self.destroy(worker).await;
                Err(e)
            }
        }
    }

    /// Stop handing out workers and drop the idle ones.
    pub fn close(&self) {
        self.pool.close();
    }
}

//! Handlers and the responder that normalises their outcome.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::codec::{Outcome, RemoteError};
use crate::event::Event;

/// What a single handler stage produced.
///
/// `Ok(None)` means "no explicit return": the next stage runs, or the chain
/// yields `null` if this was the last one. `Ok(Some(Value::Null))` is an
/// explicit `null` result.
pub type HandlerResult = std::result::Result<Option<Value>, RemoteError>;

/// Handler for calls (Endpoint) or events (Listener).
pub trait Handler: Send + Sync + 'static {
    /// Handle one inbound message.
    fn handle(&self, event: Event, arg: Value) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Event, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, event: Event, arg: Value) -> BoxFuture<'static, HandlerResult> {
        Box::pin(self(event, arg))
    }
}

/// How a consumer answers inbound messages.
#[derive(Clone)]
pub enum Responder {
    /// Run handlers in order until one returns a value or an error.
    Handlers(Vec<Arc<dyn Handler>>),
    /// Answer every message with the same data.
    Data(Value),
}

impl Responder {
    /// A responder with a single handler.
    pub fn handler(handler: impl Handler) -> Self {
        Responder::Handlers(vec![Arc::new(handler)])
    }

    /// A responder that always returns `data` verbatim.
    pub fn data(data: impl Into<Value>) -> Self {
        Responder::Data(data.into())
    }

    /// Append another handler stage.
    ///
    /// Turns a static-data responder into a handler chain.
    pub fn then(self, handler: impl Handler) -> Self {
        let mut handlers = match self {
            Responder::Handlers(handlers) => handlers,
            Responder::Data(_) => Vec::new(),
        };
        handlers.push(Arc::new(handler));
        Responder::Handlers(handlers)
    }

    /// Run the responder and normalise the outcome to an `(error, result)` pair.
    ///
    /// A panicking handler is reported as an error, the same as a returned one.
    pub async fn respond(&self, event: Event, arg: Value) -> Outcome {
        let handlers = match self {
            Responder::Data(data) => return Ok(data.clone()),
            Responder::Handlers(handlers) => handlers,
        };

        for handler in handlers {
            let stage = handler.handle(event.clone(), arg.clone());
            match AssertUnwindSafe(stage).catch_unwind().await {
                Ok(Ok(None)) => continue,
                Ok(Ok(Some(result))) => return Ok(result),
                Ok(Err(error)) => return Err(error),
                Err(panic) => return Err(panic_error(panic)),
            }
        }

        Ok(Value::Null)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Responder::Handlers(handlers) => f
                .debug_struct("Handlers")
                .field("stages", &handlers.len())
                .finish(),
            Responder::Data(data) => f.debug_tuple("Data").field(data).finish(),
        }
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> RemoteError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    RemoteError::new(message).with_name("Panic")
}

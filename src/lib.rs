//! Temit - request/reply and publish/subscribe over an AMQP topic exchange.
//!
//! A [`Client`] owns one broker connection. Components created from it:
//!
//! - [`Requester`] calls an [`Endpoint`] and awaits its reply, with timeout
//!   and no-route detection.
//! - [`Emitter`] publishes events, now or after a delay, to every
//!   [`Listener`] group subscribed to them.
//!
//! ```no_run
//! use serde_json::{json, Value};
//! use temit::{Client, ClientConfig, Event, Responder};
//!
//! # async fn run() -> temit::Result<()> {
//! let client = Client::new(ClientConfig::default().with_name("accounts"));
//!
//! let endpoint = client.endpoint(
//!     "user.get",
//!     Responder::handler(|_event: Event, id: Value| async move {
//!         Ok(Some(json!({ "id": id, "name": "ann" })))
//!     }),
//! );
//! endpoint.open().await?;
//!
//! let user: Value = client.requester("user.get").send(&json!(1)).await?;
//! client.emitter("user.fetched").send(&user).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
mod consumer;
pub mod emitter;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod handler;
mod lifecycle;
pub mod listener;
pub mod requester;
pub mod utils;

pub use client::Client;
pub use codec::{Outcome, RemoteError};
pub use config::ClientConfig;
pub use emitter::{parse_delay, EmitOptions, Emitter};
pub use endpoint::{Endpoint, EndpointOptions};
pub use error::{Result, TemitError};
pub use event::{Event, Scratch};
pub use handler::{Handler, HandlerResult, Responder};
pub use listener::{Listener, ListenerOptions};
pub use requester::{RequestOptions, Requester, DIRECT_REPLY_TO};

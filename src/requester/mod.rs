//! Requester: turns a fire-and-forget publish into an awaitable call.
//!
//! Each call publishes `[argument]` under the target event's routing key
//! with a fresh message id as correlation id and the direct-reply
//! pseudo-queue as reply-to, then waits for exactly one of: the reply, the
//! broker returning the message unroutable, or the timeout.

mod dispatcher;
mod pending;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub use dispatcher::DIRECT_REPLY_TO;
pub(crate) use dispatcher::ReplyDispatcher;

use crate::client::Client;
use crate::codec;
use crate::config::ClientConfig;
use crate::error::{Result, TemitError};
use crate::event::Event;
use pending::Settlement;

/// Highest message priority the broker is asked to honour.
pub const MAX_PRIORITY: u8 = 10;

/// Per-call options.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// How long to wait for a reply. Zero waits forever and sets no
    /// broker-side expiration.
    pub timeout: Duration,
    /// Message priority, 1 to `MAX_PRIORITY`.
    pub priority: Option<u8>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            priority: None,
        }
    }
}

impl RequestOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            timeout: config.request_timeout(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_priority(self.priority)
    }

    /// Broker-side expiration matching the timeout, so a request nobody
    /// picked up in time is not processed after its caller gave up.
    fn expiration(&self) -> Option<String> {
        (!self.timeout.is_zero()).then(|| self.timeout.as_millis().to_string())
    }
}

pub(crate) fn validate_priority(priority: Option<u8>) -> Result<()> {
    match priority {
        Some(p) if !(1..=MAX_PRIORITY).contains(&p) => Err(TemitError::InvalidOption(format!(
            "priority must be between 1 and {}, got {}",
            MAX_PRIORITY, p
        ))),
        _ => Ok(()),
    }
}

/// Caller side of request/reply for one event.
#[derive(Debug, Clone)]
pub struct Requester {
    client: Client,
    event: String,
    options: RequestOptions,
}

impl Requester {
    pub fn new(client: &Client, event: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            client: client.clone(),
            event: event.into(),
            options,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Bootstrap eagerly. Calls made before this completes wait for it.
    pub async fn open(&self) -> Result<()> {
        self.client.replies().await.map(|_| ())
    }

    /// Call the endpoint with this requester's options.
    pub async fn send<T, R>(&self, arg: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send_with(arg, &self.options).await
    }

    /// Call the endpoint with per-call options.
    pub async fn send_with<T, R>(&self, arg: &T, options: &RequestOptions) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.client.ensure_open()?;
        options.validate()?;

        let body = codec::encode_args(arg)?;
        let replies = self.client.replies().await?;

        let event = Event::outgoing(&self.event, self.client.name());
        let mut properties = event
            .properties()
            .with_correlation_id(event.id().into())
            .with_reply_to(DIRECT_REPLY_TO.into());
        if let Some(priority) = options.priority {
            properties = properties.with_priority(priority);
        }
        if let Some(expiration) = options.expiration() {
            properties = properties.with_expiration(expiration.into());
        }

        // Registered before publishing: a fast reply must find its waiter.
        let mut call = replies.register(event.id())?;

        debug!(
            event = %self.event,
            message_id = %event.id(),
            timeout_ms = options.timeout.as_millis() as u64,
            "Sending request"
        );
        replies
            .publish(self.client.exchange(), &self.event, &body, properties)
            .await?;

        let settlement = if options.timeout.is_zero() {
            call.settled().await
        } else {
            match tokio::time::timeout(options.timeout, call.settled()).await {
                Ok(settlement) => settlement,
                Err(_) => {
                    debug!(event = %self.event, message_id = %event.id(), "Request timed out");
                    return Err(TemitError::Timeout {
                        event: self.event.clone(),
                        timeout: options.timeout,
                    });
                }
            }
        };

        match settlement {
            Settlement::Reply(Ok(result)) => Ok(serde_json::from_value(result)?),
            Settlement::Reply(Err(error)) => Err(TemitError::Remote(error)),
            Settlement::Returned => Err(TemitError::NoRoute {
                event: self.event.clone(),
            }),
            Settlement::Failed(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = RequestOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.expiration(), Some("30000".to_string()));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_sets_no_expiration() {
        let options = RequestOptions::default().with_timeout(Duration::ZERO);
        assert_eq!(options.expiration(), None);
    }

    #[test]
    fn test_options_from_config() {
        let config = ClientConfig {
            request_timeout_ms: 50,
            ..Default::default()
        };
        assert_eq!(
            RequestOptions::from_config(&config).timeout,
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_priority_bounds() {
        assert!(RequestOptions::default().with_priority(1).validate().is_ok());
        assert!(RequestOptions::default().with_priority(10).validate().is_ok());
        assert!(matches!(
            RequestOptions::default().with_priority(0).validate(),
            Err(TemitError::InvalidOption(_))
        ));
        assert!(matches!(
            RequestOptions::default().with_priority(11).validate(),
            Err(TemitError::InvalidOption(_))
        ));
    }
}

//! The `Event` envelope handed to handlers alongside the decoded argument.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use lapin::{types::ShortString, BasicProperties};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::codec::CONTENT_TYPE;

/// Handler-scoped scratch space.
///
/// Shared between the stages of a single message's handler chain and never
/// transmitted. Every inbound message gets a fresh, empty one.
#[derive(Debug, Clone, Default)]
pub struct Scratch(Arc<Mutex<Map<String, Value>>>);

impl Scratch {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.lock().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Immutable metadata of a call or emission.
#[derive(Debug, Clone)]
pub struct Event {
    id: String,
    event_type: String,
    resource: String,
    timestamp: DateTime<Utc>,
    /// Per-message scratch space for passing data between handler stages.
    pub scratch: Scratch,
}

impl Event {
    /// Build the envelope for a message about to be sent by `resource`.
    pub(crate) fn outgoing(event_type: &str, resource: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            resource: resource.to_string(),
            timestamp: Utc::now(),
            scratch: Scratch::default(),
        }
    }

    /// Rebuild the envelope from an inbound delivery.
    ///
    /// Missing headers degrade to empty strings / the receive time rather than
    /// failing: peers that omit them are still routable.
    pub(crate) fn incoming(routing_key: &str, properties: &BasicProperties) -> Self {
        let timestamp = properties
            .timestamp()
            .as_ref()
            .and_then(|ms| i64::try_from(*ms).ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Self {
            id: short_or_empty(properties.message_id()),
            event_type: routing_key.to_string(),
            resource: short_or_empty(properties.app_id()),
            timestamp,
            scratch: Scratch::default(),
        }
    }

    /// Unique message id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Routing key the message was published under.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Name of the client that sent the message.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Send time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Base AMQP properties for publishing this envelope.
    ///
    /// The timestamp header carries milliseconds since the epoch, which is
    /// what non-Rust peers on the same exchange write and expect.
    pub(crate) fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_message_id(self.id.as_str().into())
            .with_app_id(self.resource.as_str().into())
            .with_timestamp(self.timestamp.timestamp_millis().max(0) as u64)
            .with_content_type(CONTENT_TYPE.into())
    }
}

fn short_or_empty(value: &Option<ShortString>) -> String {
    value
        .as_ref()
        .map(|s| s.as_str().to_string())
        .unwrap_or_default()
}

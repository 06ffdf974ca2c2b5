//! Delay scheduler: bucket queues that hold emissions until they expire
//! and dead-letter them back into the exchange.
//!
//! Emissions that fire at the same moment share one bucket queue.
//!
//! - Delay (relative): the bucket is keyed by the delay window the send
//!   falls in and the delay itself. The queue's own message TTL equals the
//!   delay, so each message fires exactly `delay` after it was enqueued.
//! - Schedule (absolute): the bucket is keyed by the target instant. Each
//!   message carries its own expiration, the time left until that instant.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lapin::types::{AMQPValue, FieldTable};

/// How long a bucket queue outlives the last message it could hold.
pub const BUCKET_GRACE: Duration = Duration::from_secs(30);

/// Where and how a delayed emission is parked.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DelayPlan {
    /// Bucket queue name, `d:<exchange>:<event>:<bucket-key>`.
    pub queue: String,
    /// Queue-wide message TTL (delay buckets only).
    pub message_ttl: Option<u64>,
    /// Per-message expiration in milliseconds (schedule buckets only).
    pub expiration: Option<String>,
    /// Idle time after which the broker deletes the bucket.
    pub expires: u64,
}

impl DelayPlan {
    /// Plan a delayed or scheduled emission. `None` means publish now.
    ///
    /// A schedule wins over a delay when both are given.
    pub fn new(
        exchange: &str,
        event: &str,
        delay: Option<Duration>,
        schedule: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let now_ms = now.timestamp_millis();
        let grace = BUCKET_GRACE.as_millis() as u64;

        if let Some(at) = schedule {
            let at_ms = at.timestamp_millis();
            let ttl = u64::try_from(at_ms - now_ms).unwrap_or(0);
            return Some(Self {
                queue: bucket_name(exchange, event, &at_ms.to_string()),
                message_ttl: None,
                expiration: Some(ttl.to_string()),
                expires: ttl + grace,
            });
        }

        let delay_ms = u64::try_from(delay?.as_millis()).ok().filter(|ms| *ms > 0)?;
        let window = now_ms.max(0) as u64 / delay_ms * delay_ms;
        Some(Self {
            queue: bucket_name(exchange, event, &format!("{}+{}", window, delay_ms)),
            message_ttl: Some(delay_ms),
            expiration: None,
            expires: delay_ms + grace,
        })
    }

    /// Schedule buckets are declared once: their arguments depend on when
    /// the first emission arrived, and the broker rejects a redeclaration
    /// with different ones.
    pub fn is_scheduled(&self) -> bool {
        self.expiration.is_some()
    }

    /// Queue arguments: dead-letter back into `exchange` under `event`.
    pub fn arguments(&self, exchange: &str, event: &str) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(event.into()),
        );
        arguments.insert("x-expires".into(), AMQPValue::LongLongInt(self.expires as i64));
        if let Some(ttl) = self.message_ttl {
            arguments.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ttl as i64));
        }
        arguments
    }
}

fn bucket_name(exchange: &str, event: &str, key: &str) -> String {
    format!("d:{}:{}:{}", exchange, event, key)
}

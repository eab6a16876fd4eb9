//! Consuming job messages from a broker with bounded, metadata-tracked
//! retries and a dead-letter queue.
//!
//! Every job class `<domain>.<action>` owns three queues:
//!
//! - `<domain>.<action>`: the primary queue handlers consume from.
//! - `<domain>.<action>.retry`: failed messages wait here for the class's
//!   retry delay, then flow back into the primary queue.
//! - `<domain>.<action>.dlq`: terminal store for malformed messages and
//!   messages that exhausted their retries.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub mod amqp;
pub mod consumer;
pub mod dispatch;
pub mod envelope;
pub mod escalation;
pub mod memory;
pub mod publisher;

pub use consumer::{QueueConsumer, Settlement};
pub use dispatch::{Dispatcher, JobHandler};
pub use envelope::JobEnvelope;
pub use escalation::{DeadLetterReason, Disposition, RetryPolicy};
pub use publisher::JobPublisher;

/// Transport header carrying how many times the job has already failed.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const LAST_ERROR_HEADER: &str = "x-last-error";
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
pub const DEAD_LETTERED_AT_HEADER: &str = "x-dead-lettered-at";

/// A family of jobs sharing one queue topology and one retry budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobClass {
    pub domain: String,
    pub action: String,
    /// How many times a failed job is re-queued before it is dead-lettered.
    pub max_retries: u32,
    /// How long a failed message waits in the retry buffer.
    pub retry_delay: Duration,
}

impl JobClass {
    pub fn new(domain: impl Into<String>, action: impl Into<String>, max_retries: u32) -> Self {
        Self {
            domain: domain.into(),
            action: action.into(),
            max_retries,
            retry_delay: Duration::from_secs(30),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.domain, self.action)
    }

    pub fn topology(&self) -> QueueTopology {
        let primary = self.name();
        QueueTopology {
            retry: format!("{primary}.retry"),
            dead_letter: format!("{primary}.dlq"),
            primary,
            retry_delay: self.retry_delay,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.domain, self.action)
    }
}

/// Queue names and the retry delay of one job class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueTopology {
    /// Receives new work and expired retries. Broker-level rejects are
    /// routed to the retry buffer.
    pub primary: String,
    /// Holds each message for `retry_delay`, then routes it back to
    /// `primary`.
    pub retry: String,
    /// Durable, no further routing.
    pub dead_letter: String,
    pub retry_delay: Duration,
}

/// A message about to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    /// Written to the `x-retry-count` header.
    pub attempt_count: u32,
    /// Extra string headers.
    pub annotations: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>, attempt_count: u32) -> Self {
        Self {
            body,
            attempt_count,
            annotations: BTreeMap::new(),
        }
    }

    pub fn annotate(mut self, header: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(header.to_string(), value.into());
        self
    }
}

/// One message received from a queue, waiting to be acknowledged.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    /// The `x-retry-count` header, 0 when absent or unreadable.
    fn attempt_count(&self) -> u32;

    /// Removes the message from its queue for good.
    async fn ack(&self) -> anyhow::Result<()>;
}

pub type Deliveries = BoxStream<'static, anyhow::Result<Box<dyn Delivery>>>;

/// The message broker seam.
///
/// Implementations must provide delayed redelivery: a message published to
/// a topology's retry queue reappears on its primary queue after
/// `retry_delay`, with its headers intact, and survives a restart of the
/// consuming process.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Creates the three queues of a job class, if they do not exist yet.
    async fn declare(&self, topology: &QueueTopology) -> anyhow::Result<()>;

    /// Starts consuming `queue`, holding at most `prefetch` unacknowledged
    /// messages. The stream ends or errors when the connection is lost.
    async fn consume(&self, queue: &str, prefetch: u16) -> anyhow::Result<Deliveries>;

    /// Publishes durably; returns once the broker has accepted the message.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_follow_domain_action_convention() {
        let class = JobClass::new("payments", "capture", 10)
            .with_retry_delay(Duration::from_secs(60));
        assert_eq!("payments.capture", class.to_string());
        assert_eq!(
            QueueTopology {
                primary: "payments.capture".into(),
                retry: "payments.capture.retry".into(),
                dead_letter: "payments.capture.dlq".into(),
                retry_delay: Duration::from_secs(60),
            },
            class.topology()
        );
    }
}

use crate::error::JobError;

/// Decides what happens to a message whose job failed.
///
/// Attempts are counted in the message's `x-retry-count` header, which the
/// consumer increments each time it re-queues the message. The retry
/// buffer's TTL provides the delay, so nothing here sleeps or schedules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Re-queues allowed before a job is dead-lettered. A job is attempted
    /// at most `max_retries + 1` times.
    pub max_retries: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Re-publish to the retry buffer carrying this attempt count.
    Retry { attempt_count: u32 },
    DeadLetter(DeadLetterReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The message could not be parsed or its payload had the wrong shape.
    Malformed,
    /// No handler for the job type.
    Unroutable,
    /// The handler failed on every allowed attempt.
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Unroutable => "unroutable",
            Self::RetriesExhausted => "retries-exhausted",
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// `attempt_count` is the value of the header on the failed delivery:
    /// how many times this job had already failed before this attempt.
    pub fn escalate(&self, error: &JobError, attempt_count: u32) -> Disposition {
        match error {
            JobError::Malformed { .. } => Disposition::DeadLetter(DeadLetterReason::Malformed),
            JobError::UnknownJobType { .. } => {
                Disposition::DeadLetter(DeadLetterReason::Unroutable)
            }
            JobError::HandlerExecution { .. } if attempt_count < self.max_retries => {
                Disposition::Retry {
                    attempt_count: attempt_count + 1,
                }
            }
            JobError::HandlerExecution { .. } => {
                Disposition::DeadLetter(DeadLetterReason::RetriesExhausted)
            }
        }
    }
}

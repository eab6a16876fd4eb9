use thiserror::Error;

/// Reasons a single job delivery can fail. The variant decides whether the
/// retry escalation policy may try the job again.
#[derive(Debug, Error)]
pub enum JobError {
    /// The body is not a job envelope, or its payload does not match the
    /// shape its handler expects. Never retried.
    #[error("malformed job message: {reason}")]
    Malformed { reason: String },

    /// Well-formed envelope whose `type` has no handler on this queue.
    /// Never retried.
    #[error("no handler registered for job type `{job_type}`")]
    UnknownJobType { job_type: String },

    /// The handler returned an error or panicked. Retried up to the job
    /// class's maximum.
    #[error("handler for `{job_type}` failed: {source:#}")]
    HandlerExecution {
        job_type: String,
        #[source]
        source: anyhow::Error,
    },
}

impl JobError {
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::HandlerExecution { .. })
    }
}

/// A failure of an outbound call that is expected to succeed if tried again
/// shortly: timeouts, dropped connections, 5xx responses.
///
/// Handlers wrap flaky calls with [`crate::backoff::Backoff::retry_transient`],
/// which only retries errors carrying this type.
#[derive(Debug, Error)]
#[error("transient i/o failure: {0}")]
pub struct TransientIoError(pub String);

impl TransientIoError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub fn is_transient(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<TransientIoError>())
}

/// Enables logging of errors, to move forward without returning the error.
pub trait LogError<T>: Sized {
    /// Lazily logs if there was an error with a message and converts the result into an option
    fn log_with_context<Ctx: Fn() -> String>(self, ctx: Ctx) -> Option<T> {
        self.log_with_context_as(tracing::log::Level::Error, ctx)
    }

    /// Lazily logs if there was an error with a message at the provided log
    /// level, and converts the result into an option
    fn log_with_context_as<Ctx: Fn() -> String>(
        self,
        level: tracing::log::Level,
        ctx: Ctx,
    ) -> Option<T>;
}

impl<T, E: std::fmt::Display + 'static> LogError<T> for Result<T, E> {
    fn log_with_context_as<Ctx: Fn() -> String>(
        self,
        level: tracing::log::Level,
        ctx: Ctx,
    ) -> Option<T> {
        self.map_err(|e| {
            let ctx = ctx();
            let es = display_error(&e);
            log!(level, "error: `{ctx}` - {es}");
        })
        .ok()
    }
}

macro_rules! log {
    ($level:expr, $($args:tt),*) => {
        match $level {
            tracing::log::Level::Error => tracing::error!($($args),*),
            tracing::log::Level::Warn => tracing::warn!($($args),*),
            tracing::log::Level::Info => tracing::info!($($args),*),
            tracing::log::Level::Debug => tracing::debug!($($args),*),
            tracing::log::Level::Trace => tracing::trace!($($args),*),
        };
    };
}
pub(crate) use log;

/// Renders anyhow errors with their full cause chain on one line, and any
/// other error with its plain `Display`.
pub fn display_error<E: std::fmt::Display + 'static>(e: &E) -> String {
    match (e as &dyn std::any::Any).downcast_ref::<anyhow::Error>() {
        Some(error) => {
            let mut s = format!("{error}");
            for cause in error.chain().skip(1) {
                s.push_str(&format!(", caused by: {cause}"));
            }
            s
        }
        None => format!("{e}"),
    }
}

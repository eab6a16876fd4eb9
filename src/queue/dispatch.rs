use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::envelope::JobEnvelope;
use crate::container::Scope;
use crate::error::JobError;
use crate::short_name;

/// Processes one kind of job.
///
/// Handlers are shared by every in-flight message, so they should hold no
/// per-job state; anything a job needs is resolved from the scope it is
/// given, which lives exactly as long as that one job.
///
/// Delivery is at-least-once: a job may be handled again after a crash or
/// a retry, so handlers must be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// The typed fields of the job. A message whose fields do not
    /// deserialize into this is malformed and dead-lettered.
    type Payload: DeserializeOwned + Debug + Send;

    /// The envelope `type` this handler accepts.
    const JOB_TYPE: &'static str;

    async fn handle(&self, payload: Self::Payload, scope: &Scope) -> anyhow::Result<()>;

    /// The name used to represent the handler in the logs
    fn name(&self) -> String {
        short_name::<Self>()
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn call(&self, envelope: &JobEnvelope, scope: &Scope) -> Result<(), JobError>;
}

#[async_trait]
impl<H: JobHandler> ErasedHandler for H {
    async fn call(&self, envelope: &JobEnvelope, scope: &Scope) -> Result<(), JobError> {
        let payload: H::Payload = envelope.payload_as()?;
        tracing::debug!("{} handling {payload:?}", self.name());
        self.handle(payload, scope)
            .await
            .map_err(|source| JobError::HandlerExecution {
                job_type: envelope.job_type.clone(),
                source,
            })
    }
}

/// Routes envelopes to handlers by their `type`.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler, replacing any previous handler of the same job type.
    pub fn with<H: JobHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn register<H: JobHandler>(&mut self, handler: H) {
        if self
            .handlers
            .insert(H::JOB_TYPE, Arc::new(handler))
            .is_some()
        {
            tracing::warn!("Replaced the handler for job type `{}`", H::JOB_TYPE);
        }
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub async fn dispatch(&self, envelope: &JobEnvelope, scope: &Scope) -> Result<(), JobError> {
        match self.handlers.get(envelope.job_type.as_str()) {
            Some(handler) => handler.call(envelope, scope).await,
            None => Err(JobError::UnknownJobType {
                job_type: envelope.job_type.clone(),
            }),
        }
    }
}

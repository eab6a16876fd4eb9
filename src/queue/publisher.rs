use std::sync::Arc;

use serde::Serialize;

use super::envelope::JobEnvelope;
use super::{Broker, JobClass, OutboundMessage};

/// Producer side: puts new jobs on the primary queue of their class.
#[derive(Clone)]
pub struct JobPublisher {
    broker: Arc<dyn Broker>,
}

impl JobPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publishes a fresh job, with an attempt count of zero.
    pub async fn enqueue(&self, class: &JobClass, envelope: &JobEnvelope) -> anyhow::Result<()> {
        let message = OutboundMessage::new(envelope.to_bytes()?, 0);
        self.broker.publish(&class.name(), message).await?;
        tracing::debug!("Enqueued `{}` job on {class}", envelope.job_type);
        Ok(())
    }

    pub async fn enqueue_job<P: Serialize>(
        &self,
        class: &JobClass,
        job_type: &str,
        payload: &P,
    ) -> anyhow::Result<()> {
        self.enqueue(class, &JobEnvelope::new(job_type, payload)?).await
    }
}

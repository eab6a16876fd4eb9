//! The worker application: collaborators, job handlers, and the wiring that
//! runs one consumer per configured job class.

use std::sync::Arc;

use anyhow::{ensure, Context};
use futures::future::select_all;

use crate::backoff::BackoffConfig;
use crate::config::WorkerConfig;
use crate::container::{Container, Registry};
use crate::queue::{Broker, Dispatcher, JobEnvelope, JobClass, JobPublisher, QueueConsumer};
use crate::Never;

pub mod jobs;
pub mod services;

use jobs::{CapturePaymentHandler, SendEmailHandler, WarmCacheHandler};

/// The registry of every collaborator the handlers use.
pub fn registry(config: &WorkerConfig) -> Registry {
    let mut registry = Registry::new();
    services::register(&mut registry, BackoffConfig::from(&config.backoff));
    registry
}

/// The handlers serving a job class, by its queue name.
pub fn dispatcher(class: &JobClass) -> anyhow::Result<Dispatcher> {
    Ok(match class.name().as_str() {
        "notifications.email" => Dispatcher::new().with(SendEmailHandler),
        "payments.capture" => Dispatcher::new().with(CapturePaymentHandler),
        "cache.warm" => Dispatcher::new().with(WarmCacheHandler),
        other => anyhow::bail!("no handlers are defined for queue {other}"),
    })
}

/// Builds the consumers of every configured job class, sharing one
/// container.
pub fn consumers(
    config: &WorkerConfig,
    broker: Arc<dyn Broker>,
    container: &Container,
) -> anyhow::Result<Vec<QueueConsumer>> {
    config
        .job_classes()
        .into_iter()
        .map(|class| {
            let dispatcher = dispatcher(&class)?;
            Ok(
                QueueConsumer::new(class, broker.clone(), container.clone(), dispatcher)
                    .with_prefetch(config.broker.prefetch),
            )
        })
        .collect()
}

/// Initializes the container, then consumes every configured queue until
/// one of the consumers fails.
pub async fn run_worker(
    config: &WorkerConfig,
    broker: Arc<dyn Broker>,
    container: Container,
) -> anyhow::Result<Never> {
    container
        .initialize()
        .await
        .context("initializing services")?;
    let consumers = consumers(config, broker, &container)?;
    ensure!(!consumers.is_empty(), "no queues are configured");

    let runs = consumers.iter().map(|consumer| Box::pin(consumer.run()));
    let (result, index, _) = select_all(runs).await;
    result.with_context(|| format!("consumer of {} stopped", consumers[index].class()))
}

/// Validates `body` as a job envelope and publishes it to `queue`.
pub async fn enqueue(
    config: &WorkerConfig,
    broker: Arc<dyn Broker>,
    queue: &str,
    body: &str,
) -> anyhow::Result<()> {
    let class = config
        .job_class(queue)
        .with_context(|| format!("{queue} is not a configured queue"))?;
    let envelope = JobEnvelope::parse(body.as_bytes())?;
    let handlers = dispatcher(&class)?;
    ensure!(
        handlers.job_types().contains(&envelope.job_type.as_str()),
        "{queue} has no handler for `{}` jobs (expected one of {:?})",
        envelope.job_type,
        handlers.job_types()
    );
    broker.declare(&class.topology()).await?;
    JobPublisher::new(broker).enqueue(&class, &envelope).await
}

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{bail, ensure};
use futures::{FutureExt, TryStreamExt};
use tracing::Instrument;

use super::dispatch::Dispatcher;
use super::envelope::JobEnvelope;
use super::escalation::{DeadLetterReason, Disposition, RetryPolicy};
use super::{
    Broker, Delivery, JobClass, OutboundMessage, QueueTopology, DEAD_LETTERED_AT_HEADER,
    DEAD_LETTER_REASON_HEADER, LAST_ERROR_HEADER,
};
use crate::container::{Container, Scope};
use crate::error::JobError;
use crate::time::{Clock, SystemClock};
use crate::{panic_message, Never};

/// How a delivery was settled. Every settled delivery has been acked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Succeeded,
    /// Re-published to the retry buffer carrying this attempt count.
    RetryRouted { attempt_count: u32 },
    DeadLettered(DeadLetterReason),
}

/// Consumes the primary queue of one job class, running each message in its
/// own container scope and routing failures through the retry policy.
pub struct QueueConsumer {
    class: JobClass,
    topology: QueueTopology,
    policy: RetryPolicy,
    broker: Arc<dyn Broker>,
    container: Container,
    dispatcher: Dispatcher,
    prefetch: u16,
    clock: Arc<dyn Clock>,
}

impl QueueConsumer {
    pub fn new(
        class: JobClass,
        broker: Arc<dyn Broker>,
        container: Container,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            topology: class.topology(),
            policy: class.retry_policy(),
            class,
            broker,
            container,
            dispatcher,
            prefetch: 1,
            clock: Arc::new(SystemClock),
        }
    }

    /// Maximum number of messages in flight at once. Zero is treated as one.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Source of the `x-dead-lettered-at` timestamp.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn class(&self) -> &JobClass {
        &self.class
    }

    /// Declares the primary, retry and dead-letter queues of the class.
    pub async fn declare(&self) -> anyhow::Result<()> {
        self.broker.declare(&self.topology).await?;
        tracing::info!(
            "Declared {} with retry buffer {} ({:?}) and dead-letter queue {}",
            self.topology.primary,
            self.topology.retry,
            self.topology.retry_delay,
            self.topology.dead_letter
        );
        Ok(())
    }

    /// Declares the topology and processes messages until the broker fails.
    ///
    /// Job failures are settled through the retry policy and never end the
    /// loop. A failure to publish or ack, or the end of the delivery stream,
    /// is returned as an error; the caller is expected to exit.
    pub async fn run(&self) -> anyhow::Result<Never> {
        ensure!(
            self.container.is_initialized(),
            "the container must be initialized before consuming {}",
            self.class
        );
        self.declare().await?;
        let deliveries = self
            .broker
            .consume(&self.topology.primary, self.prefetch)
            .await?;
        tracing::info!(
            "Consuming {} ({} handlers, prefetch {}, max retries {})",
            self.topology.primary,
            self.dispatcher.job_types().len(),
            self.prefetch,
            self.policy.max_retries
        );
        deliveries
            .try_for_each_concurrent(usize::from(self.prefetch), |delivery| async move {
                self.process(delivery.as_ref()).await.map(|_| ())
            })
            .await?;
        bail!("the delivery stream of {} ended", self.topology.primary)
    }

    /// Handles one delivery end to end: scope, parse, dispatch, escalation,
    /// disposal, ack.
    ///
    /// Errors only when the broker could not take the follow-up publish or
    /// the ack; the message is then left unacknowledged for redelivery.
    pub async fn process(&self, delivery: &dyn Delivery) -> anyhow::Result<Settlement> {
        let attempt_count = delivery.attempt_count();
        let span = tracing::info_span!(
            "job",
            queue = %self.topology.primary,
            job_type = tracing::field::Empty,
            attempt = attempt_count,
        );
        async {
            let scope = self.container.create_scope();
            let outcome = self.execute(delivery.body(), &scope).await;
            scope.dispose().await;

            let settlement = match outcome {
                Ok(()) => {
                    tracing::debug!("Job succeeded");
                    Settlement::Succeeded
                }
                Err(error) => self.settle_failure(delivery, &error, attempt_count).await?,
            };
            delivery.ack().await?;
            Ok(settlement)
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, body: &[u8], scope: &Scope) -> Result<(), JobError> {
        let envelope = JobEnvelope::parse(body)?;
        tracing::Span::current().record("job_type", envelope.job_type.as_str());
        match AssertUnwindSafe(self.dispatcher.dispatch(&envelope, scope))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(JobError::HandlerExecution {
                job_type: envelope.job_type.clone(),
                source: anyhow::anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    async fn settle_failure(
        &self,
        delivery: &dyn Delivery,
        error: &JobError,
        attempt_count: u32,
    ) -> anyhow::Result<Settlement> {
        let last_error = error.to_string();
        match self.policy.escalate(error, attempt_count) {
            Disposition::Retry { attempt_count } => {
                tracing::warn!(
                    "Job failed, retry {attempt_count}/{} in {:?}: {last_error}",
                    self.policy.max_retries,
                    self.topology.retry_delay
                );
                let message = OutboundMessage::new(delivery.body().to_vec(), attempt_count)
                    .annotate(LAST_ERROR_HEADER, last_error);
                self.broker.publish(&self.topology.retry, message).await?;
                Ok(Settlement::RetryRouted { attempt_count })
            }
            Disposition::DeadLetter(reason) => {
                tracing::error!(
                    "Dead-lettering job ({}) after {} attempts: {last_error}",
                    reason.as_str(),
                    attempt_count + 1
                );
                let message = OutboundMessage::new(delivery.body().to_vec(), attempt_count)
                    .annotate(DEAD_LETTER_REASON_HEADER, reason.as_str())
                    .annotate(LAST_ERROR_HEADER, last_error)
                    .annotate(
                        DEAD_LETTERED_AT_HEADER,
                        self.clock.current_timestamp().to_string(),
                    );
                self.broker
                    .publish(&self.topology.dead_letter, message)
                    .await?;
                Ok(Settlement::DeadLettered(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::Deserialize;

    use super::*;
    use crate::container::{Dispose, Instance, Registry};
    use crate::queue::memory::InMemoryBroker;
    use crate::queue::{Deliveries, JobHandler};
    use crate::time::FixedClock;

    struct TestDelivery {
        body: Vec<u8>,
        attempt_count: u32,
        acked: AtomicBool,
    }

    impl TestDelivery {
        fn new(body: &str, attempt_count: u32) -> Self {
            Self {
                body: body.as_bytes().to_vec(),
                attempt_count,
                acked: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Delivery for TestDelivery {
        fn body(&self) -> &[u8] {
            &self.body
        }

        fn attempt_count(&self) -> u32 {
            self.attempt_count
        }

        async fn ack(&self) -> anyhow::Result<()> {
            self.acked.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Unit {
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dispose for Unit {
        async fn dispose(&self) -> anyhow::Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Panics while being disposed.
    struct Fragile;

    #[async_trait]
    impl Dispose for Fragile {
        async fn dispose(&self) -> anyhow::Result<()> {
            panic!("pool already torn down")
        }
    }

    #[derive(Debug, Deserialize)]
    struct Flaky {
        outcome: String,
    }

    struct FlakyHandler;

    #[async_trait]
    impl JobHandler for FlakyHandler {
        type Payload = Flaky;
        const JOB_TYPE: &'static str = "flaky";

        async fn handle(&self, payload: Flaky, scope: &Scope) -> anyhow::Result<()> {
            scope.resolve::<Unit>("unit").await?;
            match payload.outcome.as_str() {
                "ok" => Ok(()),
                "fragile" => {
                    scope.resolve::<Fragile>("fragile").await?;
                    Ok(())
                }
                "panic" => panic!("boom"),
                other => bail!("{other}"),
            }
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        consumer: QueueConsumer,
        disposed: Arc<AtomicUsize>,
    }

    async fn fixture(max_retries: u32) -> Fixture {
        let disposed = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        let counter = disposed.clone();
        registry.scoped("unit", move |_| {
            let disposed = counter.clone();
            async move { Ok(Instance::disposable(Unit { disposed })) }
        });
        registry.scoped("fragile", |_| async { Ok(Instance::disposable(Fragile)) });
        let container = Container::new(registry);
        container.initialize().await.unwrap();

        let broker = InMemoryBroker::new();
        let consumer = QueueConsumer::new(
            JobClass::new("test", "flaky", max_retries),
            Arc::new(broker.clone()),
            container,
            Dispatcher::new().with(FlakyHandler),
        )
        .with_clock(Arc::new(FixedClock(1_700_000_000)));
        consumer.declare().await.unwrap();
        Fixture {
            broker,
            consumer,
            disposed,
        }
    }

    #[tokio::test]
    async fn success_acks_and_disposes_the_scope() {
        let f = fixture(3).await;
        let delivery = TestDelivery::new(r#"{"type":"flaky","outcome":"ok"}"#, 0);
        assert_eq!(Settlement::Succeeded, f.consumer.process(&delivery).await.unwrap());
        assert!(delivery.acked.load(Ordering::SeqCst));
        assert_eq!(1, f.disposed.load(Ordering::SeqCst));
        assert!(f.broker.published("test.flaky.retry").is_empty());
        assert!(f.broker.published("test.flaky.dlq").is_empty());
    }

    #[tokio::test]
    async fn failure_below_the_limit_goes_to_the_retry_buffer() {
        let f = fixture(3).await;
        let delivery = TestDelivery::new(r#"{"type":"flaky","outcome":"timeout"}"#, 1);
        assert_eq!(
            Settlement::RetryRouted { attempt_count: 2 },
            f.consumer.process(&delivery).await.unwrap()
        );
        assert!(delivery.acked.load(Ordering::SeqCst));
        assert_eq!(1, f.disposed.load(Ordering::SeqCst));

        let retried = f.broker.published("test.flaky.retry");
        assert_eq!(1, retried.len());
        assert_eq!(2, retried[0].attempt_count);
        assert_eq!(delivery.body, retried[0].body);
        assert!(retried[0].annotations[LAST_ERROR_HEADER].contains("timeout"));
    }

    #[tokio::test]
    async fn failure_at_the_limit_is_dead_lettered_with_annotations() {
        let f = fixture(3).await;
        let delivery = TestDelivery::new(r#"{"type":"flaky","outcome":"timeout"}"#, 3);
        assert_eq!(
            Settlement::DeadLettered(DeadLetterReason::RetriesExhausted),
            f.consumer.process(&delivery).await.unwrap()
        );
        let dead = f.broker.published("test.flaky.dlq");
        assert_eq!(1, dead.len());
        assert_eq!(3, dead[0].attempt_count);
        assert_eq!("retries-exhausted", dead[0].annotations[DEAD_LETTER_REASON_HEADER]);
        assert_eq!("1700000000", dead[0].annotations[DEAD_LETTERED_AT_HEADER]);
        assert!(f.broker.published("test.flaky.retry").is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_skip_retries() {
        let f = fixture(3).await;
        for (body, reason) in [
            ("{not json", DeadLetterReason::Malformed),
            (r#"{"type":"flaky"}"#, DeadLetterReason::Malformed),
            (r#"{"type":"refund","id":1}"#, DeadLetterReason::Unroutable),
        ] {
            let delivery = TestDelivery::new(body, 0);
            assert_eq!(
                Settlement::DeadLettered(reason),
                f.consumer.process(&delivery).await.unwrap()
            );
            assert!(delivery.acked.load(Ordering::SeqCst));
        }
        assert_eq!(3, f.broker.published("test.flaky.dlq").len());
        assert!(f.broker.published("test.flaky.retry").is_empty());
    }

    #[tokio::test]
    async fn panicking_handler_is_a_retryable_failure() {
        let f = fixture(3).await;
        let delivery = TestDelivery::new(r#"{"type":"flaky","outcome":"panic"}"#, 0);
        assert_eq!(
            Settlement::RetryRouted { attempt_count: 1 },
            f.consumer.process(&delivery).await.unwrap()
        );
        assert_eq!(1, f.disposed.load(Ordering::SeqCst));
        let retried = f.broker.published("test.flaky.retry");
        assert!(retried[0].annotations[LAST_ERROR_HEADER].contains("boom"));
    }

    struct RejectingBroker;

    #[async_trait]
    impl Broker for RejectingBroker {
        async fn declare(&self, _topology: &QueueTopology) -> anyhow::Result<()> {
            Ok(())
        }

        async fn consume(&self, queue: &str, _prefetch: u16) -> anyhow::Result<Deliveries> {
            bail!("channel closed while consuming {queue}")
        }

        async fn publish(&self, queue: &str, _message: OutboundMessage) -> anyhow::Result<()> {
            bail!("publish to {queue} was nacked")
        }
    }

    #[tokio::test]
    async fn failed_republish_leaves_the_message_unacked() {
        let container = Container::new(Registry::new());
        container.initialize().await.unwrap();
        let consumer = QueueConsumer::new(
            JobClass::new("test", "flaky", 3),
            Arc::new(RejectingBroker),
            container,
            Dispatcher::new(),
        );
        let delivery = TestDelivery::new(r#"{"type":"flaky","outcome":"ok"}"#, 0);
        assert!(consumer.process(&delivery).await.is_err());
        assert!(!delivery.acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn refuses_to_run_before_initialization() {
        let consumer = QueueConsumer::new(
            JobClass::new("test", "flaky", 3),
            Arc::new(InMemoryBroker::new()),
            Container::new(Registry::new()),
            Dispatcher::new(),
        );
        assert!(consumer.run().await.is_err());
    }

    #[tokio::test]
    async fn run_settles_messages_until_the_stream_ends() {
        let f = fixture(1).await;
        let broker = f.broker.clone();
        let topology = JobClass::new("test", "flaky", 1)
            .with_retry_delay(Duration::from_millis(1))
            .topology();
        let worker = tokio::spawn(async move { f.consumer.run().await.map(|_| ()) });

        for outcome in ["ok", "bad"] {
            let body = format!(r#"{{"type":"flaky","outcome":"{outcome}"}}"#);
            broker
                .publish(&topology.primary, OutboundMessage::new(body.into_bytes(), 0))
                .await
                .unwrap();
        }
        broker.wait_for_acks(2).await;
        broker.shutdown();

        assert!(worker.await.unwrap().is_err());
        assert_eq!(1, broker.published(&topology.retry).len());
    }

    #[tokio::test]
    async fn panicking_dispose_hook_still_settles_and_acks() {
        let f = fixture(3).await;
        let delivery = TestDelivery::new(r#"{"type":"flaky","outcome":"fragile"}"#, 0);
        assert_eq!(Settlement::Succeeded, f.consumer.process(&delivery).await.unwrap());
        assert!(delivery.acked.load(Ordering::SeqCst));
        // the other scoped instance is still disposed
        assert_eq!(1, f.disposed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panicking_dispose_hook_does_not_stop_the_consumer() {
        let f = fixture(3).await;
        let broker = f.broker.clone();
        let primary = f.consumer.class().topology().primary;
        let worker = tokio::spawn(async move { f.consumer.run().await.map(|_| ()) });

        for outcome in ["fragile", "ok"] {
            let body = format!(r#"{{"type":"flaky","outcome":"{outcome}"}}"#);
            broker
                .publish(&primary, OutboundMessage::new(body.into_bytes(), 0))
                .await
                .unwrap();
        }
        broker.wait_for_acks(2).await;
        assert!(!worker.is_finished());
        assert_eq!(2, broker.acked(&primary).len());

        broker.shutdown();
        assert!(worker.await.unwrap().is_err());
    }

    #[derive(Debug, Deserialize)]
    struct Slow {}

    /// Records the highest number of calls in flight at once.
    #[derive(Default)]
    struct SlowHandler {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for SlowHandler {
        type Payload = Slow;
        const JOB_TYPE: &'static str = "slow";

        async fn handle(&self, _payload: Slow, _scope: &Scope) -> anyhow::Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn in_flight_jobs_never_exceed_the_prefetch_window() {
        let container = Container::new(Registry::new());
        container.initialize().await.unwrap();
        let broker = InMemoryBroker::new();
        let handler = SlowHandler::default();
        let peak = handler.peak.clone();
        let consumer = QueueConsumer::new(
            JobClass::new("test", "slow", 0),
            Arc::new(broker.clone()),
            container,
            Dispatcher::new().with(handler),
        )
        .with_prefetch(2);
        consumer.declare().await.unwrap();

        let topology = consumer.class().topology();
        for _ in 0..5 {
            broker
                .publish(
                    &topology.primary,
                    OutboundMessage::new(br#"{"type":"slow"}"#.to_vec(), 0),
                )
                .await
                .unwrap();
        }
        let worker = tokio::spawn(async move { consumer.run().await.map(|_| ()) });

        broker.wait_for_acks(5).await;
        assert_eq!(2, peak.load(Ordering::SeqCst));
        assert!(broker.published(&topology.dead_letter).is_empty());

        broker.shutdown();
        assert!(worker.await.unwrap().is_err());
    }
}

//! Job Frame is an asynchronous job-processing framework: a runtime
//! dependency container with lifetime-scoped services, composed with a
//! message-queue consumer that retries failing jobs a bounded number of times
//! before quarantining them in a dead-letter queue.
//!
//! At startup, the container checks the declared dependency graph for cycles,
//! then constructs and initializes every singleton. Each job message then gets
//! its own scope: the handler resolves what it needs through the scope, and
//! the scope's services are disposed once the message is settled, whatever
//! the outcome.
//!
//! Delivery is at-least-once. Handlers must tolerate seeing the same job
//! twice.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use serde::Deserialize;
//!
//! use job_frame::{
//!     container::{Container, Instance, Registry, Scope},
//!     queue::{memory::InMemoryBroker, Dispatcher, JobClass, JobHandler, QueueConsumer},
//!     Never,
//! };
//!
//! pub struct Greeter {
//!     greeting: String,
//! }
//!
//! #[derive(Debug, Deserialize)]
//! pub struct Greet {
//!     name: String,
//! }
//!
//! pub struct GreetHandler;
//!
//! #[async_trait]
//! impl JobHandler for GreetHandler {
//!     type Payload = Greet;
//!     const JOB_TYPE: &'static str = "greet";
//!
//!     async fn handle(&self, payload: Greet, scope: &Scope) -> anyhow::Result<()> {
//!         let greeter = scope.resolve::<Greeter>("greeter").await?;
//!         println!("{}, {}", greeter.greeting, payload.name);
//!         Ok(())
//!     }
//! }
//!
//! async fn tokio_main() -> anyhow::Result<Never> {
//!     let mut registry = Registry::new();
//!     registry.singleton("greeter", |_| async {
//!         Ok(Instance::new(Greeter { greeting: "hello".into() }))
//!     });
//!     let container = Container::new(registry);
//!     container.initialize().await?;
//!
//!     // Jobs of this class are attempted at most 4 times.
//!     let class = JobClass::new("greetings", "send", 3);
//!     let consumer = QueueConsumer::new(
//!         class,
//!         Arc::new(InMemoryBroker::new()),
//!         container,
//!         Dispatcher::new().with(GreetHandler),
//!     );
//!     consumer.run().await
//! }
//! ```

/// The worker application built on the framework.
pub mod app;
/// Exponential backoff with jitter for retrying a flaky call inside a job.
pub mod backoff;
/// Layered worker configuration.
pub mod config;
/// Dependency container with singleton, scoped and transient lifetimes.
pub mod container;
/// Simple and versatile error handling and logging.
pub mod error;
/// Subscriber setup for the binary.
pub mod logging;
/// Consuming job messages with bounded retries and dead-lettering.
pub mod queue;
/// Clock dependencies that are easily swapped out and mocked, to reduce direct dependencies on syscalls.
pub mod time;

/// misc items that are too small to get their own files,
/// kept out of this file to reduce clutter.
mod util;
pub use util::*;

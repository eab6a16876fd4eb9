//! Collaborators the job handlers resolve from the container.
//!
//! The store, cache and mail transport stand in for external systems; only
//! their connect hooks and the calls the handlers make are modelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::ensure;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backoff::{Backoff, BackoffConfig};
use crate::container::{Dispose, Initialize, Instance, Registry};

pub const STORE: &str = "store";
pub const CACHE: &str = "cache";
pub const MAILER: &str = "mailer";
pub const BACKOFF: &str = "backoff";
pub const PAYMENT_GATEWAY: &str = "payment_gateway";
pub const PAYMENT_ORCHESTRATOR: &str = "payment_orchestrator";

/// Registers every collaborator with its lifetime and declared
/// dependencies. Callers may register a key again afterwards to substitute
/// an implementation.
pub fn register(registry: &mut Registry, backoff: BackoffConfig) {
    registry.singleton(STORE, |_| async { Ok(Instance::initializable(Store::default())) });
    registry.singleton(CACHE, |_| async { Ok(Instance::initializable(Cache::default())) });
    registry.singleton(MAILER, |_| async { Ok(Instance::new(Mailer::default())) });
    registry.singleton(BACKOFF, move |_| {
        let backoff = Backoff::new(backoff.clone());
        async move { Ok(Instance::new(backoff)) }
    });
    registry.transient(PAYMENT_GATEWAY, |_| async {
        let gateway: SharedGateway = Arc::new(SandboxGateway);
        Ok(Instance::new(gateway))
    });
    registry
        .scoped(PAYMENT_ORCHESTRATOR, |resolver| async move {
            Ok(Instance::disposable(PaymentOrchestrator {
                gateway: resolver.resolve::<SharedGateway>(PAYMENT_GATEWAY).await?,
                store: resolver.resolve::<Store>(STORE).await?,
                backoff: resolver.resolve::<Backoff>(BACKOFF).await?,
                audit: Mutex::new(vec![]),
            }))
        })
        .depends_on([PAYMENT_GATEWAY, STORE, BACKOFF]);
}

/// Durable application state.
#[derive(Default)]
pub struct Store {
    connected: AtomicBool,
    captures: Mutex<HashMap<String, Capture>>,
    records: Mutex<HashMap<String, String>>,
    audit: Mutex<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capture {
    pub capture_id: String,
    pub amount_cents: u64,
}

#[async_trait]
impl Initialize for Store {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::Release);
        tracing::info!("Store connected");
        Ok(())
    }
}

impl Store {
    fn ensure_connected(&self) -> anyhow::Result<()> {
        ensure!(
            self.connected.load(Ordering::Acquire),
            "store is not connected"
        );
        Ok(())
    }

    pub fn capture(&self, payment_id: &str) -> anyhow::Result<Option<Capture>> {
        self.ensure_connected()?;
        Ok(self.captures.lock().get(payment_id).cloned())
    }

    /// Returns false if the payment already had a capture, which is kept.
    pub fn record_capture(&self, payment_id: &str, capture: Capture) -> anyhow::Result<bool> {
        self.ensure_connected()?;
        let mut captures = self.captures.lock();
        if captures.contains_key(payment_id) {
            return Ok(false);
        }
        captures.insert(payment_id.to_string(), capture);
        Ok(true)
    }

    pub fn record(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.ensure_connected()?;
        Ok(self.records.lock().get(key).cloned())
    }

    pub fn put_record(&self, key: &str, value: impl Into<String>) -> anyhow::Result<()> {
        self.ensure_connected()?;
        self.records.lock().insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn append_audit(&self, entries: impl IntoIterator<Item = String>) -> anyhow::Result<()> {
        self.ensure_connected()?;
        self.audit.lock().extend(entries);
        Ok(())
    }

    pub fn audit_log(&self) -> Vec<String> {
        self.audit.lock().clone()
    }
}

/// Read-through cache in front of the store.
#[derive(Default)]
pub struct Cache {
    connected: AtomicBool,
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl Initialize for Cache {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::Release);
        tracing::info!("Cache connected");
        Ok(())
    }
}

impl Cache {
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: &str, value: String) -> anyhow::Result<()> {
        ensure!(
            self.connected.load(Ordering::Acquire),
            "cache is not connected"
        );
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail transport. Sent mail is kept in an outbox.
#[derive(Default)]
pub struct Mailer {
    outbox: Mutex<Vec<Email>>,
}

impl Mailer {
    pub async fn send(&self, email: Email) -> anyhow::Result<()> {
        ensure!(
            email.to.contains('@'),
            "`{}` is not a deliverable address",
            email.to
        );
        tracing::info!("Sending \"{}\" to {}", email.subject, email.to);
        self.outbox.lock().push(email);
        Ok(())
    }

    pub fn outbox(&self) -> Vec<Email> {
        self.outbox.lock().clone()
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Captures an authorized payment, returning the gateway's capture id.
    /// Failures the caller may retry carry a
    /// [`TransientIoError`](crate::error::TransientIoError).
    async fn capture(&self, payment_id: &str, amount_cents: u64) -> anyhow::Result<String>;
}

/// How a gateway is stored in the container.
pub type SharedGateway = Arc<dyn PaymentGateway>;

/// Approves every capture without leaving the process.
pub struct SandboxGateway;

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn capture(&self, payment_id: &str, amount_cents: u64) -> anyhow::Result<String> {
        ensure!(amount_cents > 0, "gateway refused a zero amount capture");
        Ok(format!("cap_{payment_id}"))
    }
}

/// Per-job payment workflow. Captures at most once per payment and flushes
/// its audit trail to the store when the job's scope is disposed.
pub struct PaymentOrchestrator {
    gateway: Arc<SharedGateway>,
    store: Arc<Store>,
    backoff: Arc<Backoff>,
    audit: Mutex<Vec<String>>,
}

impl PaymentOrchestrator {
    pub async fn capture(&self, payment_id: &str, amount_cents: u64) -> anyhow::Result<Capture> {
        if let Some(existing) = self.store.capture(payment_id)? {
            self.note(format!("{payment_id}: already captured as {}", existing.capture_id));
            return Ok(existing);
        }
        let capture_id = self
            .backoff
            .retry_transient("payment capture", || {
                self.gateway.capture(payment_id, amount_cents)
            })
            .await?;
        let capture = Capture {
            capture_id,
            amount_cents,
        };
        if !self.store.record_capture(payment_id, capture.clone())? {
            // another delivery of the same job won the race
            return self
                .store
                .capture(payment_id)?
                .ok_or_else(|| anyhow::anyhow!("capture of {payment_id} vanished"));
        }
        self.note(format!(
            "{payment_id}: captured {amount_cents} as {}",
            capture.capture_id
        ));
        Ok(capture)
    }

    fn note(&self, entry: String) {
        self.audit.lock().push(entry);
    }
}

#[async_trait]
impl Dispose for PaymentOrchestrator {
    async fn dispose(&self) -> anyhow::Result<()> {
        let entries = std::mem::take(&mut *self.audit.lock());
        self.store.append_audit(entries)
    }
}

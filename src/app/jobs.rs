use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::services::{
    Cache, Email, Mailer, PaymentOrchestrator, Store, BACKOFF, CACHE, MAILER,
    PAYMENT_ORCHESTRATOR, STORE,
};
use crate::backoff::Backoff;
use crate::container::Scope;
use crate::queue::JobHandler;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendEmail {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

pub struct SendEmailHandler;

#[async_trait]
impl JobHandler for SendEmailHandler {
    type Payload = SendEmail;
    const JOB_TYPE: &'static str = "send_email";

    async fn handle(&self, payload: SendEmail, scope: &Scope) -> anyhow::Result<()> {
        let mailer = scope.resolve::<Mailer>(MAILER).await?;
        let backoff = scope.resolve::<Backoff>(BACKOFF).await?;
        let email = Email {
            to: payload.to,
            subject: payload.subject,
            body: payload.body,
        };
        backoff
            .retry_transient("send email", || mailer.send(email.clone()))
            .await
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapturePayment {
    pub payment_id: String,
    pub amount_cents: u64,
}

/// Safe to redeliver: a payment that already has a capture is not captured
/// again.
pub struct CapturePaymentHandler;

#[async_trait]
impl JobHandler for CapturePaymentHandler {
    type Payload = CapturePayment;
    const JOB_TYPE: &'static str = "capture_payment";

    async fn handle(&self, payload: CapturePayment, scope: &Scope) -> anyhow::Result<()> {
        let orchestrator = scope
            .resolve::<PaymentOrchestrator>(PAYMENT_ORCHESTRATOR)
            .await?;
        let capture = orchestrator
            .capture(&payload.payment_id, payload.amount_cents)
            .await?;
        tracing::info!(
            "Payment {} captured as {}",
            payload.payment_id,
            capture.capture_id
        );
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarmCache {
    pub keys: Vec<String>,
}

/// Copies store records into the cache. Keys without a record are skipped.
pub struct WarmCacheHandler;

#[async_trait]
impl JobHandler for WarmCacheHandler {
    type Payload = WarmCache;
    const JOB_TYPE: &'static str = "warm_cache";

    async fn handle(&self, payload: WarmCache, scope: &Scope) -> anyhow::Result<()> {
        let store: Arc<Store> = scope.resolve(STORE).await?;
        let cache: Arc<Cache> = scope.resolve(CACHE).await?;
        let mut warmed = 0;
        for key in &payload.keys {
            match store.record(key)? {
                Some(value) => {
                    cache.put(key, value)?;
                    warmed += 1;
                }
                None => tracing::debug!("No record for {key}, not caching it"),
            }
        }
        tracing::info!("Warmed {warmed} of {} cache keys", payload.keys.len());
        Ok(())
    }
}

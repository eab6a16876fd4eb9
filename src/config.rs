//! Worker settings, layered from built-in defaults, an optional file and
//! `JOB_FRAME__`-prefixed environment variables (`JOB_FRAME__BROKER__URL`).

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::Deserialize;

use crate::backoff::BackoffConfig;
use crate::queue::JobClass;

const DEFAULTS: &str = include_str!("../config/default.toml");

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub broker: BrokerSettings,
    pub queues: Vec<QueueSettings>,
    pub backoff: BackoffSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BrokerSettings {
    pub url: String,
    /// Unacknowledged messages per consumer, which is also the number of jobs
    /// a consumer runs concurrently.
    pub prefetch: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct QueueSettings {
    pub domain: String,
    pub action: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BackoffSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl WorkerConfig {
    /// Loads and validates the configuration. `path`, when given, must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder().add_source(::config::File::from_str(
            DEFAULTS,
            ::config::FileFormat::Toml,
        ));
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        builder =
            builder.add_source(::config::Environment::with_prefix("JOB_FRAME").separator("__"));

        let config: Self = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .context("loading worker configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.broker.prefetch > 0, "broker.prefetch must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.backoff.jitter_factor),
            "backoff.jitter_factor must be within [0, 1], got {}",
            self.backoff.jitter_factor
        );
        ensure!(
            self.backoff.base_delay_ms <= self.backoff.max_delay_ms,
            "backoff.base_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
            self.backoff.base_delay_ms,
            self.backoff.max_delay_ms
        );
        let mut seen = HashSet::new();
        for queue in &self.queues {
            ensure!(
                !queue.domain.is_empty() && !queue.action.is_empty(),
                "queue domain and action must not be empty"
            );
            let name = format!("{}.{}", queue.domain, queue.action);
            ensure!(seen.insert(name.clone()), "queue {name} is configured twice");
        }
        Ok(())
    }

    pub fn job_classes(&self) -> Vec<JobClass> {
        self.queues.iter().map(QueueSettings::job_class).collect()
    }

    /// The configured class whose primary queue is `name`.
    pub fn job_class(&self, name: &str) -> Option<JobClass> {
        self.job_classes().into_iter().find(|class| class.name() == name)
    }
}

impl QueueSettings {
    pub fn job_class(&self) -> JobClass {
        JobClass::new(&self.domain, &self.action, self.max_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
    }
}

impl From<&BackoffSettings> for BackoffConfig {
    fn from(settings: &BackoffSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter_factor: settings.jitter_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> WorkerConfig {
        WorkerConfig::load(None).unwrap()
    }

    #[test]
    fn built_in_defaults_describe_the_three_job_classes() {
        let config = defaults();
        assert_eq!(8, config.broker.prefetch);
        let classes: Vec<_> = config
            .job_classes()
            .iter()
            .map(|class| (class.name(), class.max_retries))
            .collect();
        assert_eq!(
            vec![
                ("notifications.email".to_string(), 3),
                ("payments.capture".to_string(), 10),
                ("cache.warm".to_string(), 1),
            ],
            classes
        );
        assert_eq!(
            Duration::from_secs(60),
            config.job_class("payments.capture").unwrap().retry_delay
        );
        assert!(config.job_class("payments.refund").is_none());
        assert_eq!(BackoffConfig::default(), BackoffConfig::from(&config.backoff));
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let mut config = defaults();
        config.broker.prefetch = 0;
        assert!(config.validate().is_err());

        let mut config = defaults();
        config.backoff.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = defaults();
        config.backoff.base_delay_ms = 10_000;
        assert!(config.validate().is_err());

        let mut config = defaults();
        config.queues.push(config.queues[0].clone());
        assert!(config.validate().is_err());
    }
}

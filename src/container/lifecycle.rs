use async_trait::async_trait;

/// Post-construction hook, run once right after the factory returns.
///
/// Singletons are constructed by `Container::initialize`, so this is where
/// connectors open their connections during startup. A failing hook aborts
/// startup.
#[async_trait]
pub trait Initialize: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()>;
}

/// Teardown hook, run when the scope that owns the instance is disposed.
///
/// Errors are logged and do not stop the remaining instances from being
/// disposed.
#[async_trait]
pub trait Dispose: Send + Sync {
    async fn dispose(&self) -> anyhow::Result<()>;
}

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::error::{ContainerError, ContainerResult};
use super::registry::Instance;
use super::{Container, Resolver, ServiceKey};
use crate::error::LogError;
use crate::panic_message;

/// A child of the root container bound to one unit of work.
///
/// Scoped services are built lazily, at most once per scope, and disposed
/// together by [`Scope::dispose`]. Singletons come from the root container;
/// transients are built fresh with a resolver bound to this scope, so they
/// may depend on scoped services.
///
/// Cloning yields another handle to the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    id: u64,
    container: Container,
    cells: Mutex<HashMap<ServiceKey, Arc<OnceCell<Instance>>>>,
    /// Scoped instances in creation order.
    created: Mutex<Vec<(ServiceKey, Instance)>>,
    disposed: AtomicBool,
}

impl Scope {
    pub(crate) fn new(container: Container, id: u64) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id,
                container,
                cells: Mutex::new(HashMap::new()),
                created: Mutex::new(vec![]),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn container(&self) -> &Container {
        &self.inner.container
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::scoped(self.clone())
    }

    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> ContainerResult<Arc<T>> {
        let key = key.into();
        self.ensure_live(&key)?;
        self.resolver().resolve(key).await
    }

    pub async fn resolve_optional<T: Send + Sync + 'static>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> ContainerResult<Option<Arc<T>>> {
        let key = key.into();
        self.ensure_live(&key)?;
        self.resolver().resolve_optional(key).await
    }

    /// Number of scoped instances built in this scope so far.
    pub fn len(&self) -> usize {
        self.inner.created.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Runs the `Dispose` hook of every scoped instance built in this scope,
    /// newest first, then empties the scope. Returns how many hooks ran.
    /// A hook that fails or panics is logged and the rest still run.
    ///
    /// Call exactly once per unit of work; later calls do nothing.
    pub async fn dispose(&self) -> usize {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            tracing::warn!("Scope {} was already disposed", self.inner.id);
            return 0;
        }
        let created = std::mem::take(&mut *self.inner.created.lock());
        self.inner.cells.lock().clear();

        let mut hooks = 0;
        for (key, instance) in created.into_iter().rev() {
            if let Some(disposer) = &instance.disposer {
                hooks += 1;
                AssertUnwindSafe(disposer.dispose())
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(anyhow::anyhow!(
                            "dispose hook panicked: {}",
                            panic_message(panic.as_ref())
                        ))
                    })
                    .log_with_context(|| format!("disposing `{key}` in scope {}", self.inner.id));
            }
        }
        tracing::trace!("Disposed scope {} ({hooks} hooks)", self.inner.id);
        hooks
    }

    pub(crate) fn ensure_live(&self, key: &ServiceKey) -> ContainerResult<()> {
        if self.is_disposed() {
            return Err(ContainerError::ScopeDisposed {
                scope: self.inner.id,
                key: key.clone(),
            });
        }
        Ok(())
    }

    /// Returns the scope's instance for `key`, building it with `create` on
    /// first use. Concurrent first uses build it once.
    pub(crate) async fn get_or_create<F, Fut>(
        &self,
        key: &ServiceKey,
        create: F,
    ) -> ContainerResult<Instance>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ContainerResult<Instance>>,
    {
        let cell = self
            .inner
            .cells
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let instance = cell
            .get_or_try_init(|| async {
                let instance = create().await?;
                self.inner
                    .created
                    .lock()
                    .push((key.clone(), instance.clone()));
                Ok::<_, ContainerError>(instance)
            })
            .await?;
        Ok(instance.clone())
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let undisposed = self.created.get_mut().len();
        if !*self.disposed.get_mut() && undisposed > 0 {
            tracing::warn!(
                "Scope {} dropped without dispose; {undisposed} scoped instances skipped their dispose hooks",
                self.id
            );
        }
    }
}

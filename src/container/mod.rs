//! A runtime dependency container with three service lifetimes.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use job_frame::container::{Container, Instance, Registry};
//!
//! struct Config {
//!     dsn: String,
//! }
//!
//! struct Repository {
//!     config: Arc<Config>,
//! }
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let mut registry = Registry::new();
//! registry.singleton("config", |_| async {
//!     Ok(Instance::new(Config { dsn: "postgres://localhost".into() }))
//! });
//! registry
//!     .scoped("repository", |resolver| async move {
//!         let config = resolver.resolve::<Config>("config").await?;
//!         Ok(Instance::new(Repository { config }))
//!     })
//!     .depends_on(["config"]);
//!
//! let container = Container::new(registry);
//! container.initialize().await?;
//!
//! let scope = container.create_scope();
//! let repository = scope.resolve::<Repository>("repository").await?;
//! assert_eq!("postgres://localhost", repository.config.dsn);
//! scope.dispose().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

mod error;
mod graph;
mod lifecycle;
mod registry;
mod resolver;
mod scope;

pub use error::{ContainerError, ContainerResult};
pub use lifecycle::{Dispose, Initialize};
pub use registry::{Factory, Instance, Lifetime, Registration, Registry, ServiceKey};
pub use resolver::Resolver;
pub use scope::Scope;

/// The root container. Owns the singletons and hands out scopes.
///
/// Build one at process start, call [`Container::initialize`] once, and pass
/// clones of it to whatever needs to resolve services. Clones share state.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    entries: HashMap<ServiceKey, Entry>,
    initialized: OnceCell<()>,
    next_scope: AtomicU64,
}

pub(crate) struct Entry {
    pub(crate) registration: Registration,
    pub(crate) singleton: OnceCell<Instance>,
}

impl Container {
    pub fn new(registry: Registry) -> Self {
        let entries = registry
            .entries
            .into_iter()
            .map(|(key, registration)| {
                let entry = Entry {
                    registration,
                    singleton: OnceCell::new(),
                };
                (key, entry)
            })
            .collect();
        Self {
            inner: Arc::new(ContainerInner {
                entries,
                initialized: OnceCell::new(),
                next_scope: AtomicU64::new(1),
            }),
        }
    }

    /// Checks the declared dependency graph for cycles and missing
    /// dependencies without constructing anything. Returns the keys in
    /// dependency order.
    pub fn validate(&self) -> ContainerResult<Vec<ServiceKey>> {
        let registrations = self
            .inner
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.registration.clone()))
            .collect();
        graph::dependency_order(&registrations)
    }

    /// Validates the graph, then constructs and initializes every singleton
    /// in dependency order. The first failure aborts startup.
    ///
    /// Only the first successful call does any work.
    pub async fn initialize(&self) -> ContainerResult<()> {
        self.inner
            .initialized
            .get_or_try_init(|| async {
                let order = self.validate()?;
                let root = Resolver::root(self.clone());
                let mut constructed = 0;
                for key in &order {
                    if self.entry(key)?.registration.lifetime == Lifetime::Singleton {
                        root.resolve_instance(key).await?;
                        constructed += 1;
                        tracing::debug!("Singleton `{key}` is ready");
                    }
                }
                tracing::info!(
                    "Container initialized: {constructed} singletons, {} registrations",
                    order.len()
                );
                Ok::<_, ContainerError>(())
            })
            .await
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.initialized()
    }

    /// Resolves a singleton (constructed on first use if `initialize` has not
    /// done so yet) or a fresh transient. Scoped services fail with
    /// `ScopedFromRoot`.
    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> ContainerResult<Arc<T>> {
        Resolver::root(self.clone()).resolve(key).await
    }

    /// See [`Resolver::resolve_optional`].
    pub async fn resolve_optional<T: Send + Sync + 'static>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> ContainerResult<Option<Arc<T>>> {
        Resolver::root(self.clone()).resolve_optional(key).await
    }

    pub fn create_scope(&self) -> Scope {
        let id = self.inner.next_scope.fetch_add(1, Ordering::Relaxed);
        Scope::new(self.clone(), id)
    }

    pub fn lifetime_of(&self, key: &str) -> Option<Lifetime> {
        self.inner
            .entries
            .get(&ServiceKey::from(key))
            .map(|entry| entry.registration.lifetime)
    }

    pub(crate) fn entry(&self, key: &ServiceKey) -> ContainerResult<&Entry> {
        self.inner
            .entries
            .get(key)
            .ok_or_else(|| ContainerError::MissingService { key: key.clone() })
    }
}

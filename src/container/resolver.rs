use std::sync::Arc;

use super::error::{ContainerError, ContainerResult};
use super::registry::{Instance, Lifetime};
use super::{Container, Entry, Scope, ServiceKey};
use crate::error::display_error;

/// Handle passed to every factory. Resolves services with the rules of the
/// place the factory was invoked from: the root container or one scope.
///
/// It also carries the chain of services currently under construction. A
/// factory may only resolve the keys its registration declares with
/// `depends_on`, so the graph checked by `initialize` is the graph that runs.
/// A factory that resolves one of its own dependents fails with
/// `CircularDependency` instead of recursing forever.
#[derive(Clone)]
pub struct Resolver {
    container: Container,
    scope: Option<Scope>,
    path: Vec<ServiceKey>,
}

impl Resolver {
    pub(crate) fn root(container: Container) -> Self {
        Self {
            container,
            scope: None,
            path: vec![],
        }
    }

    pub(crate) fn scoped(scope: Scope) -> Self {
        Self {
            container: scope.container().clone(),
            scope: Some(scope),
            path: vec![],
        }
    }

    pub async fn resolve<T: Send + Sync + 'static>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> ContainerResult<Arc<T>> {
        let key = key.into();
        self.resolve_instance(&key).await?.downcast(&key)
    }

    /// Like `resolve`, but an unregistered key or a failed construction
    /// yields `None` and a warning instead of an error.
    pub async fn resolve_optional<T: Send + Sync + 'static>(
        &self,
        key: impl Into<ServiceKey>,
    ) -> ContainerResult<Option<Arc<T>>> {
        let key = key.into();
        match self.resolve(&key).await {
            Ok(service) => Ok(Some(service)),
            Err(error) if error.is_unavailable() => {
                tracing::warn!(
                    "Optional service `{key}` is unavailable: {}",
                    display_error(&error)
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    /// The scope this resolver is bound to, if any.
    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub(crate) async fn resolve_instance(&self, key: &ServiceKey) -> ContainerResult<Instance> {
        if let Some(service) = self.path.last() {
            let declared = self.container.entry(service)?.registration.dependencies();
            if !declared.contains(key) {
                return Err(ContainerError::UndeclaredDependency {
                    service: service.clone(),
                    dependency: key.clone(),
                });
            }
        }
        if self.path.contains(key) {
            let mut path = self.path.clone();
            path.push(key.clone());
            return Err(ContainerError::CircularDependency { path });
        }
        let entry = self.container.entry(key)?;
        match (entry.registration.lifetime, &self.scope) {
            (Lifetime::Singleton, None) => entry
                .singleton
                .get_or_try_init(|| self.construct(key, entry))
                .await
                .cloned(),
            (Lifetime::Singleton, Some(_)) => entry
                .singleton
                .get()
                .cloned()
                .ok_or_else(|| ContainerError::UninitializedSingleton { key: key.clone() }),
            (Lifetime::Scoped, None) => Err(ContainerError::ScopedFromRoot { key: key.clone() }),
            (Lifetime::Scoped, Some(scope)) => {
                scope
                    .get_or_create(key, || self.construct(key, entry))
                    .await
            }
            (Lifetime::Transient, _) => self.construct(key, entry).await,
        }
    }

    /// Runs the factory, then the instance's `Initialize` hook.
    async fn construct(&self, key: &ServiceKey, entry: &Entry) -> ContainerResult<Instance> {
        if let Some(scope) = &self.scope {
            scope.ensure_live(key)?;
        }
        let mut nested = self.clone();
        nested.path.push(key.clone());
        let instance = (entry.registration.factory)(nested)
            .await
            .map_err(|source| ContainerError::construction(key, source))?;
        if let Some(initializer) = &instance.initializer {
            initializer
                .initialize()
                .await
                .map_err(|source| ContainerError::Initialization {
                    key: key.clone(),
                    source,
                })?;
        }
        tracing::trace!(
            "Constructed {:?} `{key}` ({})",
            entry.registration.lifetime,
            instance.type_name()
        );
        Ok(instance)
    }
}

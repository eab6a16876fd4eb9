use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::error::{ContainerError, ContainerResult};
use super::lifecycle::{Dispose, Initialize};
use super::Resolver;
use crate::short_name;

/// Identifies one registration. Unique within a registry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey(Arc<str>);

impl ServiceKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ServiceKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&ServiceKey> for ServiceKey {
    fn from(key: &ServiceKey) -> Self {
        key.clone()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance per container, built by `Container::initialize` and
    /// kept until the process ends.
    Singleton,
    /// One instance per scope, built on first use and disposed with the
    /// scope.
    Scoped,
    /// A new instance on every resolution, never cached.
    Transient,
}

/// A constructed service, type-erased, together with the lifecycle hooks it
/// declared.
#[derive(Clone)]
pub struct Instance {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    pub(crate) initializer: Option<Arc<dyn Initialize>>,
    pub(crate) disposer: Option<Arc<dyn Dispose>>,
}

impl Instance {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self::shared(Arc::new(value))
    }

    pub fn shared<T: Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self {
            value,
            type_name: std::any::type_name::<T>(),
            initializer: None,
            disposer: None,
        }
    }

    /// The instance's `Initialize` hook runs right after construction.
    pub fn initializable<T: Initialize + 'static>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            initializer: Some(value.clone()),
            ..Self::shared(value)
        }
    }

    /// The instance's `Dispose` hook runs when its scope is disposed.
    pub fn disposable<T: Dispose + 'static>(value: T) -> Self {
        let value = Arc::new(value);
        Self {
            disposer: Some(value.clone()),
            ..Self::shared(value)
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast<T: Send + Sync + 'static>(&self, key: &ServiceKey) -> ContainerResult<Arc<T>> {
        self.value
            .clone()
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                key: key.clone(),
                expected: short_name::<T>(),
                actual: crate::util::abs_to_rel_paths(self.type_name),
            })
    }

    /// Whether two handles point at the same underlying value.
    pub fn same_as(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("type", &self.type_name)
            .field("initializable", &self.initializer.is_some())
            .field("disposable", &self.disposer.is_some())
            .finish()
    }
}

pub type Factory =
    Arc<dyn Fn(Resolver) -> BoxFuture<'static, anyhow::Result<Instance>> + Send + Sync>;

/// How to build one service: its factory, lifetime and the services the
/// factory resolves.
#[derive(Clone)]
pub struct Registration {
    pub(crate) factory: Factory,
    pub(crate) lifetime: Lifetime,
    pub(crate) dependencies: Vec<ServiceKey>,
}

impl Registration {
    /// Declares services the factory resolves, making them edges of the
    /// dependency graph that is checked for cycles before startup.
    pub fn depends_on<K: Into<ServiceKey>>(
        &mut self,
        keys: impl IntoIterator<Item = K>,
    ) -> &mut Self {
        self.dependencies.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn dependencies(&self) -> &[ServiceKey] {
        &self.dependencies
    }
}

/// Static mapping of service keys to registrations. Holds no instances; it
/// is frozen into a `Container`.
#[derive(Default, Clone)]
pub struct Registry {
    pub(crate) entries: HashMap<ServiceKey, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a registration. Registering the same key again replaces the
    /// previous registration.
    pub fn register<F, Fut>(
        &mut self,
        key: impl Into<ServiceKey>,
        lifetime: Lifetime,
        factory: F,
    ) -> &mut Registration
    where
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Instance>> + Send + 'static,
    {
        let key = key.into();
        let registration = Registration {
            factory: Arc::new(move |resolver| factory(resolver).boxed()),
            lifetime,
            dependencies: vec![],
        };
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                tracing::warn!(
                    "Service `{}` registered again; replacing the {:?} registration",
                    entry.key(),
                    entry.get().lifetime
                );
                entry.insert(registration);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(registration),
        }
    }

    pub fn singleton<F, Fut>(&mut self, key: impl Into<ServiceKey>, factory: F) -> &mut Registration
    where
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Instance>> + Send + 'static,
    {
        self.register(key, Lifetime::Singleton, factory)
    }

    pub fn scoped<F, Fut>(&mut self, key: impl Into<ServiceKey>, factory: F) -> &mut Registration
    where
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Instance>> + Send + 'static,
    {
        self.register(key, Lifetime::Scoped, factory)
    }

    pub fn transient<F, Fut>(&mut self, key: impl Into<ServiceKey>, factory: F) -> &mut Registration
    where
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Instance>> + Send + 'static,
    {
        self.register(key, Lifetime::Transient, factory)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&ServiceKey::from(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_registering_a_key_keeps_the_last_registration() {
        let mut registry = Registry::new();
        registry.singleton("clock", |_| async { Ok(Instance::new(1u8)) });
        registry
            .transient("clock", |_| async { Ok(Instance::new(2u8)) })
            .depends_on(["tz"]);

        assert_eq!(1, registry.len());
        let registration = &registry.entries[&ServiceKey::from("clock")];
        assert_eq!(Lifetime::Transient, registration.lifetime());
        assert_eq!(&[ServiceKey::from("tz")], registration.dependencies());
    }

    #[test]
    fn downcast_reports_both_type_names() {
        let instance = Instance::new(String::from("hello"));
        let key = ServiceKey::from("greeting");
        assert_eq!("hello", instance.downcast::<String>(&key).unwrap().as_str());

        let error = instance.downcast::<u32>(&key).unwrap_err();
        assert_eq!(
            "service `greeting` is a `String`, not a `u32`",
            error.to_string()
        );
    }
}

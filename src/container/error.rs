use thiserror::Error;

use super::ServiceKey;

pub type ContainerResult<T> = Result<T, ContainerError>;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("service `{key}` is not registered")]
    MissingService { key: ServiceKey },

    #[error("service `{service}` depends on `{dependency}`, which is not registered")]
    MissingDependency {
        service: ServiceKey,
        dependency: ServiceKey,
    },

    /// A factory resolved a key its registration never declared.
    #[error("service `{service}` resolved `{dependency}` without declaring it with `depends_on`")]
    UndeclaredDependency {
        service: ServiceKey,
        dependency: ServiceKey,
    },

    #[error("circular dependency: {}", join_path(.path))]
    CircularDependency { path: Vec<ServiceKey> },

    /// A scope asked for a singleton the root container never constructed,
    /// which means `initialize` was skipped.
    #[error("singleton `{key}` was resolved from a scope before the container was initialized")]
    UninitializedSingleton { key: ServiceKey },

    #[error("scoped service `{key}` can only be resolved from a scope")]
    ScopedFromRoot { key: ServiceKey },

    #[error("scope {scope} was already disposed when `{key}` was requested")]
    ScopeDisposed { scope: u64, key: ServiceKey },

    #[error("service `{key}` is a `{actual}`, not a `{expected}`")]
    TypeMismatch {
        key: ServiceKey,
        expected: String,
        actual: String,
    },

    #[error("failed to construct `{key}`: {source:#}")]
    Construction {
        key: ServiceKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to initialize `{key}`: {source:#}")]
    Initialization {
        key: ServiceKey,
        #[source]
        source: anyhow::Error,
    },
}

impl ContainerError {
    /// Errors that `resolve_optional` converts into an absent value.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::MissingService { .. } | Self::Construction { .. } | Self::Initialization { .. }
        )
    }

    /// Configuration and programming errors that must keep their identity
    /// when they surface through a nested factory.
    fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::CircularDependency { .. }
                | Self::UndeclaredDependency { .. }
                | Self::UninitializedSingleton { .. }
                | Self::ScopedFromRoot { .. }
                | Self::ScopeDisposed { .. }
                | Self::TypeMismatch { .. }
        )
    }

    /// Wraps a factory failure, unless it is a structural error raised by a
    /// nested resolution, which is passed through untouched.
    pub(crate) fn construction(key: &ServiceKey, source: anyhow::Error) -> Self {
        match source.downcast::<ContainerError>() {
            Ok(inner) if inner.is_structural() => inner,
            Ok(inner) => Self::Construction {
                key: key.clone(),
                source: inner.into(),
            },
            Err(source) => Self::Construction {
                key: key.clone(),
                source,
            },
        }
    }
}

fn join_path(path: &[ServiceKey]) -> String {
    path.iter()
        .map(ServiceKey::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

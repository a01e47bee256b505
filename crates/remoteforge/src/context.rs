//! Execution-context scoping
//!
//! Registrations belong to the host context that made them rather than to
//! the whole process. A [`ContextRegistryStore`] maps contexts to registries
//! through weak references, so it never keeps a context alive and drops a
//! context's registry once the context is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::debug;
use uuid::Uuid;

use crate::descriptor::BoxedDescriptor;
use crate::error::ForgeResult;
use crate::registry::{RegistryConfig, SchemeRegistry};

/// A host execution context (a runspace, a thread of work, a tenant)
#[derive(Debug)]
pub struct ExecutionContext {
    id: Uuid,
    name: String,
    variables: RwLock<HashMap<String, String>>,
}

impl ExecutionContext {
    /// Create a new context
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            variables: RwLock::new(HashMap::new()),
        })
    }

    /// Unique id of this context
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read a variable
    pub fn variable(&self, name: &str) -> Option<String> {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Set a variable, returning the previous value
    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into())
    }

    /// Remove a variable
    pub fn remove_variable(&self, name: &str) -> Option<String> {
        self.variables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

struct Entry {
    context: Weak<ExecutionContext>,
    registry: SchemeRegistry,
}

impl Entry {
    fn is(&self, context: &Arc<ExecutionContext>) -> bool {
        std::ptr::eq(self.context.as_ptr(), Arc::as_ptr(context))
    }
}

/// Context-keyed store of scheme registries
pub struct ContextRegistryStore {
    config: RegistryConfig,
    entries: Mutex<Vec<Entry>>,
}

impl ContextRegistryStore {
    /// Create a store; new registries are built from `config`
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Configuration used for new registries
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.context.strong_count() > 0);
        if entries.len() != before {
            debug!(
                released = before - entries.len(),
                "released registries of dropped contexts"
            );
        }
        entries
    }

    /// Get the context's registry, creating it on first use
    ///
    /// # Errors
    ///
    /// Fails only if registering the built-in schemes fails.
    pub fn registry_for(&self, context: &Arc<ExecutionContext>) -> ForgeResult<SchemeRegistry> {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter().find(|entry| entry.is(context)) {
            return Ok(entry.registry.clone());
        }

        let registry = SchemeRegistry::from_config(&self.config)?;
        debug!(context = %context.name(), "created scheme registry");
        entries.push(Entry {
            context: Arc::downgrade(context),
            registry: registry.clone(),
        });
        Ok(registry)
    }

    /// Make `to` use the same registry as `from`
    ///
    /// Any registry `to` had before is released.
    pub fn share(
        &self,
        from: &Arc<ExecutionContext>,
        to: &Arc<ExecutionContext>,
    ) -> ForgeResult<SchemeRegistry> {
        let registry = self.registry_for(from)?;

        let mut entries = self.lock();
        entries.retain(|entry| !entry.is(to));
        entries.push(Entry {
            context: Arc::downgrade(to),
            registry: registry.clone(),
        });
        Ok(registry)
    }

    /// Forget a context's registry
    pub fn remove(&self, context: &Arc<ExecutionContext>) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| !entry.is(context));
        entries.len() != before
    }

    /// Number of live contexts with a registry
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no live context has a registry
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Scheme used in this context for connection strings without a prefix
    ///
    /// The context variable named by
    /// [`RegistryConfig::default_scheme_variable`] wins when it is set and
    /// not blank.
    pub fn default_scheme(&self, context: &ExecutionContext) -> String {
        self.config
            .default_scheme_variable
            .as_deref()
            .and_then(|name| context.variable(name))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.config.default_scheme.clone())
    }

    /// Resolve a connection string in a context
    pub fn resolve(
        &self,
        context: &Arc<ExecutionContext>,
        connection_string: &str,
    ) -> ForgeResult<BoxedDescriptor> {
        let registry = self.registry_for(context)?;
        registry.resolve_with_default(connection_string, &self.default_scheme(context))
    }
}

impl Default for ContextRegistryStore {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

//! Scheme registry
//!
//! Maps short scheme names (`ssh`, `docker`, ...) to factories that turn the
//! rest of a connection string into a [`TransportDescriptor`]. Names are
//! case-insensitive and unique within one registry.
//!
//! A connection string is `[scheme ":"] remainder`. The scheme is split on
//! the first `:` and the remainder is handed to the factory verbatim, so
//! `ssh:user@host:2222` resolves the `ssh` scheme with `user@host:2222`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::descriptor::BoxedDescriptor;
use crate::error::{ForgeError, ForgeResult};
use crate::ssh::SshConfig;

/// Factory turning the remainder of a connection string into a descriptor
pub type TransportFactory = Arc<dyn Fn(&str) -> ForgeResult<BoxedDescriptor> + Send + Sync>;

/// Configuration for new registries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Scheme used when a connection string has no `scheme:` prefix
    pub default_scheme: String,

    /// Context variable that overrides [`default_scheme`](Self::default_scheme)
    pub default_scheme_variable: Option<String>,

    /// Register the built-in schemes in every new registry
    pub register_builtins: bool,

    /// Settings for the built-in `ssh` scheme
    pub ssh: SshConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_scheme: "ssh".to_string(),
            default_scheme_variable: Some("RemoteForgeDefault".to_string()),
            register_builtins: true,
            ssh: SshConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Set the default scheme
    pub fn with_default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    /// Set the context variable consulted for the default scheme
    pub fn with_default_scheme_variable(mut self, name: Option<String>) -> Self {
        self.default_scheme_variable = name;
        self
    }

    /// Enable or disable built-in scheme registration
    pub fn with_builtins(mut self, register: bool) -> Self {
        self.register_builtins = register;
        self
    }

    /// Set the built-in `ssh` scheme settings
    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = ssh;
        self
    }
}

/// A registered scheme
pub struct Registration {
    name: String,
    description: Option<String>,
    factory: TransportFactory,
}

impl Registration {
    /// Scheme name as registered
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human readable description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The factory behind this scheme
    pub fn factory(&self) -> &TransportFactory {
        &self.factory
    }

    /// Create a descriptor from a connection string remainder
    pub fn create(&self, remainder: &str) -> ForgeResult<BoxedDescriptor> {
        (self.factory)(remainder)
    }

    /// Serializable summary
    pub fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Listing entry for a registered scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Scheme name
    pub name: String,
    /// Description, if one was given
    pub description: Option<String>,
}

/// Registry of transport schemes
///
/// Cloning is cheap and clones share the same registrations, which is how
/// one registry is shared between several execution contexts.
#[derive(Clone)]
pub struct SchemeRegistry {
    registrations: Arc<Mutex<Vec<Arc<Registration>>>>,
    default_scheme: Arc<str>,
}

impl SchemeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::with_default_scheme("ssh")
    }

    /// Create an empty registry with a different default scheme
    pub fn with_default_scheme(scheme: impl AsRef<str>) -> Self {
        Self {
            registrations: Arc::new(Mutex::new(Vec::new())),
            default_scheme: Arc::from(scheme.as_ref()),
        }
    }

    /// Create a registry from configuration, registering built-ins if enabled
    pub fn from_config(config: &RegistryConfig) -> ForgeResult<Self> {
        let registry = Self::with_default_scheme(&config.default_scheme);
        if config.register_builtins {
            crate::ssh::register(&registry, config.ssh.clone())?;
        }
        Ok(registry)
    }

    /// Scheme used for connection strings without a prefix
    pub fn default_scheme(&self) -> &str {
        &self.default_scheme
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Registration>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a scheme
    ///
    /// Registering the same factory (pointer-identical `Arc`) under an
    /// existing name returns the existing registration unchanged. A
    /// different factory replaces the old one only when `force` is set.
    ///
    /// # Errors
    ///
    /// [`ForgeError::DuplicateScheme`] if the name is taken and `force` is
    /// not set.
    pub fn register(
        &self,
        name: &str,
        factory: TransportFactory,
        description: Option<String>,
        force: bool,
    ) -> ForgeResult<Arc<Registration>> {
        let mut registrations = self.lock();

        if let Some(index) = registrations.iter().position(|r| r.matches(name)) {
            if Arc::ptr_eq(&registrations[index].factory, &factory) {
                return Ok(Arc::clone(&registrations[index]));
            }
            if !force {
                return Err(ForgeError::DuplicateScheme(name.to_string()));
            }
            debug!(scheme = name, "replacing registered scheme");
            registrations.remove(index);
        }

        let registration = Arc::new(Registration {
            name: name.to_string(),
            description,
            factory,
        });
        registrations.push(Arc::clone(&registration));
        debug!(scheme = name, "registered scheme");
        Ok(registration)
    }

    /// Remove a scheme
    ///
    /// # Errors
    ///
    /// [`ForgeError::SchemeNotFound`] if no scheme has that name.
    pub fn unregister(&self, name: &str) -> ForgeResult<Arc<Registration>> {
        let mut registrations = self.lock();
        let index = registrations
            .iter()
            .position(|r| r.matches(name))
            .ok_or_else(|| ForgeError::SchemeNotFound(name.to_string()))?;
        Ok(registrations.remove(index))
    }

    /// Get a registration by name
    pub fn get(&self, name: &str) -> Option<Arc<Registration>> {
        self.lock().iter().find(|r| r.matches(name)).cloned()
    }

    /// Resolve a connection string with this registry's default scheme
    pub fn resolve(&self, connection_string: &str) -> ForgeResult<BoxedDescriptor> {
        self.resolve_with_default(connection_string, &self.default_scheme)
    }

    /// Resolve a connection string, using `default_scheme` when it has no
    /// `scheme:` prefix
    ///
    /// # Errors
    ///
    /// [`ForgeError::SchemeNotFound`] for an unknown scheme; otherwise
    /// whatever the factory returns.
    pub fn resolve_with_default(
        &self,
        connection_string: &str,
        default_scheme: &str,
    ) -> ForgeResult<BoxedDescriptor> {
        let (scheme, remainder) = connection_string
            .split_once(':')
            .unwrap_or((default_scheme, connection_string));

        // Clone the registration to avoid calling the factory under the lock
        let registration = self
            .get(scheme)
            .ok_or_else(|| ForgeError::SchemeNotFound(scheme.to_string()))?;

        registration.create(remainder)
    }

    /// List registered schemes in registration order
    pub fn registrations(&self) -> Vec<RegistrationInfo> {
        self.lock().iter().map(|r| r.info()).collect()
    }

    /// Get count of registered schemes
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no scheme is registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every registration
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Whether two handles share the same registrations
    pub fn ptr_eq(&self, other: &SchemeRegistry) -> bool {
        Arc::ptr_eq(&self.registrations, &other.registrations)
    }
}

impl Default for SchemeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemeRegistry")
            .field("default_scheme", &self.default_scheme)
            .field("registrations", &self.registrations())
            .finish()
    }
}

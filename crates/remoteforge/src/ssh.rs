//! Built-in `ssh` scheme
//!
//! Connection strings look like `[user@]host[:port]`. The user part is
//! everything before the last `@` so principal names such as
//! `user@REALM.COM@host` work. IPv6 hosts go in brackets: `[::1]:2222`.
//!
//! The resulting transport runs the system `ssh` client with the remote
//! PowerShell subsystem and speaks to it over stdio.

use remoteforge_transport::{BoxedTransport, ProcessConfig, ProcessTransport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;
use std::sync::Arc;

use crate::descriptor::{BoxedDescriptor, TransportDescriptor};
use crate::error::{ForgeError, ForgeResult};
use crate::registry::{Registration, SchemeRegistry, TransportFactory};

/// Scheme name of the built-in ssh transport
pub const SCHEME: &str = "ssh";

/// Port used when none is given
pub const DEFAULT_PORT: u16 = 22;

/// Settings for the `ssh` scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// The ssh client to run
    pub executable: String,

    /// Remote subsystem to request
    pub subsystem: String,

    /// Extra arguments placed before the host
    pub extra_args: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            executable: "ssh".to_string(),
            subsystem: "powershell".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl SshConfig {
    /// Set the ssh client executable
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Set the remote subsystem
    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    /// Add an extra argument, e.g. `-o BatchMode=yes`
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

/// A parsed ssh target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// User to log in as
    pub user: Option<String>,
    /// Host name or address, without IPv6 brackets
    pub host: String,
    /// Port, [`DEFAULT_PORT`] when not given
    pub port: u16,
}

impl SshTarget {
    /// Whether the host is an IPv6 address
    pub fn is_ipv6(&self) -> bool {
        self.host.parse::<Ipv6Addr>().is_ok()
    }
}

impl FromStr for SshTarget {
    type Err = ForgeError;

    fn from_str(input: &str) -> ForgeResult<Self> {
        let (user, host_part) = match input.rsplit_once('@') {
            Some(("", _)) => return Err(ForgeError::invalid(input, "user name is empty")),
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, input),
        };

        let (host, port) = if let Some(bracketed) = host_part.strip_prefix('[') {
            let (addr, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| ForgeError::invalid(input, "missing ']' after IPv6 address"))?;
            if addr.parse::<Ipv6Addr>().is_err() {
                return Err(ForgeError::invalid(
                    input,
                    format!("'{}' is not an IPv6 address", addr),
                ));
            }
            let port = match rest {
                "" => None,
                _ => Some(rest.strip_prefix(':').ok_or_else(|| {
                    ForgeError::invalid(input, "unexpected text after IPv6 address")
                })?),
            };
            (addr, port)
        } else {
            match host_part.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_part, None),
            }
        };

        if host.is_empty() {
            return Err(ForgeError::invalid(input, "host name is empty"));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(ForgeError::invalid(
                input,
                format!("'{}' is not a valid host name", host),
            ));
        }

        let port = match port {
            None => DEFAULT_PORT,
            Some(port) => match port.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    return Err(ForgeError::invalid(
                        input,
                        format!("'{}' is not a valid port", port),
                    ));
                }
            },
        };

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.is_ipv6() {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if self.port != DEFAULT_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Descriptor for one ssh target
#[derive(Debug, Clone)]
pub struct SshDescriptor {
    target: SshTarget,
    config: SshConfig,
}

impl SshDescriptor {
    /// Create a descriptor
    pub fn new(target: SshTarget, config: SshConfig) -> Self {
        Self { target, config }
    }

    /// The parsed target
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Build the ssh command for this target
    pub fn process_config(&self) -> ProcessConfig {
        let mut process = ProcessConfig::new(&self.config.executable);
        if let Some(user) = &self.target.user {
            process = process.with_arg("-l").with_arg(user);
        }
        if self.target.port != DEFAULT_PORT {
            process = process.with_arg("-p").with_arg(self.target.port.to_string());
        }
        process
            .with_args(self.config.extra_args.iter().cloned())
            .with_arg(&self.target.host)
            .with_args(["-s", self.config.subsystem.as_str()])
    }
}

impl TransportDescriptor for SshDescriptor {
    fn create_transport(&self) -> ForgeResult<BoxedTransport> {
        Ok(Arc::new(ProcessTransport::new(self.process_config())))
    }

    fn transport_string(&self) -> String {
        format!("{}:{}", SCHEME, self.target)
    }
}

/// Factory for the `ssh` scheme
pub fn factory(config: SshConfig) -> TransportFactory {
    Arc::new(move |info: &str| {
        let target = info.parse::<SshTarget>()?;
        Ok(Arc::new(SshDescriptor::new(target, config.clone())) as BoxedDescriptor)
    })
}

/// Register the `ssh` scheme
pub fn register(registry: &SchemeRegistry, config: SshConfig) -> ForgeResult<Arc<Registration>> {
    registry.register(
        SCHEME,
        factory(config),
        Some("Connects to a host over the ssh client's PowerShell subsystem".to_string()),
        false,
    )
}

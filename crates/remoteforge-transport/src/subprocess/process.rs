//! Child process transport
//!
//! Lines are written to the child's stdin and read from its stdout. Whatever
//! the child prints on stderr is the side error channel.

use crate::error::{Result, TransportError};
use crate::traits::Transport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for spawning a transport process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Program to run, resolved through `PATH`
    pub program: String,

    /// Arguments to pass to the program
    pub args: Vec<String>,

    /// Environment variables to set
    pub env: HashMap<String, String>,

    /// Start the child with an empty environment plus [`env`](Self::env)
    pub clear_env: bool,

    /// Working directory of the child
    pub working_dir: Option<PathBuf>,

    /// How long the child gets to exit after SIGTERM before it is killed
    #[serde(with = "crate::duration_format")]
    pub terminate_grace: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            clear_env: false,
            working_dir: None,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessConfig {
    /// Create a new process configuration
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Isolate the child from the parent's environment
    ///
    /// When set, only variables added with [`with_env`](Self::with_env) reach
    /// the child. Off by default because most remote shells need `HOME` and
    /// agent sockets from the caller.
    pub fn with_clear_env(mut self, clear: bool) -> Self {
        self.clear_env = clear;
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the terminate grace period
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Render the command line for diagnostics
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if self.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&self.env);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Transport over a child process's stdio
///
/// Each stream sits behind its own lock so the runner can write, read and
/// drain stderr at the same time.
pub struct ProcessTransport {
    config: ProcessConfig,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,
    stdout: Mutex<Option<Lines<BufReader<ChildStdout>>>>,
    stderr: Mutex<Option<ChildStderr>>,
}

impl ProcessTransport {
    /// Create a transport; nothing is spawned until `create_connection`
    pub fn new(config: ProcessConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
        }
    }

    /// Get the process configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// OS id of the running child, if any
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    /// Check if the child is still running
    pub async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn terminate(&self, child: &mut Child, cancel: &CancellationToken) -> Result<()> {
        if let Ok(Some(status)) = child.try_wait() {
            debug!(%status, "transport process already exited");
            return Ok(());
        }

        #[cfg(unix)]
        send_sigterm(child);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Do not wait on a cancelled close; kill_on_drop reaps the rest.
                let _ = child.start_kill();
                return Ok(());
            }
            waited = tokio::time::timeout(self.config.terminate_grace, child.wait()) => {
                if let Ok(status) = waited {
                    let status = status?;
                    debug!(%status, "transport process exited");
                    return Ok(());
                }
            }
        }

        debug!(
            "transport process still running after {:?}, killing",
            self.config.terminate_grace
        );
        if let Err(e) = child.start_kill() {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return Ok(());
            }
            return Err(TransportError::process(format!(
                "Failed to kill process: {}",
                e
            )));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(()),
            status = child.wait() => {
                status?;
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        // ESRCH: exited between try_wait and here
        debug!(pid, error = %e, "SIGTERM not delivered");
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn create_connection(&self, _cancel: &CancellationToken) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(TransportError::connection(format!(
                "'{}' is already running",
                self.config.program
            )));
        }

        let mut child = self.config.command().spawn().map_err(|e| {
            TransportError::connection(format!(
                "Failed to start '{}': {}",
                self.config.program, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::process("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::process("Failed to get stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::process("Failed to get stderr"))?;

        debug!(pid = ?child.id(), command = %self.config.command_line(), "transport process started");

        *self.stdin.lock().await = Some(BufWriter::new(stdin));
        *self.stdout.lock().await = Some(BufReader::new(stdout).lines());
        *self.stderr.lock().await = Some(stderr);
        *slot = Some(child);
        Ok(())
    }

    async fn close_connection(&self, cancel: &CancellationToken) -> Result<()> {
        // Closing stdin first lets a well-behaved child exit on its own.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        let result = self.terminate(&mut child, cancel).await;
        if let Err(e) = &result {
            warn!("transport process did not shut down cleanly: {}", e);
        }
        result
    }

    async fn write_message(&self, line: &str, _cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;

        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn wait_message(&self, _cancel: &CancellationToken) -> Result<Option<String>> {
        let mut guard = self.stdout.lock().await;
        let Some(stdout) = guard.as_mut() else {
            return Ok(None);
        };

        let line = stdout.next_line().await?;
        if line.is_none() {
            guard.take();
        }
        Ok(line)
    }

    async fn read_error(&self, _cancel: &CancellationToken) -> Result<Option<String>> {
        let Some(mut stderr) = self.stderr.lock().await.take() else {
            return Ok(None);
        };

        let mut raw = Vec::new();
        stderr.read_to_end(&mut raw).await?;
        let text = String::from_utf8_lossy(&raw);
        if text.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(text.into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_config_default() {
        let config = ProcessConfig::default();
        assert!(config.program.is_empty());
        assert!(config.args.is_empty());
        assert!(!config.clear_env);
        assert_eq!(config.terminate_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_process_config_builder() {
        let config = ProcessConfig::new("ssh")
            .with_arg("-p")
            .with_arg("2222")
            .with_args(["host", "-s", "powershell"])
            .with_env("LANG", "C")
            .with_clear_env(true)
            .with_working_dir("/tmp")
            .with_terminate_grace(Duration::from_millis(250));

        assert_eq!(config.program, "ssh");
        assert_eq!(config.args, vec!["-p", "2222", "host", "-s", "powershell"]);
        assert_eq!(config.env.get("LANG"), Some(&"C".to_string()));
        assert!(config.clear_env);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.terminate_grace, Duration::from_millis(250));
    }

    #[test]
    fn test_command_line() {
        let config = ProcessConfig::new("ssh").with_args(["-p", "2222", "host"]);
        assert_eq!(config.command_line(), "ssh -p 2222 host");
    }

    #[test]
    fn test_process_config_from_json() {
        let config: ProcessConfig = serde_json::from_str(
            r#"{ "program": "pwsh", "args": ["-NoLogo"], "terminate_grace": "1s" }"#,
        )
        .unwrap();
        assert_eq!(config.program, "pwsh");
        assert_eq!(config.args, vec!["-NoLogo"]);
        assert_eq!(config.terminate_grace, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_close_without_connect_is_ok() {
        let transport = ProcessTransport::new(ProcessConfig::new("cat"));
        let cancel = CancellationToken::new();
        transport.close_connection(&cancel).await.unwrap();
        assert!(!transport.is_alive().await);
    }

    #[tokio::test]
    async fn test_write_before_connect_is_closed() {
        let transport = ProcessTransport::new(ProcessConfig::new("cat"));
        let cancel = CancellationToken::new();
        let err = transport.write_message("hi", &cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_connect() {
        let transport =
            ProcessTransport::new(ProcessConfig::new("remoteforge-no-such-program-xyz"));
        let cancel = CancellationToken::new();
        let err = transport.create_connection(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
        assert!(err.to_string().contains("remoteforge-no-such-program-xyz"));
    }
}

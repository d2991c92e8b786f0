//! Location provider adapter: runs the external location command under a hard deadline.

use crate::types::{local_now, Fix, ProviderKind};
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Placeholder in provider arguments replaced by the provider selector.
pub const PROVIDER_PLACEHOLDER: &str = "{provider}";

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("{provider} provider timed out after {timeout:?}")]
    Timeout {
        provider: ProviderKind,
        timeout: Duration,
    },
    #[error("{provider} provider exited with {status}: {stderr}")]
    ProviderExit {
        provider: ProviderKind,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{provider} provider returned malformed output: {reason}")]
    MalformedOutput {
        provider: ProviderKind,
        reason: String,
    },
    #[error("Failed to spawn provider command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while waiting on provider: {0}")]
    Io(#[from] io::Error),
}

impl AcquireError {
    /// Whether the loop can carry on with its fallback action.
    ///
    /// Spawn and I/O failures mean the host cannot run child processes at all.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ProviderExit { .. } | Self::MalformedOutput { .. }
        )
    }
}

/// Source of location fixes.
pub trait LocationProvider {
    /// Query `kind`, giving up after `timeout`.
    fn acquire(
        &self,
        kind: ProviderKind,
        timeout: Duration,
    ) -> impl Future<Output = Result<Fix, AcquireError>> + Send;
}

/// Configuration for the command-backed provider.
#[derive(Debug, Clone)]
pub struct CommandProviderConfig {
    /// Executable to run (`termux-location` on Termux).
    pub command: String,
    /// Arguments; [`PROVIDER_PLACEHOLDER`] is replaced by `gps` or `network`.
    pub args: Vec<String>,
}

impl Default for CommandProviderConfig {
    fn default() -> Self {
        Self {
            command: "termux-location".to_string(),
            args: vec!["-p".to_string(), PROVIDER_PLACEHOLDER.to_string()],
        }
    }
}

impl CommandProviderConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn args_for(&self, kind: ProviderKind) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(PROVIDER_PLACEHOLDER, kind.as_str()))
            .collect()
    }
}

/// Provider that shells out to an external location command.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    config: CommandProviderConfig,
}

impl CommandProvider {
    pub fn new(config: CommandProviderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandProviderConfig {
        &self.config
    }

    async fn run(&self, kind: ProviderKind, timeout: Duration) -> Result<Fix, AcquireError> {
        let args = self.config.args_for(kind);
        tracing::debug!(command = %self.config.command, ?args, "Spawning provider");

        let mut command = Command::new(&self.config.command);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own group, so helpers the command forks die with it.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| AcquireError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;
        let mut group = ProcessGroup::new(child.id());

        let mut stdout = drain(child.stdout.take());
        let mut stderr = drain(child.stderr.take());

        // The deadline covers the drain too: a helper can hold the pipes open
        // after the command itself has exited.
        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await?;
            let stdout = collect(&mut stdout).await?;
            let stderr = collect(&mut stderr).await?;
            Ok::<_, AcquireError>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(result) => {
                group.disarm();
                result?
            }
            Err(_) => {
                tracing::warn!(provider = %kind, ?timeout, "Provider timed out, killing it");
                group.kill();
                if let Err(e) = child.start_kill() {
                    tracing::debug!("Provider already exited: {}", e);
                }
                child.wait().await?;
                stdout.abort();
                stderr.abort();
                return Err(AcquireError::Timeout {
                    provider: kind,
                    timeout,
                });
            }
        };

        if !status.success() {
            return Err(AcquireError::ProviderExit {
                provider: kind,
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        parse_fix(kind, &stdout)
    }
}

/// Process group of a provider run, killed on drop unless disarmed.
///
/// `kill_on_drop` only reaches the direct child; this also reaches anything
/// it forked, including when the acquire future is cancelled.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, "Failed to kill provider process group: {}", err);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

impl Default for CommandProvider {
    fn default() -> Self {
        Self::new(CommandProviderConfig::default())
    }
}

impl LocationProvider for CommandProvider {
    async fn acquire(&self, kind: ProviderKind, timeout: Duration) -> Result<Fix, AcquireError> {
        self.run(kind, timeout).await
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    })
}

async fn collect(handle: &mut JoinHandle<io::Result<Vec<u8>>>) -> Result<Vec<u8>, AcquireError> {
    handle.await.map_err(io::Error::other)?.map_err(AcquireError::Io)
}

/// Record emitted by the provider command.
#[derive(Debug, Deserialize)]
struct RawFix {
    latitude: Option<f64>,
    longitude: Option<f64>,
    accuracy: Option<f64>,
    provider: Option<String>,
}

/// Parse provider output into a [`Fix`] stamped with the current local time.
///
/// The provider tag falls back to the requested kind when the record has none.
pub fn parse_fix(kind: ProviderKind, output: &[u8]) -> Result<Fix, AcquireError> {
    let malformed = |reason: String| AcquireError::MalformedOutput {
        provider: kind,
        reason,
    };

    let raw: RawFix = serde_json::from_slice(output).map_err(|e| malformed(e.to_string()))?;

    let latitude = raw
        .latitude
        .ok_or_else(|| malformed("missing latitude".to_string()))?;
    let longitude = raw
        .longitude
        .ok_or_else(|| malformed("missing longitude".to_string()))?;

    let provider = raw
        .provider
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| kind.as_str().to_string());

    Ok(Fix::new(local_now(), latitude, longitude, raw.accuracy, provider))
}

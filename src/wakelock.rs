//! Scoped device wake lock.
//!
//! [`WakeLock::acquire`] runs the acquire command and fails loudly if it does
//! not succeed. The matching release command runs when the guard is dropped,
//! which covers normal return, `?` error paths and unwinding.

use std::io;
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WakeLockError {
    #[error("Failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}")]
    Refused { command: String, status: ExitStatus },
}

/// Wake lock commands.
#[derive(Debug, Clone)]
pub struct WakeLockConfig {
    pub enabled: bool,
    pub acquire_command: String,
    pub release_command: String,
}

impl Default for WakeLockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            acquire_command: "termux-wake-lock".to_string(),
            release_command: "termux-wake-unlock".to_string(),
        }
    }
}

/// Held wake lock; released on drop.
#[derive(Debug)]
pub struct WakeLock {
    release_command: Option<String>,
}

impl WakeLock {
    pub fn acquire(config: &WakeLockConfig) -> Result<Self, WakeLockError> {
        if !config.enabled {
            tracing::debug!("Wake lock disabled");
            return Ok(Self {
                release_command: None,
            });
        }

        run(&config.acquire_command)?;
        tracing::info!("Wake lock acquired");

        Ok(Self {
            release_command: Some(config.release_command.clone()),
        })
    }

    pub fn is_held(&self) -> bool {
        self.release_command.is_some()
    }
}

impl Drop for WakeLock {
    fn drop(&mut self) {
        if let Some(command) = self.release_command.take() {
            match run(&command) {
                Ok(()) => tracing::info!("Wake lock released"),
                Err(e) => tracing::error!("Wake lock release failed: {}", e),
            }
        }
    }
}

/// Run a command line split on whitespace.
fn run(command_line: &str) -> Result<(), WakeLockError> {
    let mut parts = command_line.split_whitespace();
    let program = parts.next().unwrap_or_default();

    let status = Command::new(program)
        .args(parts)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| WakeLockError::Spawn {
            command: command_line.to_string(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(WakeLockError::Refused {
            command: command_line.to_string(),
            status,
        })
    }
}

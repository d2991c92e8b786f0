//! Background process control and the single-instance lock.
//!
//! The acquisition loop holds an exclusive advisory lock on `geotrail.pid`
//! for as long as it runs and records its pid in that file. `start`, `stop`
//! and `status` probe the lock instead of searching the process table by
//! name, so a stale pid file from a crashed loop never counts as running.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("Failed to launch background loop: {0}")]
    Launch(#[source] io::Error),
    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SupervisorError + '_ {
    move |source| SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Exclusive lock held by the running acquisition loop; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock and record the current pid, or report who holds it.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, SupervisorError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err(path))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let pid = read_pid(&mut file).unwrap_or(0);
                return Err(SupervisorError::AlreadyRunning(pid));
            }
            Err(TryLockError::Error(e)) => return Err(io_err(path)(e)),
        }

        file.set_len(0).map_err(io_err(path))?;
        file.seek(SeekFrom::Start(0)).map_err(io_err(path))?;
        writeln!(file, "{}", std::process::id()).map_err(io_err(path))?;
        file.flush().map_err(io_err(path))?;

        tracing::debug!("Instance lock held at {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Clear the pid before unlocking so readers never see a stale one.
        let _ = self.file.set_len(0);
        if let Err(e) = self.file.unlock() {
            tracing::warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    text.trim().parse().ok()
}

/// Pid of the loop holding the lock at `path`, if any.
pub fn running_pid(path: &Path) -> Result<Option<u32>, SupervisorError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };

    match file.try_lock_shared() {
        Ok(()) => {
            let _ = file.unlock();
            Ok(None)
        }
        Err(TryLockError::WouldBlock) => Ok(Some(read_pid(&mut file).unwrap_or(0))),
        Err(TryLockError::Error(e)) => Err(io_err(path)(e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32 },
    NotRunning,
}

/// Starts and stops the detached acquisition loop.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pid_path: PathBuf,
    log_path: PathBuf,
    program: PathBuf,
    args: Vec<String>,
}

impl Supervisor {
    /// `program args...` must run the loop in the foreground and take the instance lock.
    pub fn new(
        pid_path: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        program: impl Into<PathBuf>,
        args: Vec<String>,
    ) -> Self {
        Self {
            pid_path: pid_path.into(),
            log_path: log_path.into(),
            program: program.into(),
            args,
        }
    }

    pub fn status(&self) -> Result<Option<u32>, SupervisorError> {
        running_pid(&self.pid_path)
    }

    /// Launch the loop detached from the terminal unless one is already running.
    pub fn start(&self) -> Result<StartOutcome, SupervisorError> {
        if let Some(pid) = self.status()? {
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(io_err(&self.log_path))?;
        let log_err = log.try_clone().map_err(io_err(&self.log_path))?;

        let child = detached(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(SupervisorError::Launch)?;

        tracing::info!(pid = child.id(), "Launched background loop");
        Ok(StartOutcome::Started { pid: child.id() })
    }

    /// Ask the running loop to terminate.
    pub fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        match self.status()? {
            None | Some(0) => Ok(StopOutcome::NotRunning),
            Some(pid) => {
                terminate(pid)?;
                tracing::info!(pid, "Sent SIGTERM");
                Ok(StopOutcome::Stopped { pid })
            }
        }
    }
}

#[cfg(unix)]
fn detached(program: &Path) -> Command {
    use std::os::unix::process::CommandExt;

    let mut command = Command::new(program);
    // New session with no controlling terminal: closing the launching shell
    // sends it no SIGHUP.
    // SAFETY: setsid(2) is async-signal-safe and the closure touches no
    // parent-process state.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command
}

#[cfg(not(unix))]
fn detached(program: &Path) -> Command {
    Command::new(program)
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<(), SupervisorError> {
    let raw = libc::pid_t::try_from(pid).map_err(|_| SupervisorError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::InvalidInput),
    })?;

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(SupervisorError::Signal {
            pid,
            source: io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<(), SupervisorError> {
    Err(SupervisorError::Signal {
        pid,
        source: io::Error::from(io::ErrorKind::Unsupported),
    })
}

/// Resolves with the name of the first shutdown request received.
///
/// SIGHUP is consumed and ignored, so a hangup of the launching terminal does
/// not stop the loop.
#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => return Ok("SIGINT"),
            _ = terminate.recv() => return Ok("SIGTERM"),
            _ = hangup.recv() => tracing::info!("Ignoring SIGHUP"),
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "Ctrl+C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run").join("geotrail.pid");

        {
            let lock = InstanceLock::acquire(&path).unwrap();
            assert_eq!(lock.path(), path.as_path());
            assert_eq!(running_pid(&path).unwrap(), Some(std::process::id()));

            match InstanceLock::acquire(&path) {
                Err(SupervisorError::AlreadyRunning(pid)) => {
                    assert_eq!(pid, std::process::id())
                }
                other => panic!("expected AlreadyRunning, got {other:?}"),
            }
        }

        assert_eq!(running_pid(&path).unwrap(), None);
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_stale_pid_file_is_not_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geotrail.pid");
        std::fs::write(&path, "4242\n").unwrap();

        assert_eq!(running_pid(&path).unwrap(), None);

        let supervisor = Supervisor::new(&path, dir.path().join("geotrail.log"), "true", vec![]);
        assert_eq!(supervisor.stop().unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn test_start_reports_already_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geotrail.pid");
        let _lock = InstanceLock::acquire(&path).unwrap();

        let supervisor = Supervisor::new(&path, dir.path().join("geotrail.log"), "true", vec![]);
        assert_eq!(
            supervisor.start().unwrap(),
            StartOutcome::AlreadyRunning {
                pid: std::process::id()
            }
        );
    }

    #[test]
    fn test_start_launches_with_log_redirect() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("logs").join("geotrail.log");
        let supervisor = Supervisor::new(
            dir.path().join("geotrail.pid"),
            &log,
            "sh",
            vec!["-c".to_string(), "echo launched".to_string()],
        );

        let outcome = supervisor.start().unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));

        for _ in 0..50 {
            if std::fs::read_to_string(&log).unwrap_or_default().contains("launched") {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        panic!("background process never wrote to its log");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_start_detaches_into_new_session() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("geotrail.log");
        // Fields 1 and 6 of /proc/<pid>/stat are the pid and session id.
        let script = r#"read -r pid comm state ppid pgrp sid rest < /proc/$$/stat; echo "pid=$pid sid=$sid""#;
        let supervisor = Supervisor::new(
            dir.path().join("geotrail.pid"),
            &log,
            "sh",
            vec!["-c".to_string(), script.to_string()],
        );

        let StartOutcome::Started { pid } = supervisor.start().unwrap() else {
            panic!("expected a fresh start");
        };

        let expected = format!("pid={pid} sid={pid}");
        for _ in 0..50 {
            if std::fs::read_to_string(&log).unwrap_or_default().contains(&expected) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        panic!(
            "loop is not a session leader: {:?}",
            std::fs::read_to_string(&log).unwrap_or_default()
        );
    }

    #[tokio::test]
    async fn test_hangup_is_ignored_until_terminate() {
        let waiter = tokio::spawn(shutdown_signal());
        // Let the handlers install before raising anything.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // SAFETY: raise(3) only delivers a signal to this process, which now
        // handles it through tokio.
        unsafe { libc::raise(libc::SIGHUP) };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!waiter.is_finished(), "SIGHUP must not stop the loop");

        // SAFETY: as above.
        unsafe { libc::raise(libc::SIGTERM) };
        let name = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(name, "SIGTERM");
    }

    #[test]
    fn test_stop_signals_lock_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geotrail.pid");

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let _lock = InstanceLock::acquire(&path).unwrap();
        // Point the pid file at the sleeper while this process holds the lock.
        std::fs::write(&path, format!("{}\n", child.id())).unwrap();

        let supervisor = Supervisor::new(&path, dir.path().join("geotrail.log"), "true", vec![]);
        assert_eq!(
            supervisor.stop().unwrap(),
            StopOutcome::Stopped { pid: child.id() }
        );

        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}

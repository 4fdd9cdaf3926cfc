//! Escalating graceful stop for processes and container instances.
//!
//! `stop` asks a unit to terminate, waits a bounded time for it to exit and
//! then kills it. A unit that is already gone counts as stopped at every
//! step, so stopping twice is harmless.

use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Graceful window used for raw game processes.
pub const PROCESS_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

impl StopSignal {
    pub fn as_nix(self) -> Signal {
        match self {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Anything that can be stopped with the escalating protocol.
#[async_trait]
pub trait Supervised: Send {
    /// Human readable name used in logs and errors.
    fn describe(&self) -> String;

    async fn is_running(&mut self) -> Result<bool>;

    /// Deliver `signal`. Returns `Error::Gone` when the unit no longer exists.
    async fn signal(&mut self, signal: StopSignal) -> Result<()>;

    /// Resolve once the unit has exited.
    async fn wait_exit(&mut self) -> Result<()>;
}

/// Stop `unit`, escalating from terminate to kill after `timeout`.
///
/// Every failing step is collected into the returned error.
pub async fn stop(unit: &mut dyn Supervised, timeout: Duration) -> Result<()> {
    let name = unit.describe();

    match unit.is_running().await {
        Ok(false) => {
            debug!(unit = %name, "already exited");
            return Ok(());
        }
        Ok(true) => {}
        Err(e) if e.is_gone() => return Ok(()),
        Err(e) => warn!(unit = %name, err = %e, "livecheck failed, stopping anyway"),
    }

    let mut failures = Vec::new();

    info!(unit = %name, "sending terminate");
    match unit.signal(StopSignal::Terminate).await {
        Ok(()) => match tokio::time::timeout(timeout, unit.wait_exit()).await {
            Ok(Ok(())) => {
                info!(unit = %name, "exited after terminate");
                return Ok(());
            }
            Ok(Err(e)) if e.is_gone() => return Ok(()),
            Ok(Err(e)) => failures.push(e),
            Err(_) => warn!(unit = %name, ?timeout, "did not exit in time"),
        },
        Err(e) if e.is_gone() => return Ok(()),
        Err(e) => failures.push(e),
    }

    warn!(unit = %name, "sending kill");
    match unit.signal(StopSignal::Kill).await {
        Ok(()) => {}
        Err(e) if e.is_gone() => {}
        Err(e) => failures.push(e),
    }

    Error::join(failures)
}

/// A child process spawned by this server.
pub struct ChildProcess {
    name: String,
    child: Child,
}

impl ChildProcess {
    pub fn new(name: impl Into<String>, child: Child) -> Self {
        Self {
            name: name.into(),
            child,
        }
    }
}

#[async_trait]
impl Supervised for ChildProcess {
    fn describe(&self) -> String {
        match self.child.id() {
            Some(pid) => format!("{} (pid {})", self.name, pid),
            None => self.name.clone(),
        }
    }

    async fn is_running(&mut self) -> Result<bool> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| Error::io(format!("livecheck {}", self.name), e))?;
        Ok(status.is_none())
    }

    async fn signal(&mut self, signal: StopSignal) -> Result<()> {
        // Reaped children have no pid any more.
        let Some(pid) = self.child.id() else {
            return Err(Error::Gone(self.describe()));
        };
        match kill(Pid::from_raw(pid as i32), signal.as_nix()) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(Error::Gone(self.describe())),
            Err(e) => Err(Error::io(
                format!("send {:?} to {}", signal, self.name),
                e.into(),
            )),
        }
    }

    async fn wait_exit(&mut self) -> Result<()> {
        self.child
            .wait()
            .await
            .map(|_| ())
            .map_err(|e| Error::io(format!("wait for {}", self.name), e))
    }
}

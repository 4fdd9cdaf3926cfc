//! Container runtime access through the `docker` command line.

use crate::error::{Error, Result};
use crate::supervisor::{StopSignal, Supervised};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Append-only log shared between a sandbox and its background tasks.
#[derive(Clone, Default)]
pub struct SessionLog(Arc<Mutex<String>>);

impl SessionLog {
    pub fn append(&self, text: &str) {
        if let Ok(mut log) = self.0.lock() {
            log.push_str(text);
        }
    }

    pub fn line(&self, line: &str) {
        if let Ok(mut log) = self.0.lock() {
            log.push_str(line);
            log.push('\n');
        }
    }

    pub fn snapshot(&self) -> String {
        self.0.lock().map(|log| log.clone()).unwrap_or_default()
    }
}

/// Host directory mounted into a container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: String,
    pub target: String,
    pub read_only: bool,
}

/// Resolves to the instance's combined output once it exits.
pub type InstanceOutput = BoxFuture<'static, Result<Vec<u8>>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Build `tag`, streaming build output into `log`.
    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &Path,
        context: &Path,
        log: &SessionLog,
    ) -> Result<()>;

    /// Start a named instance. The instance keeps running after this returns.
    async fn run(&self, name: &str, image: &str, mounts: &[Mount]) -> Result<InstanceOutput>;

    /// Host pid of the instance's init process, `None` while not running.
    async fn inspect_pid(&self, name: &str) -> Result<Option<u32>>;

    async fn is_running(&self, name: &str) -> Result<bool>;

    /// Returns `Error::Gone` when the instance is missing or not running.
    async fn signal(&self, name: &str, signal: StopSignal) -> Result<()>;

    async fn wait(&self, name: &str) -> Result<()>;

    async fn logs(&self, name: &str) -> Result<String>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn remove_image(&self, image: &str) -> Result<()>;
}

/// Runtime backed by the `docker` binary.
pub struct DockerCli {
    program: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }
}

impl DockerCli {
    async fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(cmd = ?args, "docker");
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::io(format!("spawn {} {}", self.program, args.join(" ")), e))
    }

    async fn checked(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if !output.status.success() {
            return Err(Error::Runtime {
                command: format!("{} {}", self.program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn stream_lines<R>(reader: R, log: SessionLog) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "docker", "{}", line);
            log.line(&line);
        }
    })
}

fn is_gone_message(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("is not running")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self
            .output(&["image", "inspect", image])
            .await?
            .status
            .success())
    }

    async fn build_image(
        &self,
        tag: &str,
        dockerfile: &Path,
        context: &Path,
        log: &SessionLog,
    ) -> Result<()> {
        let dockerfile = dockerfile.to_string_lossy();
        let context = context.to_string_lossy();
        let args = ["build", "-t", tag, "-f", &*dockerfile, &*context];
        info!(image = %tag, "building image");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io("spawn docker build", e))?;

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(stream_lines(stdout, log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(stream_lines(stderr, log.clone()));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::io("wait for docker build", e))?;
        for pump in pumps {
            let _ = pump.await;
        }

        if !status.success() {
            return Err(Error::Build(format!("docker build of {tag} exited with {status}")));
        }
        Ok(())
    }

    async fn run(&self, name: &str, image: &str, mounts: &[Mount]) -> Result<InstanceOutput> {
        let mut args = vec!["run".to_string(), "--name".to_string(), name.to_string()];
        for mount in mounts {
            args.push("-v".to_string());
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push(format!("{}:{}:{}", mount.host, mount.target, mode));
        }
        args.push(image.to_string());
        info!(cmd = ?args, "running container");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io("spawn docker run", e))?;

        Ok(Box::pin(async move {
            let output = child
                .wait_with_output()
                .await
                .map_err(|e| Error::io("wait for docker run", e))?;
            if !output.status.success() {
                warn!(status = %output.status, "container exited unsuccessfully");
            }
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            Ok(combined)
        }))
    }

    async fn inspect_pid(&self, name: &str) -> Result<Option<u32>> {
        let out = self
            .checked(&["inspect", "-f", "{{.State.Pid}}", name])
            .await?;
        let pid: u32 = out
            .trim()
            .parse()
            .map_err(|_| Error::Build(format!("unexpected pid {:?} for {name}", out.trim())))?;
        Ok((pid != 0).then_some(pid))
    }

    async fn is_running(&self, name: &str) -> Result<bool> {
        let output = self
            .output(&["inspect", "-f", "{{.State.Running}}", name])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Err(Error::Gone(name.to_string()));
            }
            return Err(Error::Runtime {
                command: format!("docker inspect {name}"),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn signal(&self, name: &str, signal: StopSignal) -> Result<()> {
        let flag = format!("--signal={}", signal.as_nix().as_str());
        match self.checked(&["kill", flag.as_str(), name]).await {
            Err(Error::Runtime { stderr, .. }) if is_gone_message(&stderr) => {
                Err(Error::Gone(name.to_string()))
            }
            other => other.map(|_| ()),
        }
    }

    async fn wait(&self, name: &str) -> Result<()> {
        match self.checked(&["wait", name]).await {
            Err(Error::Runtime { stderr, .. }) if is_gone_message(&stderr) => {
                Err(Error::Gone(name.to_string()))
            }
            other => other.map(|_| ()),
        }
    }

    async fn logs(&self, name: &str) -> Result<String> {
        let output = self.output(&["logs", name]).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Error::Runtime {
                command: format!("docker logs {name}"),
                stderr: text,
            });
        }
        Ok(text)
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.checked(&["rm", "--force", name]).await.map(|_| ())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.checked(&["rmi", image]).await.map(|_| ())
    }
}

/// A running container instance, stopped through its runtime.
pub struct ContainerUnit {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
    pid: u32,
}

impl ContainerUnit {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, name: String, pid: u32) -> Self {
        Self { runtime, name, pid }
    }
}

#[async_trait]
impl Supervised for ContainerUnit {
    fn describe(&self) -> String {
        format!("container {} (pid {})", self.name, self.pid)
    }

    async fn is_running(&mut self) -> Result<bool> {
        self.runtime.is_running(&self.name).await
    }

    async fn signal(&mut self, signal: StopSignal) -> Result<()> {
        self.runtime.signal(&self.name, signal).await
    }

    async fn wait_exit(&mut self) -> Result<()> {
        self.runtime.wait(&self.name).await
    }
}

/// Poll until the instance reports a host pid.
pub async fn resolve_pid(
    runtime: &dyn ContainerRuntime,
    name: &str,
    attempts: u32,
    interval: Duration,
) -> Result<u32> {
    let mut last_err = None;
    for _ in 0..attempts {
        match runtime.inspect_pid(name).await {
            Ok(Some(pid)) => return Ok(pid),
            Ok(None) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(interval).await;
    }
    Err(last_err.unwrap_or_else(|| {
        Error::Build(format!("container {name} did not report a pid"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_log_accumulates() {
        let log = SessionLog::default();
        log.line("building");
        log.append("done");
        assert_eq!(log.snapshot(), "building\ndone");
    }

    #[test]
    fn recognises_gone_instances() {
        assert!(is_gone_message("Error response from daemon: No such container: x"));
        assert!(is_gone_message("Error response from daemon: Container abc is not running"));
        assert!(!is_gone_message("permission denied"));
    }
}

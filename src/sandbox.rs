//! Per-session container sandboxes.
//!
//! Every game instance gets its own image layered on a shared GUI base
//! image, and its own named container with the game sources mounted
//! read-only. Stopping a sandbox removes both the container and the
//! per-session image.

use crate::config::{GameSpec, Resolution};
use crate::docker::{resolve_pid, ContainerRuntime, ContainerUnit, Mount, SessionLog};
use crate::env::expand_from;
use crate::error::{Error, Result};
use crate::supervisor;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Where game sources are mounted inside the container.
pub const GAME_MOUNT: &str = "/game";

const BASE_DOCKERFILE: &str = r#"FROM ubuntu:noble

RUN apt-get update

RUN apt-get install -y pkg-config libx11-dev libasound2-dev libudev-dev libxcb-render0-dev libxcb-shape0-dev libxcb-xfixes0-dev

# Virtual display, capture and audio
RUN apt-get install -y \
    xvfb \
    x11-utils \
    xdotool \
    ffmpeg \
    pulseaudio \
    libgl1-mesa-dri \
    mesa-utils libglu1-mesa-dev freeglut3-dev mesa-common-dev \
    libglew-dev libglfw3-dev libglm-dev libao-dev libmpg123-dev

RUN apt-get install -y openbox

ENV DISPLAY=:99
ENV COLOR_DEPTH=24
"#;

/// Environment the games expect, pointing inside the container.
const GAME_ENV: [(&str, &str); 5] = [
    ("XDG_CACHE_HOME", "/root/.cache"),
    ("XDG_CONFIG_HOME", "/root/.config"),
    ("XDG_DATA_HOME", "/root/.local/share"),
    ("XDG_RUNTIME_DIR", "/root/.local/run"),
    ("XDG_STATE_HOME", "/root/.local/state"),
];

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub base_image: String,
    pub resolution: Resolution,
    /// Graceful window before the container is killed.
    pub stop_timeout: Duration,
    pub pid_attempts: u32,
    pub pid_interval: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_image: "playhost-gui".to_string(),
            resolution: Resolution::default(),
            stop_timeout: Duration::from_secs(5),
            pid_attempts: 20,
            pid_interval: Duration::from_millis(250),
        }
    }
}

/// Generated image definition and startup script for one game.
#[derive(Debug, Clone)]
pub struct SandboxPlan {
    pub working_directory: String,
    pub dockerfile: String,
    pub entrypoint_script: String,
}

impl SandboxPlan {
    pub fn new(spec: &GameSpec, settings: &SandboxSettings) -> Self {
        let vars: HashMap<&str, &str> = GAME_ENV.into_iter().collect();
        let expanded = expand_from(&spec.working_directory, &vars);
        let working_directory = if expanded.starts_with('/') {
            expanded
        } else {
            Path::new(GAME_MOUNT)
                .join(expanded)
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        };

        let mut dockerfile = format!("FROM {}\n\nWORKDIR {}\n", settings.base_image, working_directory);
        for (key, value) in GAME_ENV {
            dockerfile.push_str(&format!("ENV {key}={value}\n"));
        }
        dockerfile.push_str("COPY entrypoint.sh /entrypoint.sh\n");
        dockerfile.push_str("RUN chmod +x /entrypoint.sh\n\n");
        dockerfile.push_str("ENTRYPOINT [\"/entrypoint.sh\"]\n");

        let entrypoint_script = format!(
            "#!/bin/sh\n\n\
             Xvfb :99 -screen 0 {resolution}x24 &\n\n\
             while ! xdpyinfo -display :99 >/dev/null 2>&1; do\n    \
             echo \"Waiting for Xvfb...\"\n    \
             sleep 0.1\n\
             done\n\n\
             openbox-session &\n\
             sleep 1\n\n\
             cd {dir}\n\
             exec ./{entrypoint}\n",
            resolution = settings.resolution,
            dir = working_directory,
            entrypoint = spec.entrypoint,
        );

        Self {
            working_directory,
            dockerfile,
            entrypoint_script,
        }
    }
}

/// Docker names must be lowercase and limited to a small alphabet.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_' | '.' | '-') => c,
            _ => '-',
        })
        .collect()
}

/// Builds sandboxes and owns the shared base image.
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
    base_image: OnceCell<std::result::Result<(), String>>,
}

impl SandboxManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SandboxSettings) -> Self {
        Self {
            runtime,
            settings,
            base_image: OnceCell::new(),
        }
    }

    /// Build the base image once per process; the outcome is cached.
    pub async fn ensure_base_image(&self) -> Result<()> {
        self.base_image
            .get_or_init(|| async {
                self.build_base_image().await.map_err(|e| {
                    error!(err = %e, "base image build failed");
                    e.to_string()
                })
            })
            .await
            .clone()
            .map_err(Error::Build)
    }

    async fn build_base_image(&self) -> Result<()> {
        let image = &self.settings.base_image;
        if self.runtime.image_exists(image).await? {
            info!(image = %image, "base image present");
            return Ok(());
        }

        let dir = tempfile::Builder::new()
            .prefix("playhost-base-")
            .tempdir()
            .map_err(|e| Error::io("create base image dir", e))?;
        let dockerfile = dir.path().join("Dockerfile");
        fs::write(&dockerfile, BASE_DOCKERFILE)
            .map_err(|e| Error::io("write base Dockerfile", e))?;

        self.runtime
            .build_image(image, &dockerfile, dir.path(), &SessionLog::default())
            .await?;
        info!(image = %image, "base image built");
        Ok(())
    }

    /// Build and start a fresh sandbox for `spec`.
    pub async fn create(&self, session_id: &str, spec: Arc<GameSpec>) -> Result<Sandbox> {
        self.ensure_base_image().await?;

        let image = sanitize(&format!("playhost-{}-{}", spec.slug, session_id));
        let container = format!("{image}-container");
        let plan = SandboxPlan::new(&spec, &self.settings);
        let log = SessionLog::default();

        let dir = tempfile::Builder::new()
            .prefix("playhost-docker-")
            .tempdir()
            .map_err(|e| Error::io("create build dir", e))?;
        write_build_context(dir.path(), &plan)?;
        log.line("Generated entrypoint.sh:");
        log.append(&plan.entrypoint_script);

        self.runtime
            .build_image(&image, &dir.path().join("Dockerfile"), dir.path(), &log)
            .await?;

        match self.start(&container, &image, &spec, &log).await {
            Ok((pid, watcher)) => {
                info!(session = %session_id, container = %container, pid, "sandbox running");
                Ok(Sandbox {
                    image,
                    container: container.clone(),
                    log,
                    unit: ContainerUnit::new(self.runtime.clone(), container, pid),
                    runtime: self.runtime.clone(),
                    stop_timeout: self.settings.stop_timeout,
                    watcher,
                })
            }
            Err(e) => {
                warn!(session = %session_id, err = %e, "sandbox failed to start, cleaning up");
                if let Err(cleanup) =
                    Error::join(remove_all(self.runtime.as_ref(), &container, &image).await)
                {
                    warn!(err = %cleanup, "cleanup after failed start");
                }
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        container: &str,
        image: &str,
        spec: &GameSpec,
        log: &SessionLog,
    ) -> Result<(u32, JoinHandle<()>)> {
        let mounts = [Mount {
            host: spec.source.clone(),
            target: GAME_MOUNT.to_string(),
            read_only: true,
        }];
        log.line(&format!("Running container {container} from {image}"));
        let output = self.runtime.run(container, image, &mounts).await?;

        let pid = resolve_pid(
            self.runtime.as_ref(),
            container,
            self.settings.pid_attempts,
            self.settings.pid_interval,
        )
        .await?;
        log.line(&format!("Container pid {pid}"));

        let runtime = self.runtime.clone();
        let name = container.to_string();
        let log = log.clone();
        let watcher = tokio::spawn(async move {
            match output.await {
                Ok(bytes) => {
                    log.line(&format!("Container output: {}", String::from_utf8_lossy(&bytes)));
                    if bytes.is_empty() {
                        log.line("Container output is empty. Checking container logs...");
                        match runtime.logs(&name).await {
                            Ok(text) => log.line(&format!("Container logs: {text}")),
                            Err(e) => log.line(&format!("Error getting container logs: {e}")),
                        }
                    }
                }
                Err(e) => log.line(&format!("Container error: {e}")),
            }
        });

        Ok((pid, watcher))
    }
}

fn write_build_context(dir: &Path, plan: &SandboxPlan) -> Result<()> {
    fs::write(dir.join("Dockerfile"), &plan.dockerfile)
        .map_err(|e| Error::io("write Dockerfile", e))?;
    let script = dir.join("entrypoint.sh");
    fs::write(&script, &plan.entrypoint_script)
        .map_err(|e| Error::io("write entrypoint.sh", e))?;
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io("chmod entrypoint.sh", e))?;
    Ok(())
}

/// Remove container then image; both are attempted regardless.
async fn remove_all(runtime: &dyn ContainerRuntime, container: &str, image: &str) -> Vec<Error> {
    let mut failures = Vec::new();
    if let Err(e) = runtime.remove_container(container).await {
        failures.push(e);
    }
    if let Err(e) = runtime.remove_image(image).await {
        failures.push(e);
    }
    failures
}

/// A running sandbox owned by one game.
pub struct Sandbox {
    image: String,
    container: String,
    log: SessionLog,
    unit: ContainerUnit,
    runtime: Arc<dyn ContainerRuntime>,
    stop_timeout: Duration,
    watcher: JoinHandle<()>,
}

impl Sandbox {
    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Stop the container, then remove it and its image.
    pub async fn stop(mut self) -> Result<()> {
        info!(container = %self.container, "stopping sandbox");
        let mut failures = Vec::new();
        if let Err(e) = supervisor::stop(&mut self.unit, self.stop_timeout).await {
            failures.push(e);
        }
        failures.extend(remove_all(self.runtime.as_ref(), &self.container, &self.image).await);

        // The output watcher ends once the instance is gone.
        if tokio::time::timeout(Duration::from_secs(1), &mut self.watcher)
            .await
            .is_err()
        {
            self.watcher.abort();
        }
        Error::join(failures)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::docker::InstanceOutput;
    use crate::supervisor::StopSignal;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory runtime that records every call.
    #[derive(Default)]
    pub(crate) struct FakeRuntime {
        pub calls: Mutex<Vec<String>>,
        pub base_exists: bool,
        pub fail_remove_container: bool,
        pub fail_remove_image: bool,
        pub no_pid: bool,
        pub running: AtomicBool,
    }

    impl FakeRuntime {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn failure(command: &str) -> Error {
            Error::Runtime {
                command: command.to_string(),
                stderr: "boom".to_string(),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn image_exists(&self, image: &str) -> Result<bool> {
            self.record(format!("exists {image}"));
            Ok(self.base_exists)
        }

        async fn build_image(
            &self,
            tag: &str,
            dockerfile: &Path,
            _context: &Path,
            log: &SessionLog,
        ) -> Result<()> {
            assert!(dockerfile.exists());
            tokio::task::yield_now().await;
            self.record(format!("build {tag}"));
            log.line("Step 1/1 : done");
            Ok(())
        }

        async fn run(&self, name: &str, _image: &str, mounts: &[Mount]) -> Result<InstanceOutput> {
            self.record(format!("run {name} {}:{}", mounts[0].host, mounts[0].target));
            self.running.store(true, Ordering::SeqCst);
            Ok(Box::pin(async { Ok(Vec::new()) }))
        }

        async fn inspect_pid(&self, _name: &str) -> Result<Option<u32>> {
            Ok((!self.no_pid).then_some(4242))
        }

        async fn is_running(&self, _name: &str) -> Result<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }

        async fn signal(&self, name: &str, signal: StopSignal) -> Result<()> {
            self.record(format!("signal {name} {signal:?}"));
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn logs(&self, _name: &str) -> Result<String> {
            Ok("game started".to_string())
        }

        async fn remove_container(&self, name: &str) -> Result<()> {
            self.record(format!("rm {name}"));
            if self.fail_remove_container {
                return Err(Self::failure("rm"));
            }
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> Result<()> {
            self.record(format!("rmi {image}"));
            if self.fail_remove_image {
                return Err(Self::failure("rmi"));
            }
            Ok(())
        }
    }

    pub(crate) fn pong() -> Arc<GameSpec> {
        Arc::new(GameSpec {
            slug: "pong".into(),
            title: "Pong".into(),
            source: "/srv/games/pong".into(),
            working_directory: "/game".into(),
            entrypoint: "pong.bin".into(),
            ..Default::default()
        })
    }

    fn fast_settings() -> SandboxSettings {
        SandboxSettings {
            pid_attempts: 3,
            pid_interval: Duration::from_millis(1),
            stop_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn plan_changes_into_working_directory() {
        let plan = SandboxPlan::new(&pong(), &SandboxSettings::default());
        assert!(plan.entrypoint_script.contains("\ncd /game\n"));
        assert!(plan.entrypoint_script.contains("./pong.bin\n"));
        assert!(plan.entrypoint_script.contains("Xvfb :99 -screen 0 1920x1080x24 &"));
        assert!(plan.dockerfile.starts_with("FROM playhost-gui\n"));
        assert!(plan.dockerfile.contains("WORKDIR /game\n"));
        assert!(plan.dockerfile.contains("ENV XDG_DATA_HOME=/root/.local/share\n"));
        assert!(plan.dockerfile.ends_with("ENTRYPOINT [\"/entrypoint.sh\"]\n"));
    }

    #[test]
    fn relative_working_directory_resolves_under_mount() {
        let mut spec = (*pong()).clone();
        spec.working_directory = "bin/linux".into();
        assert_eq!(
            SandboxPlan::new(&spec, &SandboxSettings::default()).working_directory,
            "/game/bin/linux"
        );

        spec.working_directory = String::new();
        assert_eq!(
            SandboxPlan::new(&spec, &SandboxSettings::default()).working_directory,
            "/game"
        );

        spec.working_directory = "${XDG_DATA_HOME}/pong".into();
        assert_eq!(
            SandboxPlan::new(&spec, &SandboxSettings::default()).working_directory,
            "/root/.local/share/pong"
        );
    }

    #[test]
    fn names_are_docker_safe() {
        assert_eq!(sanitize("playhost-Super Pong-17/x"), "playhost-super-pong-17-x");
    }

    #[tokio::test]
    async fn base_image_builds_once_under_concurrency() {
        let runtime = Arc::new(FakeRuntime::default());
        let manager = Arc::new(SandboxManager::new(runtime.clone(), fast_settings()));

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure_base_image().await }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.ensure_base_image().await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        manager.ensure_base_image().await.unwrap();

        let builds = runtime
            .calls()
            .iter()
            .filter(|c| *c == "build playhost-gui")
            .count();
        assert_eq!(builds, 1);
    }

    #[tokio::test]
    async fn existing_base_image_is_not_rebuilt() {
        let runtime = Arc::new(FakeRuntime {
            base_exists: true,
            ..Default::default()
        });
        let manager = SandboxManager::new(runtime.clone(), fast_settings());
        manager.ensure_base_image().await.unwrap();
        assert_eq!(runtime.calls(), vec!["exists playhost-gui".to_string()]);
    }

    #[tokio::test]
    async fn create_then_stop_removes_everything() {
        let runtime = Arc::new(FakeRuntime {
            base_exists: true,
            ..Default::default()
        });
        let manager = SandboxManager::new(runtime.clone(), fast_settings());
        let sandbox = manager.create("17-abc", pong()).await.unwrap();
        assert_eq!(sandbox.image, "playhost-pong-17-abc");
        assert_eq!(sandbox.container, "playhost-pong-17-abc-container");

        // Empty output falls back to the instance's own logs.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let log = sandbox.log().snapshot();
        assert!(log.contains("Step 1/1 : done"));
        assert!(log.contains("Container logs: game started"));

        sandbox.stop().await.unwrap();
        let calls = runtime.calls();
        assert!(calls.contains(&"run playhost-pong-17-abc-container /srv/games/pong:/game".to_string()));
        assert!(calls.contains(&"signal playhost-pong-17-abc-container Terminate".to_string()));
        assert!(calls.contains(&"rm playhost-pong-17-abc-container".to_string()));
        assert!(calls.contains(&"rmi playhost-pong-17-abc".to_string()));
        assert!(!calls.contains(&"rmi playhost-gui".to_string()));
    }

    #[tokio::test]
    async fn image_removal_attempted_when_container_removal_fails() {
        let runtime = Arc::new(FakeRuntime {
            base_exists: true,
            fail_remove_container: true,
            ..Default::default()
        });
        let manager = SandboxManager::new(runtime.clone(), fast_settings());
        let sandbox = manager.create("s1", pong()).await.unwrap();

        let err = sandbox.stop().await.unwrap_err();
        assert_eq!(err.causes().len(), 1);
        assert!(runtime.calls().contains(&"rmi playhost-pong-s1".to_string()));
    }

    #[tokio::test]
    async fn joined_error_reports_every_failed_removal() {
        let runtime = Arc::new(FakeRuntime {
            base_exists: true,
            fail_remove_container: true,
            fail_remove_image: true,
            ..Default::default()
        });
        let manager = SandboxManager::new(runtime.clone(), fast_settings());
        let sandbox = manager.create("s2", pong()).await.unwrap();

        let err = sandbox.stop().await.unwrap_err();
        assert_eq!(err.causes().len(), 2);
        assert!(err.to_string().contains("`rm` failed"));
        assert!(err.to_string().contains("`rmi` failed"));
    }

    #[tokio::test]
    async fn failed_start_cleans_up_and_surfaces_error() {
        let runtime = Arc::new(FakeRuntime {
            base_exists: true,
            no_pid: true,
            ..Default::default()
        });
        let manager = SandboxManager::new(runtime.clone(), fast_settings());
        assert!(manager.create("s3", pong()).await.is_err());

        let calls = runtime.calls();
        assert!(calls.contains(&"rm playhost-pong-s3-container".to_string()));
        assert!(calls.contains(&"rmi playhost-pong-s3".to_string()));
    }
}

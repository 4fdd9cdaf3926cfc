//! A running game bound to one session.

use crate::config::GameSpec;
use crate::docker::SessionLog;
use crate::env;
use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxManager, GAME_MOUNT};
use crate::supervisor::{self, ChildProcess, PROCESS_STOP_TIMEOUT};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::info;

enum Instance {
    Process(ChildProcess),
    Sandbox(Sandbox),
}

pub struct Game {
    spec: Arc<GameSpec>,
    instance: Instance,
    log: SessionLog,
}

impl Game {
    pub fn spec(&self) -> &GameSpec {
        &self.spec
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Stop the game and release everything it holds.
    pub async fn stop(self) -> Result<()> {
        info!(game = %self.spec.slug, "stopping game");
        match self.instance {
            Instance::Process(mut process) => supervisor::stop(&mut process, PROCESS_STOP_TIMEOUT).await,
            Instance::Sandbox(sandbox) => sandbox.stop().await,
        }
    }
}

/// Starts games for sessions.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, session_id: &str, spec: Arc<GameSpec>) -> Result<Game>;
}

#[async_trait]
impl Launcher for SandboxManager {
    async fn launch(&self, session_id: &str, spec: Arc<GameSpec>) -> Result<Game> {
        let sandbox = self.create(session_id, spec.clone()).await?;
        Ok(Game {
            spec,
            log: sandbox.log().clone(),
            instance: Instance::Sandbox(sandbox),
        })
    }
}

/// Runs the entrypoint directly on the host display.
pub struct ProcessLauncher {
    display: String,
}

impl ProcessLauncher {
    pub fn new(display: impl Into<String>) -> Self {
        Self {
            display: display.into(),
        }
    }
}

/// Working directory on the host. Paths under the container mount point
/// are mapped back onto the source directory.
pub fn host_working_directory(spec: &GameSpec) -> PathBuf {
    let source = PathBuf::from(env::expand(&spec.source));
    let dir = env::expand(&spec.working_directory);
    let dir = Path::new(&dir);
    match dir.strip_prefix(GAME_MOUNT) {
        Ok(rest) => source.join(rest),
        Err(_) if dir.is_absolute() => dir.to_path_buf(),
        Err(_) => source.join(dir),
    }
}

fn pump<R>(reader: R, log: SessionLog)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "game", "{}", line);
            log.line(&line);
        }
    });
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, session_id: &str, spec: Arc<GameSpec>) -> Result<Game> {
        let dir = host_working_directory(&spec);
        let program = dir.join(&spec.entrypoint);
        info!(session = %session_id, program = %program.display(), "starting game process");

        let mut child = Command::new(&program)
            .current_dir(&dir)
            .env("DISPLAY", &self.display)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io(format!("spawn {}", program.display()), e))?;

        let log = SessionLog::default();
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, log.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, log.clone());
        }

        Ok(Game {
            instance: Instance::Process(ChildProcess::new(spec.slug.clone(), child)),
            spec,
            log,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// A game directory whose entrypoint prints a line and then idles.
    pub(crate) fn idle_game(dir: &Path, slug: &str) -> Arc<GameSpec> {
        let script = dir.join("run.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"started in $(pwd)\"\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        Arc::new(GameSpec {
            slug: slug.into(),
            title: slug.into(),
            source: dir.to_string_lossy().into_owned(),
            entrypoint: "run.sh".into(),
            ..Default::default()
        })
    }

    #[test]
    fn maps_working_directory_onto_source() {
        let mut spec = GameSpec {
            source: "/srv/pong".into(),
            working_directory: "/game/bin".into(),
            ..Default::default()
        };
        assert_eq!(host_working_directory(&spec), PathBuf::from("/srv/pong/bin"));

        spec.working_directory = "/game".into();
        assert_eq!(host_working_directory(&spec), PathBuf::from("/srv/pong"));

        spec.working_directory = "levels".into();
        assert_eq!(host_working_directory(&spec), PathBuf::from("/srv/pong/levels"));

        spec.working_directory = "/opt/pong".into();
        assert_eq!(host_working_directory(&spec), PathBuf::from("/opt/pong"));
    }

    #[tokio::test]
    async fn process_game_runs_in_its_directory_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(":99");
        let game = launcher
            .launch("s1", idle_game(dir.path(), "idle"))
            .await
            .unwrap();
        assert_eq!(game.spec().slug, "idle");

        let leaf = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        let expected = "started in /";
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let log = game.log().snapshot();
                if log.contains(expected) && log.contains(&leaf) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        game.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_entrypoint_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let spec = Arc::new(GameSpec {
            slug: "ghost".into(),
            source: dir.path().to_string_lossy().into_owned(),
            entrypoint: "nope".into(),
            ..Default::default()
        });
        assert!(matches!(
            ProcessLauncher::new(":99").launch("s1", spec).await,
            Err(Error::Io { .. })
        ));
    }
}

//! playhost - stream sandboxed games to the browser over WebRTC.
//!
//! Usage:
//!   playhost serve [--port 8080] [--config config.yaml]   # catalog server
//!   playhost host <binary> [--port 80]                     # one game, no catalog

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

mod config;
mod docker;
mod env;
mod error;
mod game;
mod http_server;
mod media;
mod rtc;
mod sandbox;
mod session;
mod signaling;
mod state;
mod supervisor;

use clap::{Parser, Subcommand, ValueEnum};
use config::{Catalog, GameSpec, Resolution};
use docker::DockerCli;
use error::{Error, Result};
use game::{Launcher, ProcessLauncher};
use http_server::Mode;
use media::{CaptureKind, MediaSettings};
use rtc::RtcSettings;
use sandbox::{SandboxManager, SandboxSettings};
use state::{AppState, Orchestrator, HOST_SESSION};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "playhost")]
#[command(about = "Stream sandboxed games to the browser over WebRTC")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, global = true)]
    debug: bool,

    /// Capture and virtual display size
    #[arg(long, env = "RESOLUTION", default_value = "1920x1080", global = true)]
    resolution: Resolution,

    /// X display to capture
    #[arg(long, env = "DISPLAY", default_value = ":99", global = true)]
    display: String,

    /// Frame source for the video track
    #[arg(long, value_enum, default_value_t = Capture::X11, global = true)]
    capture: Capture,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the game catalog, one sandboxed game per browser session
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Game catalog; created empty when missing
        #[arg(long, default_value = "config.yaml")]
        config: PathBuf,

        /// How games are run
        #[arg(long, value_enum, default_value_t = RuntimeKind::Docker)]
        runtime: RuntimeKind,

        /// Directory served under /public
        #[arg(long, default_value = "./public")]
        public: PathBuf,

        /// Reap sessions idle this long without a connection (0 disables)
        #[arg(long, default_value = "1800")]
        session_ttl_secs: u64,
    },
    /// Run one game binary directly and stream it
    Host {
        /// Game executable
        binary: PathBuf,

        /// Port to listen on
        #[arg(long, default_value = "80")]
        port: u16,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Capture {
    X11,
    TestPattern,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RuntimeKind {
    Docker,
    Process,
}

fn main() {
    // Environment is only mutated while the process is single threaded.
    if let Err(e) = env::ensure_common_env() {
        eprintln!("Error: {}", e);
        exit(1);
    }

    let args = Args::parse();
    init_tracing(args.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start async runtime: {}", e);
            exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        error!(err = %e, "fatal");
        exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args) -> Result<()> {
    let capture = match args.capture {
        Capture::X11 => CaptureKind::X11 {
            display: args.display.clone(),
        },
        Capture::TestPattern => CaptureKind::TestPattern,
    };
    let media = MediaSettings::new(args.resolution, capture);
    let rtc = RtcSettings::default();

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    match args.command {
        Commands::Serve {
            port,
            config,
            runtime,
            public,
            session_ttl_secs,
        } => {
            let catalog = Catalog::load(&config)?;
            let launcher: Arc<dyn Launcher> = match runtime {
                RuntimeKind::Docker => Arc::new(SandboxManager::new(
                    Arc::new(DockerCli::default()),
                    SandboxSettings {
                        resolution: args.resolution,
                        ..Default::default()
                    },
                )),
                RuntimeKind::Process => Arc::new(ProcessLauncher::new(args.display.clone())),
            };
            let ttl = (session_ttl_secs > 0).then(|| Duration::from_secs(session_ttl_secs));
            let orchestrator = Arc::new(Orchestrator::new(catalog, launcher, ttl));
            orchestrator.spawn_reaper(shutdown.clone());

            let state = AppState::new(orchestrator.clone(), rtc, media);
            let app = http_server::router(state, Mode::Catalog, Some(public));
            serve_until_shutdown(port, app, orchestrator, shutdown).await
        }
        Commands::Host { binary, port } => {
            let spec = host_spec(&binary)?;
            let slug = spec.slug.clone();
            let orchestrator = Arc::new(Orchestrator::new(
                Catalog::new(vec![spec]),
                Arc::new(ProcessLauncher::new(args.display.clone())),
                None,
            ));
            orchestrator.start_game(HOST_SESSION, &slug).await?;

            let state = AppState::new(orchestrator.clone(), rtc, media);
            let app = http_server::router(state, Mode::Host, None);
            serve_until_shutdown(port, app, orchestrator, shutdown).await
        }
    }
}

/// Serve until a shutdown signal, then tear down every session.
async fn serve_until_shutdown(
    port: u16,
    app: axum::Router,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) -> Result<()> {
    // Sessions are torn down as soon as shutdown fires so open signaling
    // channels close and the server can drain.
    let teardown = tokio::spawn({
        let shutdown = shutdown.clone();
        let orchestrator = orchestrator.clone();
        async move {
            shutdown.cancelled().await;
            orchestrator.shutdown().await;
        }
    });

    let served = http_server::run_server(port, app, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = teardown.await {
        error!(err = %e, "session teardown panicked");
    }
    info!("server stopped");
    served
}

async fn watch_signals(shutdown: CancellationToken) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(err = %e, "cannot watch SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
    shutdown.cancel();
}

/// Catalog entry for a bare executable: runs in its own directory.
fn host_spec(binary: &Path) -> Result<GameSpec> {
    let binary = std::fs::canonicalize(binary)
        .map_err(|e| Error::io(format!("resolve {}", binary.display()), e))?;
    let (Some(dir), Some(name)) = (binary.parent(), binary.file_name()) else {
        return Err(Error::UnknownGame(binary.display().to_string()));
    };
    let name = name.to_string_lossy().into_owned();
    Ok(GameSpec {
        slug: sandbox::sanitize(&name),
        title: name.clone(),
        source: dir.to_string_lossy().into_owned(),
        entrypoint: name,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_spec_runs_binary_from_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("Pong.bin");
        std::fs::write(&binary, "").unwrap();

        let spec = host_spec(&binary).unwrap();
        assert_eq!(spec.slug, "pong.bin");
        assert_eq!(spec.entrypoint, "Pong.bin");
        assert_eq!(spec.title, "Pong.bin");
        assert_eq!(
            PathBuf::from(&spec.source),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(game::host_working_directory(&spec), PathBuf::from(&spec.source));
    }

    #[test]
    fn missing_binary_is_an_error() {
        assert!(host_spec(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn cli_defaults() {
        let args = Args::try_parse_from(["playhost", "serve", "--capture", "test-pattern"]).unwrap();
        assert!(matches!(args.capture, Capture::TestPattern));
        let Commands::Serve {
            port,
            session_ttl_secs,
            runtime,
            ..
        } = args.command
        else {
            panic!("expected serve");
        };
        assert_eq!(port, 8080);
        assert_eq!(session_ttl_secs, 1800);
        assert!(matches!(runtime, RuntimeKind::Docker));
    }
}

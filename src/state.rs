//! Shared application state and the session registry.
//!
//! Each session owns at most one game and at most one realtime
//! connection. Slots are locked individually so a slow game start in one
//! session never blocks another.

use crate::config::Catalog;
use crate::error::{Error, Result};
use crate::game::{Game, Launcher};
use crate::media::MediaSettings;
use crate::rtc::RtcSettings;
use crate::signaling::Negotiator;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Session that owns the game in single-game host mode.
pub const HOST_SESSION: &str = "host";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSummary {
    pub slug: String,
    pub title: String,
}

struct Attached {
    id: u64,
    negotiator: Arc<dyn Negotiator>,
}

struct SessionSlot {
    game: Option<Game>,
    /// Launch whose result this slot will accept.
    launching: Option<u64>,
    connection: Option<Attached>,
    last_seen: Instant,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            game: None,
            launching: None,
            connection: None,
            last_seen: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }
}

pub struct Orchestrator {
    catalog: Catalog,
    launcher: Arc<dyn Launcher>,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionSlot>>>>,
    /// Idle sessions older than this are reaped. `None` keeps them forever.
    ttl: Option<Duration>,
    next_connection: AtomicU64,
    next_launch: AtomicU64,
}

fn stop_in_background(session: String, game: Game) {
    tokio::spawn(async move {
        let slug = game.spec().slug.clone();
        if let Err(e) = game.stop().await {
            error!(session = %session, game = %slug, err = %e, "failed to stop game");
        }
    });
}

fn close_in_background(negotiator: Arc<dyn Negotiator>) {
    tokio::spawn(async move { negotiator.close().await });
}

impl Orchestrator {
    pub fn new(catalog: Catalog, launcher: Arc<dyn Launcher>, ttl: Option<Duration>) -> Self {
        Self {
            catalog,
            launcher,
            sessions: RwLock::new(HashMap::new()),
            ttl,
            next_connection: AtomicU64::new(1),
            next_launch: AtomicU64::new(1),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    async fn slot(&self, session: &str) -> Arc<Mutex<SessionSlot>> {
        if let Some(slot) = self.sessions.read().await.get(session) {
            return slot.clone();
        }
        self.sessions
            .write()
            .await
            .entry(session.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionSlot::new())))
            .clone()
    }

    async fn existing(&self, session: &str) -> Option<Arc<Mutex<SessionSlot>>> {
        self.sessions.read().await.get(session).cloned()
    }

    /// Start `slug` for `session`, replacing whatever game it was running.
    ///
    /// The slot is only locked to swap games, not while the launcher runs,
    /// so the session stays usable during a slow image build. When a newer
    /// start overtakes this one, the newer game wins and this one is stopped.
    pub async fn start_game(&self, session: &str, slug: &str) -> Result<()> {
        let spec = self
            .catalog
            .lookup(slug)
            .ok_or_else(|| Error::UnknownGame(slug.to_string()))?;

        let launch = self.next_launch.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(session).await;
        {
            let mut slot = slot.lock().await;
            slot.touch();
            slot.launching = Some(launch);
            if let Some(previous) = slot.game.take() {
                info!(session = %session, game = %previous.spec().slug, "replacing running game");
                stop_in_background(session.to_string(), previous);
            }
        }

        let launched = self.launcher.launch(session, spec).await;

        let mut slot = slot.lock().await;
        let current = slot.launching == Some(launch);
        if current {
            slot.launching = None;
            slot.touch();
        }
        let game = launched?;
        if !current {
            info!(session = %session, game = %slug, "game start was superseded");
            stop_in_background(session.to_string(), game);
            return Ok(());
        }
        info!(session = %session, game = %slug, "game started");
        slot.game = Some(game);
        Ok(())
    }

    pub async fn active_game(&self, session: &str) -> Option<GameSummary> {
        let slot = self.existing(session).await?;
        let slot = slot.lock().await;
        slot.game.as_ref().map(|game| GameSummary {
            slug: game.spec().slug.clone(),
            title: game.spec().title.clone(),
        })
    }

    pub async fn game_log(&self, session: &str) -> Option<String> {
        let slot = self.existing(session).await?;
        let slot = slot.lock().await;
        slot.game.as_ref().map(|game| game.log().snapshot())
    }

    /// Bind a connection to `session`, closing the one it replaces.
    pub async fn attach(&self, session: &str, negotiator: Arc<dyn Negotiator>) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let slot = self.slot(session).await;
        let mut slot = slot.lock().await;
        slot.touch();
        if let Some(previous) = slot.connection.replace(Attached { id, negotiator }) {
            info!(session = %session, connection = previous.id, "replacing connection");
            close_in_background(previous.negotiator);
        }
        id
    }

    /// Forget connection `id` if it is still the session's current one.
    pub async fn detach(&self, session: &str, id: u64) {
        let Some(slot) = self.existing(session).await else {
            return;
        };
        let mut slot = slot.lock().await;
        slot.touch();
        if slot.connection.as_ref().is_some_and(|c| c.id == id) {
            slot.connection = None;
            info!(session = %session, connection = id, "connection detached");
        }
    }

    /// Remove sessions without a connection that have been idle past the TTL.
    pub async fn reap_idle(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let now = Instant::now();

        let mut reaped = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|id, slot| {
                // A locked slot is in use.
                let Ok(mut slot) = slot.try_lock() else {
                    return true;
                };
                if slot.connection.is_some()
                    || slot.launching.is_some()
                    || now.duration_since(slot.last_seen) <= ttl
                {
                    return true;
                }
                reaped.push((id.clone(), slot.game.take()));
                false
            });
        }

        let count = reaped.len();
        for (session, game) in reaped {
            info!(session = %session, "reaping idle session");
            if let Some(game) = game {
                stop_in_background(session, game);
            }
        }
        count
    }

    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        orchestrator.reap_idle().await;
                    }
                }
            }
        })
    }

    /// Close every connection and stop every game, waiting for both.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        info!(sessions = sessions.len(), "tearing down sessions");

        let mut teardown = JoinSet::new();
        for (session, slot) in sessions {
            teardown.spawn(async move {
                let mut slot = slot.lock().await;
                // A launch still in flight stops its own game when it lands.
                slot.launching = None;
                if let Some(connection) = slot.connection.take() {
                    connection.negotiator.close().await;
                }
                if let Some(game) = slot.game.take() {
                    if let Err(e) = game.stop().await {
                        error!(session = %session, err = %e, "failed to stop game");
                    }
                }
            });
        }
        while teardown.join_next().await.is_some() {}
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub rtc: Arc<RtcSettings>,
    pub media: Arc<MediaSettings>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, rtc: RtcSettings, media: MediaSettings) -> Self {
        Self {
            orchestrator,
            rtc: Arc::new(rtc),
            media: Arc::new(media),
        }
    }
}

//! Game catalog loaded from a YAML file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Static description of a playable game.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSpec {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub thumbnail: String,
    /// Host directory holding the game files.
    pub source: String,
    /// Absolute, or relative to where `source` is mounted.
    #[serde(default)]
    pub working_directory: String,
    /// Executable name inside the working directory.
    pub entrypoint: String,
    #[serde(default)]
    pub save: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    games: Vec<GameSpec>,
}

impl Catalog {
    pub fn new(games: Vec<GameSpec>) -> Self {
        Self { games }
    }

    /// Load the catalog, writing an empty one if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "catalog missing, writing an empty one");
                let empty = Catalog::default();
                std::fs::write(path, serde_yaml::to_string(&empty)?)
                    .map_err(|e| Error::io(format!("write {}", path.display()), e))?;
                return Ok(empty);
            }
            Err(e) => return Err(Error::io(format!("read {}", path.display()), e)),
        };

        let catalog: Catalog = serde_yaml::from_str(&text)?;
        info!(path = %path.display(), games = catalog.games.len(), "loaded catalog");
        Ok(catalog)
    }

    pub fn lookup(&self, slug: &str) -> Option<Arc<GameSpec>> {
        self.games
            .iter()
            .find(|g| g.slug == slug)
            .map(|g| Arc::new(g.clone()))
    }

    pub fn games(&self) -> &[GameSpec] {
        &self.games
    }
}

/// Capture and display size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Bytes in one packed RGB24 frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .split_once('x')
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width = w.trim().parse().map_err(|_| format!("bad width in {s:?}"))?;
        let height = h.trim().parse().map_err(|_| format!("bad height in {s:?}"))?;
        if width == 0 || height == 0 {
            return Err(format!("empty resolution {s:?}"));
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

//! Error types shared across the server.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No catalog entry for the requested slug.
    #[error("invalid game slug: {0}")]
    UnknownGame(String),

    #[error("no session")]
    NoSession,

    /// Malformed or unrecognised signaling message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// A container runtime command exited unsuccessfully.
    #[error("`{command}` failed: {stderr}")]
    Runtime { command: String, stderr: String },

    /// The supervised unit no longer exists.
    #[error("{0} is already gone")]
    Gone(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Base image or per-session build failure.
    #[error("build: {0}")]
    Build(String),

    #[error("media: {0}")]
    Media(String),

    #[error("environment: {0}")]
    Environment(String),

    #[error("{}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Joined(Vec<Error>),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Every individual failure carried by this error.
    pub fn causes(&self) -> &[Error] {
        match self {
            Error::Joined(causes) => causes,
            other => std::slice::from_ref(other),
        }
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, Error::Gone(_))
    }

    /// Collapse a list of failures into a single result.
    pub fn join(mut causes: Vec<Error>) -> Result<()> {
        match causes.len() {
            0 => Ok(()),
            1 => Err(causes.remove(0)),
            _ => Err(Error::Joined(causes)),
        }
    }
}

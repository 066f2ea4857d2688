use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Decoding error: {0}")]
    Decode(String),
    #[error("Task was cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FeedError {
    /// `Cancelled` is an internal discard signal, everything else is
    /// reported to subscribers.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FeedError::Cancelled)
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Decode(e.to_string());
        }
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<image::ImageError> for FeedError {
    fn from(e: image::ImageError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<url::ParseError> for FeedError {
    fn from(e: url::ParseError) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for FeedError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            return Self::Cancelled;
        }
        Self::Other(anyhow::anyhow!(e.to_string()))
    }
}

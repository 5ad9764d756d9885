use meld_replica::SyncError;

use crate::wire::FrameError;

/// Failure talking to a remote node over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<HttpError> for SyncError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Frame(FrameError::Body(reason)) => SyncError::Transport(reason),
            HttpError::Frame(frame) => SyncError::Decode(frame.to_string()),
            other => SyncError::Transport(other.to_string()),
        }
    }
}

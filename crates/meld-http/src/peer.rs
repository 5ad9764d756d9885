use async_trait::async_trait;
use futures::StreamExt;
use meld::Timestamp;
use meld_replica::{Change, ChangeStream, SyncError, SyncTransport};
use reqwest::{Client, StatusCode};

use crate::wire::{self, VersionReply};
use crate::HttpError;

/// Base URL for `addr`, which may omit the scheme.
pub(crate) fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// A remote replica reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: Client,
    base: String,
    db: String,
}

impl HttpPeer {
    /// A peer serving database `db` at `addr` (`host:port` or a URL).
    pub fn new(client: Client, addr: &str, db: &str) -> Self {
        Self {
            client,
            base: base_url(addr),
            db: db.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base, self.db, path)
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, HttpError> {
        let response = self.client.get(self.url(path)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response),
            status => Err(HttpError::Status(status)),
        }
    }
}

#[async_trait]
impl SyncTransport for HttpPeer {
    async fn version(&self) -> Result<Option<Timestamp>, SyncError> {
        let body = self
            .get("p2p-v")
            .await?
            .bytes()
            .await
            .map_err(HttpError::from)?;
        let reply: VersionReply =
            postcard::from_bytes(&body).map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(reply.version())
    }

    async fn changes_since(&self, since: Timestamp) -> Result<ChangeStream, SyncError> {
        let path = format!("p2p-s/{}", wire::encode_since(since));
        let response = self.get(&path).await?;
        Ok(wire::decode_frames::<Change, _, _, _>(response.bytes_stream())
            .map(|frame| frame.map_err(|e| SyncError::from(HttpError::from(e))))
            .boxed())
    }
}

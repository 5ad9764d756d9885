use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, StatusCode};

use crate::peer::base_url;
use crate::wire::{self, DumpEntry, PeerWatermark};
use crate::HttpError;

/// Key-value access to a remote node's database.
///
/// Writes submitted here are stamped by the remote node like any local
/// write there.
#[derive(Debug, Clone)]
pub struct KvClient {
    client: Client,
    base: String,
    db: String,
}

impl KvClient {
    pub fn new(client: Client, addr: &str, db: &str) -> Self {
        Self {
            client,
            base: base_url(addr),
            db: db.to_string(),
        }
    }

    fn item_url(&self, key: &[u8]) -> String {
        format!("{}/{}/api-r/{}", self.base, self.db, wire::encode_key(key))
    }

    pub async fn submit(&self, key: &[u8], item: Vec<u8>) -> Result<(), HttpError> {
        let response = self
            .client
            .post(self.item_url(key))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(item)
            .send()
            .await?;
        match response.status() {
            StatusCode::ACCEPTED => Ok(()),
            status => Err(HttpError::Status(status)),
        }
    }

    /// `None` if the remote node has no item for `key`.
    pub async fn obtain(&self, key: &[u8]) -> Result<Option<Vec<u8>>, HttpError> {
        let response = self.client.get(self.item_url(key)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.bytes().await?.to_vec())),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(HttpError::Status(status)),
        }
    }

    /// Every key and item the remote node holds, in key order.
    pub async fn stream(&self) -> Result<BoxStream<'static, Result<DumpEntry, HttpError>>, HttpError> {
        let url = format!("{}/{}/api-stream", self.base, self.db);
        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(HttpError::Status(response.status()));
        }
        Ok(wire::decode_frames::<DumpEntry, _, _, _>(response.bytes_stream())
            .map(|entry| entry.map_err(HttpError::from))
            .boxed())
    }

    /// The remote node's time vector.
    pub async fn time_vector(&self) -> Result<Vec<PeerWatermark>, HttpError> {
        let url = format!("{}/{}/p2p-tv", self.base, self.db);
        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(HttpError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}

//! How a syncer reaches a peer.
//!
//! The trait lives here with the protocol; the HTTP implementation lives in
//! `meld-http`. [`LocalPeer`] talks to a replica in the same process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use meld::Timestamp;
use meld_store::ReplicaStore;

use crate::replica::{Change, Replica};
use crate::SyncError;

/// Changes pulled from a peer, in `(timestamp, key)` order.
pub type ChangeStream = BoxStream<'static, Result<Change, SyncError>>;

/// The two requests of the pull protocol.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// The peer's own watermark, or `None` if it has never written.
    async fn version(&self) -> Result<Option<Timestamp>, SyncError>;

    /// Every update-log record the peer holds with a timestamp strictly after
    /// `since`, each with the peer's current item for its key.
    async fn changes_since(&self, since: Timestamp) -> Result<ChangeStream, SyncError>;
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    async fn version(&self) -> Result<Option<Timestamp>, SyncError> {
        (**self).version().await
    }

    async fn changes_since(&self, since: Timestamp) -> Result<ChangeStream, SyncError> {
        (**self).changes_since(since).await
    }
}

/// Transport to a [`Replica`] in this process.
pub struct LocalPeer<S: ?Sized> {
    replica: Replica<S>,
}

impl<S: ?Sized> LocalPeer<S> {
    pub fn new(replica: Replica<S>) -> Self {
        Self { replica }
    }
}

#[async_trait]
impl<S: ReplicaStore + ?Sized + 'static> SyncTransport for LocalPeer<S> {
    async fn version(&self) -> Result<Option<Timestamp>, SyncError> {
        Ok(self.replica.version()?)
    }

    async fn changes_since(&self, since: Timestamp) -> Result<ChangeStream, SyncError> {
        Ok(self.replica.change_stream(since))
    }
}

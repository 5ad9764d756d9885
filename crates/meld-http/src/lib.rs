//! # meld-http
//!
//! HTTP binding for a [`Replica`](meld_replica::Replica): the key-value API
//! clients use, the two sync endpoints peers pull from, and the matching
//! clients ([`KvClient`], [`HttpPeer`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use meld::MergePolicy;
//! use meld_replica::Replica;
//! use meld_store::MemoryStore;
//!
//! # async fn run() -> std::io::Result<()> {
//! let store = Arc::new(MemoryStore::new(MergePolicy::LastWriteWins));
//! let replica = Replica::open("node-a", store, MergePolicy::LastWriteWins).unwrap();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:7700").await?;
//! meld_http::serve(listener, meld_http::router("main", replica), async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await
//! # }
//! ```

mod client;
mod error;
mod peer;
mod server;
pub mod wire;

pub use client::KvClient;
pub use error::HttpError;
pub use peer::HttpPeer;
pub use server::{router, serve};
pub use wire::FrameError;

//! HTTP routes for one database served by a replica.
//!
//! | Route | Method | Reply |
//! |-------|--------|-------|
//! | `/<db>/api-r/<key>` | GET | 200 + item, 404, 500 |
//! | `/<db>/api-r/<key>` | PUT, POST | 202, 500 |
//! | `/<db>/api-stream` | GET | framed [`DumpEntry`] per key |
//! | `/<db>/p2p-v` | GET | postcard [`VersionReply`] |
//! | `/<db>/p2p-s/<since>` | GET | framed [`Change`](meld_replica::Change) stream |
//! | `/<db>/p2p-tv` | GET | JSON list of [`PeerWatermark`] |
//!
//! Keys and `since` are URL-safe base64 (see [`wire`](crate::wire)); a
//! malformed segment is a 400.

use std::future::Future;
use std::io;
use std::ops::ControlFlow;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use meld_replica::Replica;
use meld_store::ReplicaStore;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::wire::{self, DumpEntry, PeerWatermark, VersionReply, MAX_FRAME};

const OCTET_STREAM: &str = "application/octet-stream";
const FRAMED: &str = "application/x-meld-frames";
/// Frames buffered between a blocking store walk and the response body.
const BODY_BUFFER: usize = 64;

/// Build the router for database `db` backed by `replica`.
pub fn router<S>(db: &str, replica: Replica<S>) -> Router
where
    S: ReplicaStore + ?Sized + 'static,
{
    Router::new()
        .route(
            &format!("/{db}/api-r/:key"),
            get(obtain_item::<S>)
                .put(submit_item::<S>)
                .post(submit_item::<S>),
        )
        .route(&format!("/{db}/api-stream"), get(dump_items::<S>))
        .route(&format!("/{db}/p2p-v"), get(version::<S>))
        .route(&format!("/{db}/p2p-s/:since"), get(changes_since::<S>))
        .route(&format!("/{db}/p2p-tv"), get(time_vector::<S>))
        .layer(DefaultBodyLimit::max(MAX_FRAME))
        .with_state(replica)
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "serving");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Run blocking store work off the async workers.
async fn blocking<T, F>(work: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "store task failed");
            None
        }
    }
}

async fn obtain_item<S>(State(replica): State<Replica<S>>, Path(key): Path<String>) -> Response
where
    S: ReplicaStore + ?Sized + 'static,
{
    let Ok(key) = wire::decode_key(&key) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let store = replica.store().clone();
    match blocking(move || store.obtain(&key)).await {
        Some(Ok(Some(item))) => ([(header::CONTENT_TYPE, OCTET_STREAM)], item).into_response(),
        Some(Ok(None)) => StatusCode::NOT_FOUND.into_response(),
        Some(Err(e)) => {
            warn!(error = %e, "obtain failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn submit_item<S>(
    State(replica): State<Replica<S>>,
    Path(key): Path<String>,
    item: Bytes,
) -> StatusCode
where
    S: ReplicaStore + ?Sized + 'static,
{
    let Ok(key) = wire::decode_key(&key) else {
        return StatusCode::BAD_REQUEST;
    };
    let updater = replica.updater().clone();
    match blocking(move || updater.write(&key, &item)).await {
        Some(Ok(at)) => {
            debug!(%at, "write accepted");
            StatusCode::ACCEPTED
        }
        Some(Err(e)) => {
            warn!(error = %e, "submit failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn dump_items<S>(State(replica): State<Replica<S>>) -> Response
where
    S: ReplicaStore + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(BODY_BUFFER);
    let store = replica.store().clone();
    tokio::task::spawn_blocking(move || {
        let walked = store.stream(&mut |key, item| {
            let entry = DumpEntry {
                key: key.to_vec(),
                item: item.to_vec(),
            };
            let frame = wire::encode_frame(&entry).map_err(io::Error::other);
            if tx.blocking_send(frame).is_err() {
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        if let Err(e) = walked {
            warn!(error = %e, "item dump failed");
            let _ = tx.blocking_send(Err(io::Error::other(e)));
        }
    });
    framed(Body::from_stream(ReceiverStream::new(rx)))
}

async fn version<S>(State(replica): State<Replica<S>>) -> Response
where
    S: ReplicaStore + ?Sized + 'static,
{
    let probe = replica.clone();
    match blocking(move || probe.version()).await {
        Some(Ok(version)) => match postcard::to_allocvec(&VersionReply::from_version(version)) {
            Ok(body) => ([(header::CONTENT_TYPE, OCTET_STREAM)], body).into_response(),
            Err(e) => {
                warn!(error = %e, "version encode failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Some(Err(e)) => {
            warn!(error = %e, "version probe failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn changes_since<S>(State(replica): State<Replica<S>>, Path(since): Path<String>) -> Response
where
    S: ReplicaStore + ?Sized + 'static,
{
    let Ok(since) = wire::decode_since(&since) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    debug!(%since, "serving changes");
    let frames = replica.change_stream(since).map(|change| {
        let change = change.map_err(|e| {
            warn!(error = %e, "change feed failed");
            io::Error::other(e)
        })?;
        wire::encode_frame(&change).map_err(io::Error::other)
    });
    framed(Body::from_stream(frames))
}

async fn time_vector<S>(State(replica): State<Replica<S>>) -> Response
where
    S: ReplicaStore + ?Sized + 'static,
{
    let store = replica.store().clone();
    match blocking(move || store.watermarks()).await {
        Some(Ok(rows)) => Json(
            rows.into_iter()
                .map(|(peer, at)| PeerWatermark {
                    peer,
                    watermark: at.as_nanos(),
                })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Some(Err(e)) => {
            warn!(error = %e, "time vector read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn framed(body: Body) -> Response {
    ([(header::CONTENT_TYPE, FRAMED)], body).into_response()
}

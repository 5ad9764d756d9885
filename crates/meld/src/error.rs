use thiserror::Error;

/// An item that could not be decoded.
///
/// Mergers never surface this; they skip the offending item. It is returned
/// by the item codecs for callers that inspect values directly.
#[derive(Debug, Error)]
#[error("malformed item: {0}")]
pub struct ItemError(#[from] postcard::Error);

//! Wire encoding shared by server and clients.
//!
//! Streamed bodies are a sequence of frames: a `u32` big-endian payload
//! length followed by that many bytes of postcard. Keys and timestamps in
//! URL paths are unpadded URL-safe base64; a timestamp is its 8 big-endian
//! bytes.

use std::fmt::Display;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use meld::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Largest accepted frame payload.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// A malformed request path or response body.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the 64 MiB limit")]
    TooLarge(usize),
    #[error("body ended inside a frame ({0} bytes left over)")]
    Truncated(usize),
    #[error("frame payload: {0}")]
    Payload(#[from] postcard::Error),
    #[error("invalid path segment: {0}")]
    Path(String),
    /// Reading the body failed before it was complete.
    #[error("body read failed: {0}")]
    Body(String),
}

/// Answer to a version probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionReply {
    pub exists: bool,
    /// Meaningless unless `exists`.
    pub watermark: Timestamp,
}

impl VersionReply {
    pub fn from_version(version: Option<Timestamp>) -> Self {
        Self {
            exists: version.is_some(),
            watermark: version.unwrap_or(Timestamp::ZERO),
        }
    }

    pub fn version(self) -> Option<Timestamp> {
        self.exists.then_some(self.watermark)
    }
}

/// One entry of a full key-item dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpEntry {
    pub key: Vec<u8>,
    pub item: Vec<u8>,
}

/// One time vector row, as listed by the inspection endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerWatermark {
    pub peer: String,
    pub watermark: u64,
}

pub fn encode_key(key: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(key)
}

pub fn decode_key(segment: &str) -> Result<Vec<u8>, FrameError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| FrameError::Path(e.to_string()))
}

pub fn encode_since(since: Timestamp) -> String {
    URL_SAFE_NO_PAD.encode(since.to_be_bytes())
}

pub fn decode_since(segment: &str) -> Result<Timestamp, FrameError> {
    let bytes = decode_key(segment)?;
    Timestamp::from_be_slice(&bytes)
        .ok_or_else(|| FrameError::Path(format!("timestamp must be 8 bytes, got {}", bytes.len())))
}

/// Encode `value` as one length-prefixed frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes, FrameError> {
    let payload = postcard::to_allocvec(value)?;
    if payload.len() > MAX_FRAME {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut frame = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    // Fits: checked against MAX_FRAME above.
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

/// Incremental frame decoder over arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete frame, or `None` until more bytes arrive.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME {
            return Err(FrameError::TooLarge(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        let payload = self.buf.split_to(len);
        Ok(Some(postcard::from_bytes(&payload)?))
    }

    /// Check that the body ended on a frame boundary.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated(self.buf.len()))
        }
    }
}

struct FrameReader<S> {
    body: S,
    decoder: FrameDecoder,
    done: bool,
}

/// Decode a chunked body into a stream of frames.
///
/// The stream ends after the first error.
pub fn decode_frames<T, S, B, E>(body: S) -> BoxStream<'static, Result<T, FrameError>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = FrameReader {
        body: Box::pin(body),
        decoder: FrameDecoder::new(),
        done: false,
    };
    stream::unfold(reader, |mut reader| async move {
        loop {
            if reader.done {
                return None;
            }
            match reader.decoder.next_frame::<T>() {
                Ok(Some(value)) => return Some((Ok(value), reader)),
                Ok(None) => {}
                Err(e) => {
                    reader.done = true;
                    return Some((Err(e), reader));
                }
            }
            match reader.body.next().await {
                Some(Ok(chunk)) => reader.decoder.push(chunk.as_ref()),
                Some(Err(e)) => {
                    reader.done = true;
                    return Some((Err(FrameError::Body(e.to_string())), reader));
                }
                None => {
                    reader.done = true;
                    return match reader.decoder.finish() {
                        Ok(()) => None,
                        Err(e) => Some((Err(e), reader)),
                    };
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn entry(key: &str) -> DumpEntry {
        DumpEntry {
            key: key.as_bytes().to_vec(),
            item: vec![7; 3],
        }
    }

    fn body(frames: &[Bytes], chunk: usize) -> Vec<Result<Vec<u8>, Infallible>> {
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
        joined.chunks(chunk).map(|c| Ok(c.to_vec())).collect()
    }

    #[test]
    fn since_round_trips_through_path() {
        let ts = Timestamp::from_nanos(1_700_000_000_123_456_789);
        assert_eq!(decode_since(&encode_since(ts)).unwrap(), ts);
        assert!(decode_since(&encode_key(b"short")).is_err());
        assert!(decode_key("not base64!").is_err());
    }

    #[test]
    fn version_reply_maps_absent_to_none() {
        assert_eq!(VersionReply::from_version(None).version(), None);
        let at = Timestamp::from_nanos(9);
        assert_eq!(VersionReply::from_version(Some(at)).version(), Some(at));
    }

    #[tokio::test]
    async fn frames_survive_any_chunking() {
        let frames: Vec<Bytes> = ["a", "bb", "ccc"]
            .iter()
            .map(|k| encode_frame(&entry(k)).unwrap())
            .collect();
        for chunk in [1, 2, 5, 64] {
            let decoded: Vec<DumpEntry> = decode_frames(stream::iter(body(&frames, chunk)))
                .map(Result::unwrap)
                .collect()
                .await;
            assert_eq!(decoded, vec![entry("a"), entry("bb"), entry("ccc")]);
        }
    }

    #[tokio::test]
    async fn truncated_tail_is_an_error() {
        let whole = encode_frame(&entry("a")).unwrap();
        let cut = encode_frame(&entry("b")).unwrap();
        let chunks: Vec<Result<Vec<u8>, Infallible>> =
            vec![Ok(whole.to_vec()), Ok(cut[..cut.len() - 1].to_vec())];

        let decoded: Vec<Result<DumpEntry, FrameError>> =
            decode_frames(stream::iter(chunks)).collect().await;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].as_ref().unwrap(), &entry("a"));
        assert!(matches!(decoded[1], Err(FrameError::Truncated(_))));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&((MAX_FRAME as u32) + 1).to_be_bytes());
        assert!(matches!(
            decoder.next_frame::<DumpEntry>(),
            Err(FrameError::TooLarge(_))
        ));
    }
}

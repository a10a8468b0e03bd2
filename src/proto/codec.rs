//! Framed wire format.
//!
//! A wire message is a 4-byte big-endian frame count followed by that many
//! frames; each frame is an 8-byte big-endian length followed by raw bytes.
//! Frame payloads are MessagePack. On read, any frame that parses completely
//! is decoded; inside decoded maps, binary values that themselves parse as
//! maps are decoded recursively and all map keys are normalized to text.
//! Frames that do not parse stay raw binary.

use std::io::Cursor;

use bytes::{BufMut, BytesMut};
use rmpv::Value;
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EncodeSnafu, Result, TransportSnafu, WorkerError};

/// Maximum frames in one message.
pub const MAX_FRAMES_PER_MESSAGE: u32 = 65_536;

/// Maximum length of a single frame.
pub const MAX_FRAME_LENGTH: u64 = 256 * 1024 * 1024;

/// Encode one frame payload.
pub fn encode_frame(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).context(EncodeSnafu)?;
    Ok(buf)
}

/// Decode one frame payload.
///
/// The raw bytes are kept verbatim when they are not a complete MessagePack
/// value; opaque payloads thus survive untouched.
pub fn decode_frame(raw: Vec<u8>) -> Value {
    match decode_complete(&raw) {
        Some(value) => normalize(value),
        None => Value::Binary(raw),
    }
}

/// Parse bytes as exactly one MessagePack value consuming the whole buffer.
fn decode_complete(raw: &[u8]) -> Option<Value> {
    let mut cursor = Cursor::new(raw);
    let value = rmpv::decode::read_value(&mut cursor).ok()?;
    if cursor.position() as usize != raw.len() {
        return None;
    }
    Some(value)
}

/// Normalize a decoded value: map keys become text where possible, and
/// binary map-values that are themselves complete MessagePack maps are
/// decoded recursively.
fn normalize(value: Value) -> Value {
    match value {
        Value::Map(pairs) => Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (normalize_key(k), normalize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Binary(raw) => match decode_complete(&raw) {
            Some(inner @ Value::Map(_)) => normalize(inner),
            _ => Value::Binary(raw),
        },
        other => other,
    }
}

fn normalize_key(key: Value) -> Value {
    match key {
        Value::Binary(raw) => match String::from_utf8(raw) {
            Ok(text) => Value::from(text),
            Err(err) => Value::Binary(err.into_bytes()),
        },
        other => other,
    }
}

/// Write one message: frame count, then length-prefixed frames.
///
/// The message is assembled into a single buffer first so a partially
/// written message can only result from a broken transport, never from
/// interleaved writers.
pub async fn write_message<W>(writer: &mut W, frames: &[Value]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    assert!(
        frames.len() <= MAX_FRAMES_PER_MESSAGE as usize,
        "message of {} frames exceeds limit {}",
        frames.len(),
        MAX_FRAMES_PER_MESSAGE
    );

    let mut buf = BytesMut::new();
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        let encoded = encode_frame(frame)?;
        buf.put_u64(encoded.len() as u64);
        buf.extend_from_slice(&encoded);
    }
    writer.write_all(&buf).await.context(TransportSnafu)?;
    writer.flush().await.context(TransportSnafu)?;
    Ok(())
}

/// Read one message.
///
/// Returns `None` on a clean close (end of stream before any byte of a new
/// message); fails with [`WorkerError::TransportTruncated`] when the stream
/// ends mid-message.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<Value>>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..]).await.context(TransportSnafu)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WorkerError::TransportTruncated);
        }
        filled += n;
    }

    let count = u32::from_be_bytes(head);
    if count > MAX_FRAMES_PER_MESSAGE {
        return Err(WorkerError::FrameTooLarge {
            length: u64::from(count),
            max: u64::from(MAX_FRAMES_PER_MESSAGE),
        });
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let length = read_exact_or_truncated(reader, 8).await?;
        let length = u64::from_be_bytes(length.as_slice().try_into().expect("8-byte read"));
        if length > MAX_FRAME_LENGTH {
            return Err(WorkerError::FrameTooLarge { length, max: MAX_FRAME_LENGTH });
        }
        let payload = read_exact_or_truncated(reader, length as usize).await?;
        frames.push(decode_frame(payload));
    }
    Ok(Some(frames))
}

/// Read exactly `len` bytes, mapping end-of-stream to `TransportTruncated`.
async fn read_exact_or_truncated<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(WorkerError::TransportTruncated)
        }
        Err(err) => Err(err).context(TransportSnafu),
    }
}

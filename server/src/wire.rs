//! Binary wire codec.
//!
//! Byte layouts are fixed and shared with unchanged clients:
//! INTEGER = 4-byte big-endian signed, LONG = 8-byte big-endian signed,
//! BOOLEAN = one byte `0x00`/`0x01`, STRING/BYTES = INTEGER length + payload,
//! UUID = two INTEGERs, TIME = LONG milliseconds, NULLABLE = BOOLEAN present
//! flag + value, COLLECTION = INTEGER count + values, MAP = count +
//! alternating key/value.
//!
//! Encoders append to a `Vec<u8>` so a response is written with a single
//! syscall; decoders read straight off the connection since request bodies
//! are self-describing rather than length-prefixed as a whole.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::models::Time;
use crate::uid::Uuid;

/// Upper bound on any single length/count field: 1 MB. Prevents a malformed
/// or hostile length prefix from exhausting memory.
pub const MAX_LENGTH: i32 = 1_048_576;

/// Decoding failures.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("negative length: {0}")]
    NegativeLength(i32),

    #[error("length too large: {0} bytes (max {MAX_LENGTH})")]
    LengthTooLarge(i32),

    #[error("invalid boolean byte: {0:#04x}")]
    InvalidBoolean(u8),

    #[error("invalid utf-8 in string value")]
    InvalidUtf8,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::UnexpectedEof),
        Err(e) => Err(WireError::Io(e)),
    }
}

fn checked_len(len: i32) -> Result<usize, WireError> {
    if len < 0 {
        Err(WireError::NegativeLength(len))
    } else if len > MAX_LENGTH {
        Err(WireError::LengthTooLarge(len))
    } else {
        Ok(len as usize)
    }
}

// ── Decoders ──

pub async fn read_i32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, WireError> {
    let mut buf = [0u8; 4];
    fill(reader, &mut buf).await?;
    Ok(i32::from_be_bytes(buf))
}

pub async fn read_i64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i64, WireError> {
    let mut buf = [0u8; 8];
    fill(reader, &mut buf).await?;
    Ok(i64::from_be_bytes(buf))
}

pub async fn read_bool<R: AsyncRead + Unpin>(reader: &mut R) -> Result<bool, WireError> {
    let mut buf = [0u8; 1];
    fill(reader, &mut buf).await?;
    match buf[0] {
        0x00 => Ok(false),
        0x01 => Ok(true),
        other => Err(WireError::InvalidBoolean(other)),
    }
}

pub async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let len = checked_len(read_i32(reader).await?)?;
    let mut buf = vec![0u8; len];
    fill(reader, &mut buf).await?;
    Ok(buf)
}

pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, WireError> {
    let bytes = read_bytes(reader).await?;
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
}

pub async fn read_uuid<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Uuid, WireError> {
    let generator = read_i32(reader).await? as u32;
    let sequence = read_i32(reader).await? as u32;
    Ok(Uuid::new(generator, sequence))
}

pub async fn read_time<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Time, WireError> {
    Ok(Time::from_ms(read_i64(reader).await?))
}

/// Read `COLLECTION(UUID)` — the only collection request bodies carry.
pub async fn read_uuid_collection<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<Uuid>, WireError> {
    let count = checked_len(read_i32(reader).await?)?;
    let mut ids = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ids.push(read_uuid(reader).await?);
    }
    Ok(ids)
}

// ── Encoders ──

pub fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn put_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(if value { 0x01 } else { 0x00 });
}

pub fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    put_i32(buf, value.len() as i32);
    buf.extend_from_slice(value);
}

pub fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn put_uuid(buf: &mut Vec<u8>, id: Uuid) {
    put_i32(buf, id.generator as i32);
    put_i32(buf, id.sequence as i32);
}

pub fn put_time(buf: &mut Vec<u8>, time: Time) {
    put_i64(buf, time.as_ms());
}

/// NULLABLE(T): present flag, then the value if present.
pub fn put_nullable<T>(buf: &mut Vec<u8>, value: Option<&T>, encode: impl Fn(&mut Vec<u8>, &T)) {
    match value {
        Some(v) => {
            put_bool(buf, true);
            encode(buf, v);
        }
        None => put_bool(buf, false),
    }
}

/// COLLECTION(T): count, then values in the order supplied.
pub fn put_collection<T>(buf: &mut Vec<u8>, items: &[T], encode: impl Fn(&mut Vec<u8>, &T)) {
    put_i32(buf, items.len() as i32);
    for item in items {
        encode(buf, item);
    }
}

/// MAP(K, V): count, then alternating key/value in map order.
pub fn put_map<K, V>(
    buf: &mut Vec<u8>,
    map: &BTreeMap<K, V>,
    encode_key: impl Fn(&mut Vec<u8>, &K),
    encode_value: impl Fn(&mut Vec<u8>, &V),
) {
    put_i32(buf, map.len() as i32);
    for (k, v) in map {
        encode_key(buf, k);
        encode_value(buf, v);
    }
}

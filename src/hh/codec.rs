//! Envelope framing of shard writes.
//!
//! One queue element is one shard write: an 8-byte big-endian shard id
//! followed by newline-delimited textual points.

use bytes::Bytes;

use crate::line::{parse_points, Point};

use super::{HhError, HhResult};

const SHARD_ID_LEN: usize = 8;

pub fn marshal_write(shard_id: u64, points: &[Point]) -> Bytes {
    let mut buf = Vec::with_capacity(SHARD_ID_LEN + points.iter().map(|p| p.as_str().len() + 1).sum::<usize>());
    buf.extend_from_slice(&shard_id.to_be_bytes());
    for point in points {
        buf.extend_from_slice(point.as_str().as_bytes());
        buf.push(b'\n');
    }
    Bytes::from(buf)
}

pub fn unmarshal_write(buf: &[u8]) -> HhResult<(u64, Vec<Point>)> {
    if buf.len() < SHARD_ID_LEN {
        return Err(HhError::FrameTooShort { len: buf.len() });
    }
    let mut id_bytes = [0u8; SHARD_ID_LEN];
    id_bytes.copy_from_slice(&buf[..SHARD_ID_LEN]);
    let shard_id = u64::from_be_bytes(id_bytes);
    let points = parse_points(&buf[SHARD_ID_LEN..])?;
    Ok((shard_id, points))
}

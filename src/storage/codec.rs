//! Binary encoding of a batch: a one-byte codec tag followed by a (possibly compressed) CBOR array
//! of `[t, dt, d, a]` tuples.

use std::io::Read;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Compression, Error};
use crate::datapoint::{Datapoint, DatapointArray};

const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;
const TAG_ZSTD: u8 = 2;

/// Refuse to allocate more than this when a payload claims or inflates to a huge size.
const MAX_DECODED_SIZE: usize = 1 << 28;

#[derive(Serialize)]
struct PackedPointRef<'a>(f64, f64, &'a Value, Option<&'a str>);

#[derive(Deserialize)]
struct PackedPoint(f64, f64, Value, Option<String>);

#[derive(Clone, Debug)]
pub struct BatchCodec {
    compression: Compression,
}

impl BatchCodec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn encode(&self, batch: &[Datapoint]) -> Result<Vec<u8>, Error> {
        let packed: Vec<PackedPointRef<'_>> = batch
            .iter()
            .map(|dp| PackedPointRef(dp.timestamp, dp.duration, &dp.data, dp.actor.as_deref()))
            .collect();
        let mut raw = Vec::with_capacity(batch.len() * 16);
        ciborium::into_writer(&packed, &mut raw)
            .map_err(|e| Error::CorruptBatch(format!("failed to serialize batch: {e}")))?;

        let mut out = Vec::with_capacity(raw.len() + 1);
        match self.compression {
            Compression::None => {
                out.push(TAG_RAW);
                out.extend_from_slice(&raw);
            }
            Compression::Lz4 => {
                out.push(TAG_LZ4);
                out.extend_from_slice(&lz4_flex::compress_prepend_size(&raw));
            }
            Compression::Zstd(level) => {
                out.push(TAG_ZSTD);
                out.extend_from_slice(&zstd::stream::encode_all(raw.as_slice(), level)?);
            }
        }
        Ok(out)
    }

    /// Decodes a stored batch. Every codec tag is accepted, whatever this codec writes.
    pub fn decode(&self, bytes: &[u8]) -> Result<DatapointArray, Error> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| Error::CorruptBatch("empty payload".into()))?;

        let raw = match tag {
            TAG_RAW => std::borrow::Cow::Borrowed(body),
            TAG_LZ4 => {
                let claimed = body
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .ok_or_else(|| Error::CorruptBatch("truncated lz4 header".into()))?;
                if claimed > MAX_DECODED_SIZE {
                    return Err(Error::CorruptBatch(format!(
                        "lz4 payload claims {claimed} bytes"
                    )));
                }
                let decoded = lz4_flex::decompress_size_prepended(body)
                    .map_err(|e| Error::CorruptBatch(format!("lz4: {e}")))?;
                std::borrow::Cow::Owned(decoded)
            }
            TAG_ZSTD => std::borrow::Cow::Owned(zstd_decode_bounded(body, MAX_DECODED_SIZE)?),
            other => return Err(Error::CorruptBatch(format!("unknown codec tag {other}"))),
        };

        let packed: Vec<PackedPoint> = ciborium::from_reader(raw.as_ref())
            .map_err(|e| Error::CorruptBatch(format!("cbor: {e}")))?;
        if packed.is_empty() {
            return Err(Error::CorruptBatch("batch holds no datapoints".into()));
        }

        Ok(packed
            .into_iter()
            .map(|PackedPoint(timestamp, duration, data, actor)| Datapoint {
                timestamp,
                duration,
                data,
                actor,
            })
            .collect())
    }
}

/// Inflates a zstd frame, failing once the output grows past `limit` bytes.
pub(crate) fn zstd_decode_bounded(body: &[u8], limit: usize) -> Result<Vec<u8>, Error> {
    let decoder =
        zstd::stream::read::Decoder::new(body).map_err(|e| Error::CorruptBatch(format!("zstd: {e}")))?;
    let mut decoded = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::CorruptBatch(format!("zstd: {e}")))?;
    if decoded.len() > limit {
        return Err(Error::CorruptBatch(format!(
            "zstd payload inflates past {limit} bytes"
        )));
    }
    Ok(decoded)
}

// ABOUTME: Snapshot codec splitting a serialized value into size-bounded, self-describing chunks.
// ABOUTME: Every chunk carries the whole-payload SHA-256 so reassembly can detect any corruption.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Version of the chunk envelope written by this codec.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors raised while encoding or reassembling a snapshot.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no chunks to decode")]
    Empty,

    #[error("unsupported schema version {0}")]
    UnsupportedVersion(u32),

    #[error("chunk headers disagree: {0}")]
    InconsistentHeader(String),

    #[error("chunk {index} of {total} is missing")]
    MissingChunk { index: u32, total: u32 },

    #[error("chunk {0} appears twice with different content")]
    ConflictingDuplicate(u32),

    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl CodecError {
    /// True for failures that mean the stored data is unusable, as opposed to
    /// a value that could not be serialized in the first place.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, Self::Json(_))
    }
}

/// One size-bounded piece of a snapshot.
///
/// `checksum` and `total_chunks` describe the whole payload, so any chunk on
/// its own identifies its position in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub key: String,
    pub schema_version: u32,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub checksum: String,
    #[serde(serialize_with = "to_base64", deserialize_with = "from_base64")]
    pub payload: Vec<u8>,
}

fn to_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD.decode(encoded).map_err(serde::de::Error::custom)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Splits values into chunks of at most `chunk_limit` payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCodec {
    chunk_limit: usize,
}

impl SnapshotCodec {
    /// A zero limit is raised to one byte.
    pub fn new(chunk_limit: usize) -> Self {
        Self {
            chunk_limit: chunk_limit.max(1),
        }
    }

    /// A codec that never splits, for backends without a size limit.
    pub fn unbounded() -> Self {
        Self {
            chunk_limit: usize::MAX,
        }
    }

    pub fn chunk_limit(&self) -> usize {
        self.chunk_limit
    }

    /// Serialize `value` canonically and split it. Objects are written with
    /// sorted keys, so identical values always produce identical chunks.
    pub fn encode<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<Vec<SnapshotChunk>, CodecError> {
        let canonical = serde_json::to_value(value)?;
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(self.encode_bytes(key, &bytes))
    }

    /// Split raw bytes. An empty payload still produces one (empty) chunk.
    pub fn encode_bytes(&self, key: &str, payload: &[u8]) -> Vec<SnapshotChunk> {
        let sum = checksum(payload);
        let pieces: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(self.chunk_limit).collect()
        };
        let total = pieces.len() as u32;

        pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| SnapshotChunk {
                key: key.to_string(),
                schema_version: SCHEMA_VERSION,
                chunk_index: index as u32,
                total_chunks: total,
                checksum: sum.clone(),
                payload: piece.to_vec(),
            })
            .collect()
    }

    pub fn decode<T: DeserializeOwned>(&self, chunks: Vec<SnapshotChunk>) -> Result<T, CodecError> {
        let bytes = self.decode_bytes(chunks)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Reassemble chunks given in any order and verify the checksum.
    pub fn decode_bytes(&self, chunks: Vec<SnapshotChunk>) -> Result<Vec<u8>, CodecError> {
        let first = chunks.first().ok_or(CodecError::Empty)?;
        let key = first.key.clone();
        let total = first.total_chunks;
        let expected = first.checksum.clone();

        let mut ordered: BTreeMap<u32, SnapshotChunk> = BTreeMap::new();
        for chunk in chunks {
            if chunk.schema_version != SCHEMA_VERSION {
                return Err(CodecError::UnsupportedVersion(chunk.schema_version));
            }
            if chunk.key != key || chunk.total_chunks != total || chunk.checksum != expected {
                return Err(CodecError::InconsistentHeader(format!(
                    "chunk {} does not belong to snapshot '{}' ({} chunks)",
                    chunk.chunk_index, key, total
                )));
            }
            if chunk.chunk_index >= total {
                return Err(CodecError::InconsistentHeader(format!(
                    "chunk index {} out of range for {} chunks",
                    chunk.chunk_index, total
                )));
            }
            match ordered.get(&chunk.chunk_index) {
                Some(existing) if existing.payload != chunk.payload => {
                    return Err(CodecError::ConflictingDuplicate(chunk.chunk_index));
                }
                Some(_) => {}
                None => {
                    ordered.insert(chunk.chunk_index, chunk);
                }
            }
        }

        if let Some(index) = (0..total).find(|i| !ordered.contains_key(i)) {
            return Err(CodecError::MissingChunk { index, total });
        }

        let payload: Vec<u8> = ordered
            .into_values()
            .flat_map(|chunk| chunk.payload)
            .collect();

        let actual = checksum(&payload);
        if actual != expected {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn large_value(target_bytes: usize) -> Value {
        let mut members = serde_json::Map::new();
        let mut i = 0;
        while serde_json::to_vec(&Value::Object(members.clone())).unwrap().len() < target_bytes {
            members.insert(
                format!("member_{:05}", i),
                json!({"level": i % 200, "jobs": {"Paysan": i % 100}, "note": "x".repeat(40)}),
            );
            i += 1;
        }
        Value::Object(members)
    }

    #[test]
    fn small_value_round_trips_in_one_chunk() {
        let codec = SnapshotCodec::new(4096);
        let value = json!({"level": 120, "name": "PlayerOne"});

        let chunks = codec.encode("jobs", &value).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total_chunks, 1);

        let back: Value = codec.decode(chunks).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn fifty_kilobytes_at_four_kilobyte_limit_yields_thirteen_chunks() {
        let codec = SnapshotCodec::new(4096);
        let payload = vec![b'a'; 50 * 1024];

        let chunks = codec.encode_bytes("stats", &payload);
        assert_eq!(chunks.len(), 13);
        assert!(chunks.iter().all(|c| c.payload.len() <= 4096));
        assert!(chunks.iter().all(|c| c.total_chunks == 13));

        assert_eq!(codec.decode_bytes(chunks).unwrap(), payload);
    }

    #[test]
    fn large_json_value_reconstructs_byte_identical() {
        let codec = SnapshotCodec::new(4096);
        let value = large_value(50 * 1024);
        let original = serde_json::to_vec(&value).unwrap();

        let chunks = codec.encode("stats", &value).unwrap();
        assert!(chunks.len() > 1);

        assert_eq!(codec.decode_bytes(chunks.clone()).unwrap(), original);
        let back: Value = codec.decode(chunks).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn payload_exactly_at_boundary() {
        let codec = SnapshotCodec::new(8);

        let one = codec.encode_bytes("k", b"12345678");
        assert_eq!(one.len(), 1);

        let two = codec.encode_bytes("k", b"1234567812345678");
        assert_eq!(two.len(), 2);
        assert_eq!(codec.decode_bytes(two).unwrap(), b"1234567812345678");
    }

    #[test]
    fn empty_payload_is_one_chunk() {
        let codec = SnapshotCodec::new(8);
        let chunks = codec.encode_bytes("k", b"");
        assert_eq!(chunks.len(), 1);
        assert!(codec.decode_bytes(chunks).unwrap().is_empty());
    }

    #[test]
    fn chunks_decode_in_any_order() {
        let codec = SnapshotCodec::new(5);
        let mut chunks = codec.encode_bytes("k", b"the quick brown fox");
        chunks.reverse();
        chunks.swap(0, 2);
        assert_eq!(codec.decode_bytes(chunks).unwrap(), b"the quick brown fox");
    }

    #[test]
    fn encoding_is_deterministic() {
        let codec = SnapshotCodec::new(16);
        let a = json!({"b": 1, "a": [1, 2, 3], "c": {"z": null, "y": "é"}});
        let b = json!({"c": {"y": "é", "z": null}, "a": [1, 2, 3], "b": 1});
        assert_eq!(codec.encode("k", &a).unwrap(), codec.encode("k", &b).unwrap());
    }

    #[test]
    fn flipping_any_payload_byte_is_detected() {
        let codec = SnapshotCodec::new(7);
        let chunks = codec.encode("k", &json!({"level": 120, "name": "PlayerOne"})).unwrap();

        for (ci, chunk) in chunks.iter().enumerate() {
            for bi in 0..chunk.payload.len() {
                let mut tampered = chunks.clone();
                tampered[ci].payload[bi] ^= 0x01;
                let err = codec.decode::<Value>(tampered).unwrap_err();
                assert!(
                    matches!(err, CodecError::ChecksumMismatch { .. }),
                    "chunk {} byte {} should fail checksum, got {:?}",
                    ci,
                    bi,
                    err
                );
                assert!(err.is_corruption());
            }
        }
    }

    #[test]
    fn missing_chunk_is_detected() {
        let codec = SnapshotCodec::new(4);
        let mut chunks = codec.encode_bytes("k", b"0123456789");
        chunks.remove(1);
        assert!(matches!(
            codec.decode_bytes(chunks),
            Err(CodecError::MissingChunk { index: 1, total: 3 })
        ));
    }

    #[test]
    fn duplicates_are_tolerated_only_when_identical() {
        let codec = SnapshotCodec::new(4);
        let mut chunks = codec.encode_bytes("k", b"0123456789");
        chunks.push(chunks[0].clone());
        assert_eq!(codec.decode_bytes(chunks.clone()).unwrap(), b"0123456789");

        let mut conflicting = chunks[0].clone();
        conflicting.payload = b"zzzz".to_vec();
        chunks.push(conflicting);
        assert!(matches!(
            codec.decode_bytes(chunks),
            Err(CodecError::ConflictingDuplicate(0))
        ));
    }

    #[test]
    fn mixed_generations_are_rejected() {
        let codec = SnapshotCodec::new(4);
        let old = codec.encode_bytes("k", b"old-old-old!");
        let new = codec.encode_bytes("k", b"new-new-new!");
        let mixed = vec![old[0].clone(), new[1].clone(), new[2].clone()];
        assert!(matches!(
            codec.decode_bytes(mixed),
            Err(CodecError::InconsistentHeader(_))
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let codec = SnapshotCodec::new(64);
        let mut chunks = codec.encode_bytes("k", b"payload");
        chunks[0].schema_version = 99;
        assert!(matches!(
            codec.decode_bytes(chunks),
            Err(CodecError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn payload_serializes_as_base64() {
        let codec = SnapshotCodec::new(64);
        let chunk = codec.encode_bytes("k", b"hello").remove(0);
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["payload"], json!("aGVsbG8="));
        let back: SnapshotChunk = serde_json::from_value(json).unwrap();
        assert_eq!(back, chunk);
    }
}

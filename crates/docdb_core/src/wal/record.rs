//! WAL record types and line encoding.
//!
//! Each record is one line of a segment file:
//!
//! ```text
//! | crc32 (8 hex digits) | \t | JSON record | \n |
//! ```
//!
//! The checksum covers the JSON bytes. A line that fails to parse or whose
//! checksum does not match is corrupt and is skipped during replay.

use crate::document::Document;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record type discriminant, used in logs and dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WalRecordType {
    /// Document created.
    Create,
    /// Document updated.
    Update,
    /// Document deleted.
    Delete,
    /// Group of operations logged together.
    Batch,
}

impl fmt::Display for WalRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Batch => "batch",
        })
    }
}

/// A logged mutation.
///
/// Updates carry the full resulting document, so replaying a record never
/// depends on the state it is applied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WalRecord {
    /// A new document.
    Create {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// Document as stored.
        document: Document,
    },
    /// A changed document.
    Update {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
        /// Document after the change.
        document: Document,
    },
    /// A removed document.
    Delete {
        /// Target collection.
        collection: String,
        /// Document id.
        id: String,
    },
    /// Several operations on one collection, logged as one line.
    Batch {
        /// Target collection.
        collection: String,
        /// The grouped operations, in order.
        operations: Vec<WalRecord>,
    },
}

impl WalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Create { .. } => WalRecordType::Create,
            Self::Update { .. } => WalRecordType::Update,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::Batch { .. } => WalRecordType::Batch,
        }
    }

    /// Returns the collection the record applies to.
    #[must_use]
    pub fn collection(&self) -> &str {
        match self {
            Self::Create { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. }
            | Self::Batch { collection, .. } => collection,
        }
    }

    /// Returns the document id, for single-document records.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Create { id, .. } | Self::Update { id, .. } | Self::Delete { id, .. } => Some(id),
            Self::Batch { .. } => None,
        }
    }

    /// Expands batches into their single-document operations, in order.
    #[must_use]
    pub fn flatten(self) -> Vec<WalRecord> {
        match self {
            Self::Batch { operations, .. } => {
                operations.into_iter().flat_map(WalRecord::flatten).collect()
            }
            single => vec![single],
        }
    }

    /// Encodes the record as one checksummed line, newline included.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized.
    pub fn encode_line(&self) -> CoreResult<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut line = Vec::with_capacity(json.len() + 10);
        line.extend_from_slice(format!("{:08x}\t", compute_crc32(&json)).as_bytes());
        line.extend_from_slice(&json);
        line.push(b'\n');
        Ok(line)
    }

    /// Decodes one line, with or without its trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corrupted`] if the line is malformed or its
    /// checksum does not match.
    pub fn decode_line(line: &[u8]) -> CoreResult<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let corrupt = |message: &str| CoreError::corrupted("WAL line", message);

        let tab = line
            .iter()
            .position(|&b| b == b'\t')
            .ok_or_else(|| corrupt("missing checksum separator"))?;
        let (crc_hex, json) = (&line[..tab], &line[tab + 1..]);

        let expected = std::str::from_utf8(crc_hex)
            .ok()
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .ok_or_else(|| corrupt("malformed checksum"))?;
        let actual = compute_crc32(json);
        if expected != actual {
            return Err(CoreError::corrupted(
                "WAL line",
                format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
            ));
        }

        serde_json::from_slice(json).map_err(|e| CoreError::corrupted("WAL line", e.to_string()))
    }
}

/// Location of a record: segment number and byte offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WalPosition {
    /// Segment number.
    pub segment: u64,
    /// Byte offset of the line within the segment.
    pub offset: u64,
}

impl fmt::Display for WalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create(id: &str) -> WalRecord {
        WalRecord::Create {
            collection: "users".into(),
            id: id.into(),
            document: Document::from_value(json!({"id": id, "name": "Ann"})).unwrap(),
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn line_round_trip() {
        let record = create("u1");
        let line = record.encode_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(WalRecord::decode_line(&line).unwrap(), record);
    }

    #[test]
    fn json_carries_op_tag() {
        let line = WalRecord::Delete {
            collection: "c".into(),
            id: "x".into(),
        }
        .encode_line()
        .unwrap();
        let text = String::from_utf8(line).unwrap();
        let json = text.trim_end().split_once('\t').unwrap().1;
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value, json!({"op": "delete", "collection": "c", "id": "x"}));
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut line = create("u1").encode_line().unwrap();
        let idx = line.len() - 5;
        line[idx] ^= 0x01;
        assert!(matches!(
            WalRecord::decode_line(&line),
            Err(CoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn garbage_is_corrupt() {
        for line in [&b"no tab here\n"[..], b"zzzzzzzz\t{}\n", b"", b"\t"] {
            assert!(WalRecord::decode_line(line).is_err());
        }
    }

    #[test]
    fn batch_flattens_in_order() {
        let batch = WalRecord::Batch {
            collection: "users".into(),
            operations: vec![
                create("a"),
                WalRecord::Delete {
                    collection: "users".into(),
                    id: "b".into(),
                },
            ],
        };
        assert_eq!(batch.record_type(), WalRecordType::Batch);
        assert_eq!(batch.document_id(), None);

        let flat = batch.flatten();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0].document_id(), Some("a"));
        assert_eq!(flat[1].record_type(), WalRecordType::Delete);
    }
}

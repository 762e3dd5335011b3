// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

//! The flush index sidecar and its in-memory snapshot.

use std::collections::HashMap;
use std::path::PathBuf;

use bytes::{Buf, BufMut};

use crate::block::BlockId;

/// On-disk size of one index record.
pub const INDEX_RECORD_SIZE: usize = 40;

/// One entry of the index sidecar, 40 bytes big-endian:
///
/// ```plain
/// | offset | length | uncompressed | crc | block_id | task_attempt_id |
/// |   8B   |   4B   |      4B      | 8B  |    8B    |       8B        |
/// ```
///
/// Offsets point into the sibling data file at encoded block bodies of
/// `length` bytes. The crc is carried but trusted, not validated: checking
/// it would mean hashing the data region on every reload of a file that is
/// still growing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub offset: u64,
    pub length: u32,
    pub uncompress_length: u32,
    pub crc: u64,
    pub block_id: BlockId,
    pub task_attempt_id: i64,
}

impl IndexRecord {
    pub fn decode(buf: &mut impl Buf) -> Self {
        Self {
            offset: buf.get_u64(),
            length: buf.get_u32(),
            uncompress_length: buf.get_u32(),
            crc: buf.get_u64(),
            block_id: buf.get_u64(),
            task_attempt_id: buf.get_i64(),
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        buf.put_u32(self.uncompress_length);
        buf.put_u64(self.crc);
        buf.put_u64(self.block_id);
        buf.put_i64(self.task_attempt_id);
    }
}

/// Decode every whole record in `data`. A trailing partial record is
/// ignored: the index file grows while the merge runs, and a reader may
/// catch a record mid-write.
pub fn decode_index(mut data: &[u8]) -> Vec<IndexRecord> {
    let mut records = Vec::with_capacity(data.len() / INDEX_RECORD_SIZE);
    while data.remaining() >= INDEX_RECORD_SIZE {
        records.push(IndexRecord::decode(&mut data));
    }
    records
}

/// Byte region of one block inside a data file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileRegion {
    pub offset: u64,
    pub length: u32,
}

/// Cached snapshot of a partition's merged-output index.
///
/// The snapshot lags behind the actual file; a lookup miss is the signal to
/// reload it. Replacement is wholesale so readers never observe a torn map.
#[derive(Default)]
pub struct ShuffleMeta {
    data_file: Option<PathBuf>,
    regions: HashMap<BlockId, FileRegion>,
}

impl ShuffleMeta {
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.regions.contains_key(&block_id)
    }

    /// The data file and region holding `block_id`, if the snapshot knows it.
    pub fn locate(&self, block_id: BlockId) -> Option<(PathBuf, FileRegion)> {
        let region = self.regions.get(&block_id)?;
        let data_file = self.data_file.clone()?;
        Some((data_file, *region))
    }

    pub fn replace(&mut self, data_file: PathBuf, records: &[IndexRecord]) {
        self.data_file = Some(data_file);
        self.regions = records
            .iter()
            .map(|r| {
                (
                    r.block_id,
                    FileRegion {
                        offset: r.offset,
                        length: r.length,
                    },
                )
            })
            .collect();
    }

    pub fn clear(&mut self) {
        self.data_file = None;
        self.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn record(block_id: BlockId, offset: u64, length: u32) -> IndexRecord {
        IndexRecord {
            offset,
            length,
            uncompress_length: length,
            crc: 23,
            block_id,
            task_attempt_id: 1,
        }
    }

    #[test]
    fn test_record_round_trip() {
        let original = record(42, 1024, 333);
        let mut buf = BytesMut::new();
        original.encode(&mut buf);
        assert_eq!(buf.len(), INDEX_RECORD_SIZE);

        let decoded = IndexRecord::decode(&mut buf.freeze());
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_partial_trailing_record_is_ignored() {
        let mut buf = BytesMut::new();
        record(1, 0, 10).encode(&mut buf);
        record(2, 10, 20).encode(&mut buf);
        // a record still being written out
        buf.extend_from_slice(&[0u8; INDEX_RECORD_SIZE - 1]);

        let records = decode_index(&buf);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].block_id, 1);
        assert_eq!(records[1].block_id, 2);
    }

    #[test]
    fn test_meta_replace_and_locate() {
        let mut meta = ShuffleMeta::default();
        assert!(!meta.contains(1));

        meta.replace(PathBuf::from("/tmp/p0.data"), &[record(1, 0, 10)]);
        assert!(meta.contains(1));
        let (path, region) = meta.locate(1).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/p0.data"));
        assert_eq!(region, FileRegion { offset: 0, length: 10 });

        meta.replace(
            PathBuf::from("/tmp/p0.data"),
            &[record(1, 0, 10), record(2, 10, 20)],
        );
        assert!(meta.contains(2));

        meta.clear();
        assert!(meta.locate(1).is_none());
    }
}

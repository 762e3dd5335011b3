// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

//! Shuffle blocks and the identifiers that key them.

use std::fmt;

use bytes::Bytes;

pub type BlockId = u64;

/// Task attempt id carried by merged blocks instead of a real attempt.
pub const MERGED_BLOCK_TASK_ATTEMPT_ID: i64 = -1;

/// Encoded header overhead of a block: three u64 fields plus two u32 fields.
pub const BLOCK_HEADER_SIZE: usize = 32;

/// Identifies one reducer-side partition of one shuffle of one application.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionUid {
    pub app_id: String,
    pub shuffle_id: u32,
    pub partition_id: u32,
}

impl PartitionUid {
    pub fn new(app_id: impl Into<String>, shuffle_id: u32, partition_id: u32) -> Self {
        Self {
            app_id: app_id.into(),
            shuffle_id,
            partition_id,
        }
    }

    /// The same partition addressed under the merged-app alias.
    pub fn merged(&self, suffix: &str) -> Self {
        Self {
            app_id: format!("{}{}", self.app_id, suffix),
            shuffle_id: self.shuffle_id,
            partition_id: self.partition_id,
        }
    }
}

impl fmt::Display for PartitionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "appId[{}], shuffleId[{}], partitionId[{}]",
            self.app_id, self.shuffle_id, self.partition_id
        )
    }
}

/// One shuffle block, the atomic unit cached and flushed by the service.
///
/// The payload is a cheaply cloneable [`Bytes`] handle; `data_length` bounds
/// the valid region (the backing buffer may be larger, e.g. a LAB slab).
#[derive(Clone, Debug)]
pub struct Block {
    pub block_id: BlockId,
    pub data_length: u32,
    pub uncompress_length: u32,
    pub crc: u64,
    pub task_attempt_id: i64,
    /// Payload carved from a linear allocation buffer. The slab is recycled
    /// wholesale, so the bytes must be copied rather than shared.
    pub on_lab: bool,
    pub data: Bytes,
}

impl Block {
    /// A freshly written input block; crc is computed over the payload.
    pub fn new(block_id: BlockId, task_attempt_id: i64, data: Bytes) -> Self {
        let data_length = data.len() as u32;
        Self {
            block_id,
            data_length,
            uncompress_length: data_length,
            crc: block_crc(&data),
            task_attempt_id,
            on_lab: false,
            data,
        }
    }

    /// A block holding one slice of the sorted merge output. Merged blocks
    /// carry the sentinel task attempt id and store the emitted length in
    /// the crc and uncompressed-length fields.
    pub fn new_merged(block_id: BlockId, data: Bytes) -> Self {
        let data_length = data.len() as u32;
        Self {
            block_id,
            data_length,
            uncompress_length: data_length,
            crc: data_length as u64,
            task_attempt_id: MERGED_BLOCK_TASK_ATTEMPT_ID,
            on_lab: false,
            data,
        }
    }

    /// Bytes this block occupies once encoded with its header.
    pub fn encoded_length(&self) -> u64 {
        self.data_length as u64 + BLOCK_HEADER_SIZE as u64
    }
}

/// Crc of a block payload.
pub fn block_crc(data: &[u8]) -> u64 {
    crc32fast::hash(data) as u64
}

/// Blocks destined for one partition.
#[derive(Clone, Debug)]
pub struct PartitionedData {
    pub partition_id: u32,
    pub blocks: Vec<Block>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_length() {
        let block = Block::new(4, 5, Bytes::from(vec![0u8; 6]));
        assert_eq!(block.encoded_length(), 6 + 32);
    }

    #[test]
    fn test_merged_block_fields() {
        let block = Block::new_merged(7, Bytes::from(vec![1u8; 100]));
        assert_eq!(block.block_id, 7);
        assert_eq!(block.data_length, 100);
        assert_eq!(block.uncompress_length, 100);
        assert_eq!(block.crc, 100);
        assert_eq!(block.task_attempt_id, MERGED_BLOCK_TASK_ATTEMPT_ID);
    }

    #[test]
    fn test_merged_uid() {
        let uid = PartitionUid::new("app-1", 2, 3);
        let merged = uid.merged("@merged");
        assert_eq!(merged.app_id, "app-1@merged");
        assert_eq!(merged.shuffle_id, 2);
        assert_eq!(merged.partition_id, 3);
    }
}

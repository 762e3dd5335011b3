// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::block::BlockId;
use crate::error::MergeResult;

/// Destination of emitted merged blocks, implemented by the partition's
/// emit policy. An error is fatal for the merge that is writing.
#[async_trait]
pub trait MergedBlockSink: Send + Sync {
    async fn emit(&self, data: Bytes, block_id: BlockId, length: usize) -> MergeResult<()>;
}

/// Append-only sequence of emitted merged blocks.
///
/// Block ids are assigned densely from 0. A size is recorded only after the
/// sink accepted the block, so readers observe blocks strictly in id order
/// and never see a size for a block that was not published.
pub struct MergedResult {
    merged_block_size: usize,
    block_sizes: Mutex<Vec<u64>>,
}

impl MergedResult {
    pub fn new(merged_block_size: usize) -> Self {
        Self {
            merged_block_size,
            block_sizes: Mutex::new(vec![]),
        }
    }

    pub fn merged_block_size(&self) -> usize {
        self.merged_block_size
    }

    /// Size of an emitted block; `None` for ids not emitted yet.
    pub fn block_size(&self, block_id: BlockId) -> Option<u64> {
        self.block_sizes.lock().get(block_id as usize).copied()
    }

    /// True when `block_id` has not been emitted (yet).
    pub fn is_out_of_bound(&self, block_id: BlockId) -> bool {
        block_id as usize >= self.block_sizes.lock().len()
    }

    fn next_block_id(&self) -> BlockId {
        self.block_sizes.lock().len() as BlockId
    }

    fn record(&self, length: u64) {
        self.block_sizes.lock().push(length);
    }

    /// Open a write stream over this result. `total_bytes` is an advisory
    /// size of the incoming merge output, used to size the first buffer.
    pub fn open(
        self: &Arc<Self>,
        total_bytes: u64,
        sink: Arc<dyn MergedBlockSink>,
    ) -> MergedOutput {
        let capacity = self.merged_block_size.min(total_bytes as usize);
        MergedOutput {
            result: self.clone(),
            sink,
            buf: BytesMut::with_capacity(capacity),
        }
    }
}

/// Write stream that carves the merge output into fixed-size numbered
/// blocks. Every block except possibly the last one is exactly
/// `merged_block_size` bytes.
pub struct MergedOutput {
    result: Arc<MergedResult>,
    sink: Arc<dyn MergedBlockSink>,
    buf: BytesMut,
}

impl MergedOutput {
    pub async fn write(&mut self, mut data: &[u8]) -> MergeResult<()> {
        while !data.is_empty() {
            let room = self.result.merged_block_size - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.result.merged_block_size {
                self.flush_block().await?;
            }
        }
        Ok(())
    }

    /// Flush the tail block, if any. Must be called on the success path;
    /// dropping the stream discards unflushed bytes.
    pub async fn finish(&mut self) -> MergeResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.flush_block().await
    }

    async fn flush_block(&mut self) -> MergeResult<()> {
        let data = self.buf.split().freeze();
        let length = data.len();
        let block_id = self.result.next_block_id();
        self.sink.emit(data, block_id, length).await?;
        self.result.record(length as u64);
        Ok(())
    }
}

// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use super::flush_reader::{BlockFlushFileReader, BlockInputStream};
use crate::block::{BlockId, PartitionUid};
use crate::codec::{Record, RecordCodec, SerInput};
use crate::error::{MergeError, MergeResult};
use crate::server::BufferManager;

/// Ordered stream of records backing one input of the k-way merge.
///
/// Constructed unopened. `init` allocates streaming resources (for
/// file-backed segments, the flush-reader ring; it must run before the
/// reader starts), the first `next` primes the first record, and `close`
/// releases buffers and ring slots.
pub struct StreamedSegment {
    block_id: BlockId,
    input: SerInput,
    codec: Arc<dyn RecordCodec>,
    current: Option<Record>,
    total_bytes: usize,
}

impl std::fmt::Debug for StreamedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamedSegment")
            .field("block_id", &self.block_id)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl StreamedSegment {
    pub fn from_memory(block_id: BlockId, data: Bytes, codec: Arc<dyn RecordCodec>) -> Self {
        let total_bytes = data.len();
        Self {
            block_id,
            input: SerInput::memory(data),
            codec,
            current: None,
            total_bytes,
        }
    }

    pub fn from_stream(
        block_id: BlockId,
        stream: BlockInputStream,
        codec: Arc<dyn RecordCodec>,
    ) -> Self {
        let total_bytes = stream.available();
        Self {
            block_id,
            input: SerInput::stream(stream),
            codec,
            current: None,
            total_bytes,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Total bytes this segment will decode.
    pub fn available(&self) -> usize {
        self.total_bytes
    }

    pub fn init(&mut self) -> MergeResult<()> {
        self.input.init()
    }

    /// Advance to the next record; false once the segment is exhausted.
    pub async fn next(&mut self) -> MergeResult<bool> {
        self.current = self.codec.read_record(&mut self.input).await?;
        Ok(self.current.is_some())
    }

    pub fn current(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    pub fn close(&mut self) {
        self.current = None;
        self.input.close();
    }
}

/// Pull every expected block that is still resident in the shuffle buffers
/// into `cached`. LAB-carved payloads are deep-copied because the slab is
/// recycled independently of the blocks cut from it; heap payloads are
/// shared views sliced to the block's data length. A block the flusher
/// already released reports as absent and will be served from file.
///
/// Returns true only when every id was served from memory.
pub fn collect_blocks(
    buffers: &dyn BufferManager,
    uid: &PartitionUid,
    block_ids: impl Iterator<Item = BlockId>,
    cached: &mut HashMap<BlockId, Bytes>,
) -> bool {
    let mut all_cached = true;
    for block_id in block_ids {
        let Some(block) = buffers.get_block(uid, block_id) else {
            all_cached = false;
            continue;
        };
        let data_length = block.data_length as usize;
        let data = if block.on_lab {
            Bytes::copy_from_slice(&block.data[..data_length])
        } else {
            block.data.slice(0..data_length)
        };
        cached.insert(block_id, data);
    }
    all_cached
}

/// Materialize one segment per expected block: memory-backed when collected,
/// file-backed through `reader` otherwise. A block absent from both sources
/// fails the build.
pub fn build_segments(
    block_ids: impl Iterator<Item = BlockId>,
    mut cached: HashMap<BlockId, Bytes>,
    reader: Option<&BlockFlushFileReader>,
    codec: &Arc<dyn RecordCodec>,
) -> MergeResult<Vec<StreamedSegment>> {
    let mut segments = vec![];
    for block_id in block_ids {
        if let Some(data) = cached.remove(&block_id) {
            segments.push(StreamedSegment::from_memory(block_id, data, codec.clone()));
            continue;
        }
        match reader.and_then(|r| r.register(block_id)) {
            Some(stream) => {
                segments.push(StreamedSegment::from_stream(block_id, stream, codec.clone()))
            }
            None => {
                warn!("no buffer or flush file contains block {}", block_id);
                return Err(MergeError::BlockNotFound(block_id));
            }
        }
    }
    Ok(segments)
}

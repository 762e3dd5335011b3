// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

//! Interfaces to the surrounding shuffle server.
//!
//! The merge engine never owns block storage, memory quota or file layout;
//! it consumes these three collaborators and is oblivious to how they are
//! implemented.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::block::{Block, BlockId, PartitionUid, PartitionedData};
use crate::error::MergeResult;

/// Status of a cache attempt against the shuffle buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Success,
    NoBuffer,
    NoRegister,
    InternalError,
}

/// In-memory shuffle buffers, keyed by partition and block id.
#[async_trait]
pub trait BufferManager: Send + Sync + 'static {
    /// Look up a resident block. `None` means the block was never cached
    /// here, or the flusher already released it; either way the caller must
    /// fall back to the flush files.
    fn get_block(&self, uid: &PartitionUid, block_id: BlockId) -> Option<Block>;

    /// Cache blocks into the shuffle buffers. `is_pre_allocated` marks data
    /// whose memory quota the caller already charged against the task
    /// manager.
    async fn cache(
        &self,
        app_id: &str,
        shuffle_id: u32,
        is_pre_allocated: bool,
        data: &PartitionedData,
    ) -> CacheStatus;

    /// Record newly cached block ids for reader-side bookkeeping.
    fn update_cached_block_ids(
        &self,
        app_id: &str,
        shuffle_id: u32,
        partition_id: u32,
        blocks: &[Block],
    );
}

/// Global memory admission.
pub trait TaskManager: Send + Sync + 'static {
    fn require_memory(&self, size: u64, high_priority: bool) -> bool;

    fn release_memory(&self, size: u64, is_releasing_from_buffer: bool, is_pre_allocation: bool);
}

/// Keys a storage lookup for flushed partition data.
#[derive(Clone, Debug)]
pub struct ReadEvent {
    pub app_id: String,
    pub shuffle_id: u32,
    pub partition_id: u32,
}

/// The index sidecar of one flushed partition, plus the data file it
/// describes.
pub struct IndexResult {
    pub data_file: PathBuf,
    pub index_data: Bytes,
}

/// Read access to one flushed (data, index) file pair.
#[async_trait]
pub trait ReadHandler: Send + Sync {
    fn data_file(&self) -> PathBuf;

    fn index_file(&self) -> PathBuf;

    /// Read the index sidecar as of now. The underlying files may keep
    /// growing after this returns.
    async fn read_index(&self) -> MergeResult<IndexResult>;
}

/// Resolves a partition to the local storage holding its flushed data.
pub trait StorageManager: Send + Sync + 'static {
    /// `None` when nothing has been flushed for this partition yet.
    fn select_storage(&self, event: &ReadEvent) -> Option<Arc<dyn ReadHandler>>;
}

/// Handles to the surrounding server, shared by every shuffle.
#[derive(Clone)]
pub struct ServerEnv {
    pub buffer_manager: Arc<dyn BufferManager>,
    pub task_manager: Arc<dyn TaskManager>,
    pub storage_manager: Arc<dyn StorageManager>,
}

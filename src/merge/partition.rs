// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use itertools::Itertools;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::driver::merge_segments;
use super::event::{MergeEvent, MergeEventHandler};
use super::flush_reader::BlockFlushFileReader;
use super::meta::{decode_index, ShuffleMeta};
use super::result::{MergedBlockSink, MergedResult};
use super::segment::{build_segments, collect_blocks, StreamedSegment};
use super::state::{MergeState, MergeStatus};
use super::MERGE_APP_SUFFIX;
use crate::block::{Block, BlockId, PartitionUid, PartitionedData};
use crate::codec::{KeyComparator, RecordCodec};
use crate::error::{MergeError, MergeResult};
use crate::options::MergeOptions;
use crate::server::{CacheStatus, ReadEvent, ReadHandler, ServerEnv};

/// A fetched merged block: resident bytes, or a lazy region of the merged
/// data file for the RPC layer to stream out.
#[derive(Debug)]
pub enum DataResult {
    Memory(Bytes),
    FileSegment {
        path: PathBuf,
        offset: u64,
        length: usize,
    },
}

impl DataResult {
    /// Materialize the payload; file-backed results read their region.
    pub async fn read_bytes(&self) -> MergeResult<Bytes> {
        match self {
            DataResult::Memory(data) => Ok(data.clone()),
            DataResult::FileSegment {
                path,
                offset,
                length,
            } => {
                let path = path.clone();
                let (offset, length) = (*offset, *length);
                let read = tokio::task::spawn_blocking(move || -> std::io::Result<Bytes> {
                    let mut file = std::fs::File::open(path)?;
                    file.seek(SeekFrom::Start(offset))?;
                    let mut data = vec![0; length];
                    file.read_exact(&mut data)?;
                    Ok(Bytes::from(data))
                })
                .await;
                match read {
                    Ok(Ok(data)) => Ok(data),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(MergeError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        e,
                    ))),
                }
            }
        }
    }
}

/// Per-partition merge state: the lifecycle state machine, the merged
/// result, and the cached view of the merged-output files.
///
/// A partition serves readers concurrently with its own merge: `try_get_block`
/// answers size probes while blocks are still being emitted, and `get_data`
/// falls back from the shuffle buffers to the (growing) merged data file.
pub struct Partition {
    uid: PartitionUid,
    comparator: Arc<dyn KeyComparator>,
    codec: Arc<dyn RecordCodec>,
    options: Arc<MergeOptions>,
    env: Arc<ServerEnv>,
    event_handler: Arc<dyn MergeEventHandler>,

    state: Mutex<MergeState>,
    result: Arc<MergedResult>,
    meta: tokio::sync::Mutex<ShuffleMeta>,
    /// Current admission backoff; doubles on refusal, resets on success.
    sleep_ms: AtomicU64,
    cancelled: AtomicBool,
    ring_capacity: usize,
}

impl Partition {
    pub(crate) fn new(
        uid: PartitionUid,
        comparator: Arc<dyn KeyComparator>,
        codec: Arc<dyn RecordCodec>,
        options: Arc<MergeOptions>,
        env: Arc<ServerEnv>,
        event_handler: Arc<dyn MergeEventHandler>,
    ) -> Self {
        let ring_capacity = options.ring_buffer_capacity();
        let sleep_ms = AtomicU64::new(options.cache_merged_block_init_sleep_ms);
        Self {
            uid,
            comparator,
            codec,
            options: options.clone(),
            env,
            event_handler,
            state: Mutex::new(MergeState::Inited),
            result: Arc::new(MergedResult::new(options.merged_block_size)),
            meta: tokio::sync::Mutex::new(ShuffleMeta::default()),
            sleep_ms,
            cancelled: AtomicBool::new(false),
            ring_capacity,
        }
    }

    pub fn uid(&self) -> &PartitionUid {
        &self.uid
    }

    pub fn state(&self) -> MergeState {
        *self.state.lock()
    }

    fn set_state(&self, next: MergeState) {
        let mut state = self.state.lock();
        debug!("partition {} transitions from {} to {}", self.uid, *state, next);
        *state = next;
    }

    /// Trigger the merge of `expected_blocks`. Duplicate triggers are
    /// ignored with a warning; an empty set completes immediately; a
    /// refused event submission is fatal for the partition.
    pub fn start_sort_merge(&self, expected_blocks: BTreeSet<BlockId>) {
        let mut state = self.state.lock();
        if *state != MergeState::Inited {
            warn!(
                "partition {} is already merging, ignoring duplicate report",
                self.uid
            );
            return;
        }
        if expected_blocks.is_empty() {
            debug!("partition {} has no blocks to merge", self.uid);
            *state = MergeState::Done;
            return;
        }
        *state = MergeState::Merging;
        drop(state);

        let event = MergeEvent {
            uid: self.uid.clone(),
            expected_blocks,
        };
        if !self.event_handler.handle(event) {
            warn!("merge event rejected for partition {}", self.uid);
            self.set_state(MergeState::InternalError);
        }
    }

    /// Snapshot the state and, when the block is already emitted, its size.
    /// Readers poll this while the merge is still running and loop on -1
    /// until the next block appears or the state turns terminal.
    pub fn try_get_block(&self, block_id: BlockId) -> MergeStatus {
        let state = self.state();
        let mut size = -1i64;
        if matches!(state, MergeState::Merging | MergeState::Done)
            && !self.result.is_out_of_bound(block_id)
        {
            if let Some(length) = self.result.block_size(block_id) {
                size = length as i64;
            }
        }
        MergeStatus { state, size }
    }

    /// Run the whole merge pipeline for one trigger. The terminal state is
    /// always set here; failures while closing resources are logged and
    /// never mask the primary outcome.
    pub(crate) async fn run_merge(self: &Arc<Self>, expected_blocks: &BTreeSet<BlockId>) {
        let mut reader = None;
        let mut segments = vec![];
        match self
            .merge_once(expected_blocks, &mut reader, &mut segments)
            .await
        {
            Ok(()) => self.set_state(MergeState::Done),
            Err(e) => {
                info!(
                    "merge failed for partition {}, expected blocks [{}]: {}",
                    self.uid,
                    expected_blocks.iter().join(","),
                    e
                );
                self.set_state(MergeState::InternalError);
            }
        }
        if let Some(reader) = reader {
            reader.close().await;
        }
        for segment in &mut segments {
            segment.close();
        }
    }

    async fn merge_once(
        self: &Arc<Self>,
        expected_blocks: &BTreeSet<BlockId>,
        reader: &mut Option<BlockFlushFileReader>,
        segments: &mut Vec<StreamedSegment>,
    ) -> MergeResult<()> {
        let mut cached = HashMap::new();
        let all_cached = collect_blocks(
            self.env.buffer_manager.as_ref(),
            &self.uid,
            expected_blocks.iter().copied(),
            &mut cached,
        );
        if !all_cached {
            *reader = Some(self.create_reader().await?);
        }
        *segments = build_segments(
            expected_blocks.iter().copied(),
            cached,
            reader.as_ref(),
            &self.codec,
        )?;

        let total_bytes: u64 = segments.iter().map(|s| s.available() as u64).sum();
        let sink: Arc<dyn MergedBlockSink> = self.clone();
        let mut output = self.result.open(total_bytes, sink);

        // segment init claims the per-block rings; the reader may only
        // start once every ring exists
        for segment in segments.iter_mut() {
            segment.init()?;
        }
        if let Some(reader) = reader.as_ref() {
            reader.start();
        }

        merge_segments(segments, &self.comparator, &self.codec, &mut output).await
    }

    async fn create_reader(&self) -> MergeResult<BlockFlushFileReader> {
        let handler = self.read_handler(self.uid.app_id.clone())?;
        BlockFlushFileReader::open(
            handler.data_file(),
            handler.index_file(),
            self.ring_capacity,
            self.options.direct,
        )
        .await
    }

    fn read_handler(&self, app_id: String) -> MergeResult<Arc<dyn ReadHandler>> {
        let event = ReadEvent {
            app_id,
            shuffle_id: self.uid.shuffle_id,
            partition_id: self.uid.partition_id,
        };
        self.env
            .storage_manager
            .select_storage(&event)
            .ok_or_else(|| MergeError::StorageNotFound(self.uid.to_string()))
    }

    /// Block until the admission controller grants `size` bytes, doubling
    /// the sleep on each refusal up to the configured cap. Cancellation of
    /// the wait is fatal for the merge.
    async fn require_memory(&self, size: u64) -> MergeResult<()> {
        while !self.env.task_manager.require_memory(size, false) {
            if self.cancelled.load(Ordering::Acquire) {
                warn!(
                    "cancelled while waiting for {} bytes for partition {}",
                    size, self.uid
                );
                return Err(MergeError::Cancelled);
            }
            let sleep_ms = self.sleep_ms.load(Ordering::Acquire);
            debug!(
                "cannot allocate {} bytes for partition {}, sleeping {}ms",
                size, self.uid, sleep_ms
            );
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            self.sleep_ms.store(
                (sleep_ms * 2).min(self.options.cache_merged_block_max_sleep_ms),
                Ordering::Release,
            );
        }
        Ok(())
    }

    /// Fetch one merged block: the shuffle buffers first, then the merged
    /// data file. A miss in both is a per-request error and does not fail
    /// the partition.
    pub async fn get_data(&self, block_id: BlockId) -> MergeResult<DataResult> {
        if let Some(data) = self.merged_block_in_memory(block_id) {
            return Ok(DataResult::Memory(data));
        }
        self.merged_block_in_file(block_id).await
    }

    fn merged_block_in_memory(&self, block_id: BlockId) -> Option<Bytes> {
        let merged_uid = self.uid.merged(MERGE_APP_SUFFIX);
        // an absent block also covers losing the race against the flush
        // release; the file path below picks it up
        let block = self.env.buffer_manager.get_block(&merged_uid, block_id)?;
        Some(block.data.slice(0..block.data_length as usize))
    }

    async fn merged_block_in_file(&self, block_id: BlockId) -> MergeResult<DataResult> {
        let mut meta = self.meta.lock().await;
        if !meta.contains(block_id) {
            self.reload_meta(&mut meta).await?;
        }
        match meta.locate(block_id) {
            Some((path, region)) => Ok(DataResult::FileSegment {
                path,
                offset: region.offset,
                length: region.length as usize,
            }),
            None => Err(MergeError::BlockNotFound(block_id)),
        }
    }

    /// The merged-output index keeps growing while the merge runs; reload
    /// the snapshot wholesale under the partition meta lock.
    async fn reload_meta(&self, meta: &mut ShuffleMeta) -> MergeResult<()> {
        let merged_app_id = format!("{}{}", self.uid.app_id, MERGE_APP_SUFFIX);
        let handler = self.read_handler(merged_app_id)?;
        let index = handler.read_index().await?;
        let records = decode_index(&index.index_data);
        meta.replace(index.data_file, &records);
        Ok(())
    }

    /// Drop cached metadata and cancel any in-flight admission wait.
    pub async fn cleanup(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.meta.lock().await.clear();
    }
}

#[async_trait]
impl MergedBlockSink for Partition {
    /// Publish one merged block under the merged-app alias.
    ///
    /// The admission quota charged here is not released on success: it
    /// travels with the cached block and is given back by the buffer
    /// manager's flush path. Only a refused cache hands the quota straight
    /// back.
    async fn emit(&self, data: Bytes, block_id: BlockId, length: usize) -> MergeResult<()> {
        let block = Block::new_merged(block_id, data);
        let encoded_length = block.encoded_length();
        self.require_memory(encoded_length).await?;

        let merged_app_id = format!("{}{}", self.uid.app_id, MERGE_APP_SUFFIX);
        let data = PartitionedData {
            partition_id: self.uid.partition_id,
            blocks: vec![block],
        };
        let status = self
            .env
            .buffer_manager
            .cache(&merged_app_id, self.uid.shuffle_id, true, &data)
            .await;
        match status {
            CacheStatus::Success => {
                self.env.buffer_manager.update_cached_block_ids(
                    &merged_app_id,
                    self.uid.shuffle_id,
                    self.uid.partition_id,
                    &data.blocks,
                );
                self.sleep_ms.store(
                    self.options.cache_merged_block_init_sleep_ms,
                    Ordering::Release,
                );
                Ok(())
            }
            status => {
                warn!(
                    "error caching merged block {} of length {} for appId[{}], shuffleId[{}], partitionId[{}], status {:?}",
                    block_id, length, merged_app_id, self.uid.shuffle_id, self.uid.partition_id, status
                );
                self.env.task_manager.release_memory(encoded_length, false, false);
                Err(MergeError::CacheFailed(block_id, status))
            }
        }
    }
}

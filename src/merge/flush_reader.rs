// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

//! A single-reader fan-out over one flushed (data, index) file pair.
//!
//! Many per-block segment streams share one open data file. A lone
//! background task reads chunks in a round-robin over the registered
//! streams and deposits them into bounded per-stream rings, so reader
//! memory stays at `streams x ring capacity x chunk size` no matter how
//! large the blocks are. Within a stream, chunks arrive in file order;
//! across streams nothing is promised.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::meta::{decode_index, FileRegion};
use crate::block::BlockId;
use crate::error::{MergeError, MergeResult};

/// Bytes read from the data file per ring slot.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Open data file shared by all streams of one reader.
#[derive(Clone)]
enum FlushFile {
    /// Positional reads on a shared descriptor.
    #[cfg(unix)]
    Positioned(Arc<std::fs::File>),
    /// Seek-then-read under a lock.
    Seek(Arc<Mutex<std::fs::File>>),
}

impl FlushFile {
    fn open(path: &Path, direct: bool) -> MergeResult<Self> {
        let file = std::fs::File::open(path)?;
        #[cfg(unix)]
        if direct {
            return Ok(FlushFile::Positioned(Arc::new(file)));
        }
        #[cfg(not(unix))]
        let _ = direct;
        Ok(FlushFile::Seek(Arc::new(Mutex::new(file))))
    }

    fn read_at(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        let mut data = vec![0; len];
        match self {
            #[cfg(unix)]
            FlushFile::Positioned(file) => {
                use std::os::unix::fs::FileExt;
                file.read_exact_at(&mut data, offset)?;
            }
            FlushFile::Seek(file) => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut data)?;
            }
        }
        Ok(Bytes::from(data))
    }
}

/// In-band ring slot: a chunk of bytes, end of stream, or stream failure.
enum Slot {
    Data(Bytes),
    Eof,
    Failed(String),
}

struct StreamState {
    /// File position of the next unread byte.
    cursor: u64,
    /// Bytes of the block not yet handed to the ring.
    remaining: usize,
    /// Producer side of the ring; present once the stream was initialized.
    tx: Option<mpsc::Sender<Slot>>,
    /// EOF or failure delivered, or the consumer went away.
    done: bool,
}

struct Shared {
    file: FlushFile,
    ring_capacity: usize,
    streams: Mutex<HashMap<BlockId, StreamState>>,
    /// Consumers signal after freeing a ring slot; close signals too.
    producer_wakeup: Notify,
    started: AtomicBool,
    stopped: AtomicBool,
}

/// Lazy byte stream over one block inside the flush data file.
///
/// No I/O happens until the owning reader is started and the stream is
/// polled; `init` only claims the ring.
pub struct BlockInputStream {
    block_id: BlockId,
    length: usize,
    shared: Arc<Shared>,
    rx: Option<mpsc::Receiver<Slot>>,
    finished: bool,
}

impl BlockInputStream {
    /// Total bytes this stream will deliver.
    pub fn available(&self) -> usize {
        self.length
    }

    /// Allocate this stream's ring. Must run before the reader starts.
    pub fn init(&mut self) -> MergeResult<()> {
        if self.rx.is_some() {
            return Ok(());
        }
        if self.shared.started.load(Ordering::Acquire) {
            return Err(MergeError::FlushReader(format!(
                "stream for block {} initialized after reader start",
                self.block_id
            )));
        }
        let (tx, rx) = mpsc::channel(self.shared.ring_capacity);
        match self.shared.streams.lock().get_mut(&self.block_id) {
            Some(state) => state.tx = Some(tx),
            None => {
                return Err(MergeError::FlushReader(format!(
                    "block {} is not registered",
                    self.block_id
                )))
            }
        }
        self.rx = Some(rx);
        Ok(())
    }

    /// Next chunk in file order; `None` at end of stream.
    pub async fn next_chunk(&mut self) -> MergeResult<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        let rx = self.rx.as_mut().ok_or_else(|| {
            MergeError::FlushReader(format!("stream for block {} polled before init", self.block_id))
        })?;
        let slot = rx.recv().await;
        // the drained slot freed ring space
        self.shared.producer_wakeup.notify_one();
        match slot {
            Some(Slot::Data(chunk)) => Ok(Some(chunk)),
            Some(Slot::Eof) => {
                self.finished = true;
                Ok(None)
            }
            Some(Slot::Failed(reason)) => {
                self.finished = true;
                Err(MergeError::StreamFailed(self.block_id, reason))
            }
            None => {
                self.finished = true;
                Err(MergeError::StreamFailed(
                    self.block_id,
                    "flush reader closed".to_string(),
                ))
            }
        }
    }

    /// Release the ring and stop feeding this stream.
    pub fn close(&mut self) {
        // dropping the receiver closes the channel; the reader retires the
        // stream on its next pass
        self.rx = None;
        self.finished = true;
        self.shared.producer_wakeup.notify_one();
    }
}

/// Serves many per-block input streams from one (data, index) file pair
/// with a single background reader task.
pub struct BlockFlushFileReader {
    shared: Arc<Shared>,
    index: HashMap<BlockId, FileRegion>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BlockFlushFileReader {
    pub async fn open(
        data_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        ring_capacity: usize,
        direct: bool,
    ) -> MergeResult<Self> {
        debug_assert!(ring_capacity.is_power_of_two());
        let index_data = tokio::fs::read(index_path.as_ref()).await?;
        let index = decode_index(&index_data)
            .into_iter()
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
        let file = FlushFile::open(data_path.as_ref(), direct)?;
        Ok(Self {
            shared: Arc::new(Shared {
                file,
                ring_capacity,
                streams: Mutex::new(HashMap::new()),
                producer_wakeup: Notify::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            index,
            task: Mutex::new(None),
        })
    }

    /// Create the lazy stream for `block_id`, or `None` when the block is
    /// absent from the flush index. Registration closes once the reader
    /// starts.
    pub fn register(&self, block_id: BlockId) -> Option<BlockInputStream> {
        if self.shared.started.load(Ordering::Acquire) {
            warn!("rejecting stream registration for block {}: reader already started", block_id);
            return None;
        }
        let region = *self.index.get(&block_id)?;
        let mut streams = self.shared.streams.lock();
        if streams.contains_key(&block_id) {
            warn!("block {} is already registered", block_id);
            return None;
        }
        streams.insert(
            block_id,
            StreamState {
                cursor: region.offset,
                remaining: region.length as usize,
                tx: None,
                done: false,
            },
        );
        Some(BlockInputStream {
            block_id,
            length: region.length as usize,
            shared: self.shared.clone(),
            rx: None,
            finished: false,
        })
    }

    /// Spawn the background reader. Every required stream must have been
    /// registered and initialized by now.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "flush reader starting with {} streams",
            self.shared.streams.lock().len()
        );
        let shared = self.shared.clone();
        *self.task.lock() = Some(tokio::spawn(read_loop(shared)));
    }

    /// Stop the reader, fail any stream still waiting, and release the
    /// file once the last stream drops.
    pub async fn close(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.producer_wakeup.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("flush reader task failed: {e}");
            }
        }
        // anything not delivered yet surfaces as a closed-stream failure
        let mut streams = self.shared.streams.lock();
        for state in streams.values_mut() {
            state.tx = None;
            state.done = true;
        }
    }
}

async fn read_loop(shared: Arc<Shared>) {
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }

        // scan under the lock, but never hold it across file I/O
        let mut batch = vec![];
        let mut live = 0usize;
        let mut progressed = false;
        {
            let mut streams = shared.streams.lock();
            for (&block_id, state) in streams.iter_mut() {
                if state.done {
                    continue;
                }
                let Some(tx) = state.tx.clone() else {
                    warn!("stream for block {} was never initialized", block_id);
                    state.done = true;
                    continue;
                };
                if tx.is_closed() {
                    state.done = true;
                    state.tx = None;
                    continue;
                }
                live += 1;
                match tx.try_reserve_owned() {
                    Ok(permit) => {
                        if state.remaining == 0 {
                            permit.send(Slot::Eof);
                            state.done = true;
                            state.tx = None;
                            progressed = true;
                        } else {
                            let len = CHUNK_SIZE.min(state.remaining);
                            batch.push((block_id, state.cursor, len, permit));
                            state.cursor += len as u64;
                            state.remaining -= len;
                        }
                    }
                    Err(TrySendError::Closed(_)) => {
                        state.done = true;
                        state.tx = None;
                    }
                    // ring full; revisit once the consumer drains a slot
                    Err(TrySendError::Full(_)) => {}
                }
            }
        }

        for (block_id, offset, len, permit) in batch {
            let file = shared.file.clone();
            let read = tokio::task::spawn_blocking(move || file.read_at(offset, len)).await;
            match read {
                Ok(Ok(chunk)) => {
                    permit.send(Slot::Data(chunk));
                }
                Ok(Err(e)) => {
                    warn!("failed to read flushed block {}: {}", block_id, e);
                    permit.send(Slot::Failed(e.to_string()));
                    retire_stream(&shared, block_id);
                }
                Err(e) => {
                    warn!("flush read task for block {} failed: {}", block_id, e);
                    permit.send(Slot::Failed(e.to_string()));
                    retire_stream(&shared, block_id);
                }
            }
            progressed = true;
        }

        if live == 0 {
            debug!("flush reader drained all streams");
            break;
        }
        if !progressed {
            // every ring is full (or finished); park until a consumer
            // frees a slot or close is signalled
            shared.producer_wakeup.notified().await;
        }
    }
}

fn retire_stream(shared: &Shared, block_id: BlockId) {
    if let Some(state) = shared.streams.lock().get_mut(&block_id) {
        state.done = true;
        state.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::merge::meta::IndexRecord;

    /// Lay out blocks the way the flush path does: payloads appended to the
    /// data file, one 40-byte record per block in the index sidecar.
    fn write_flush_files(dir: &Path, blocks: &[(BlockId, Vec<u8>)]) -> (PathBuf, PathBuf) {
        let mut data = BytesMut::new();
        let mut index = BytesMut::new();
        for (block_id, payload) in blocks {
            IndexRecord {
                offset: data.len() as u64,
                length: payload.len() as u32,
                uncompress_length: payload.len() as u32,
                crc: crate::block::block_crc(payload),
                block_id: *block_id,
                task_attempt_id: 1,
            }
            .encode(&mut index);
            data.put_slice(payload);
        }
        let data_path = dir.join("partition.data");
        let index_path = dir.join("partition.index");
        std::fs::write(&data_path, &data).unwrap();
        std::fs::write(&index_path, &index).unwrap();
        (data_path, index_path)
    }

    async fn read_all(stream: &mut BlockInputStream) -> MergeResult<Vec<u8>> {
        let mut out = vec![];
        while let Some(chunk) = stream.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn payload(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    #[tokio::test]
    async fn test_streams_deliver_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = vec![
            (1, payload(1, 100)),
            (2, payload(2, 3 * CHUNK_SIZE + 17)),
            (3, payload(3, 0)),
        ];
        let (data_path, index_path) = write_flush_files(dir.path(), &blocks);

        let reader = BlockFlushFileReader::open(&data_path, &index_path, 4, true)
            .await
            .unwrap();
        let mut streams = blocks
            .iter()
            .map(|(id, payload)| {
                let stream = reader.register(*id).unwrap();
                assert_eq!(stream.available(), payload.len());
                stream
            })
            .collect::<Vec<_>>();
        for stream in &mut streams {
            stream.init().unwrap();
        }
        reader.start();

        for (stream, (_, payload)) in streams.iter_mut().zip(&blocks) {
            assert_eq!(read_all(stream).await.unwrap(), *payload);
        }
        reader.close().await;
    }

    #[tokio::test]
    async fn test_register_unknown_block() {
        let dir = tempfile::tempdir().unwrap();
        let (data_path, index_path) = write_flush_files(dir.path(), &[(1, payload(1, 10))]);
        let reader = BlockFlushFileReader::open(&data_path, &index_path, 2, true)
            .await
            .unwrap();
        assert!(reader.register(99).is_none());
    }

    #[tokio::test]
    async fn test_register_closes_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let (data_path, index_path) =
            write_flush_files(dir.path(), &[(1, payload(1, 10)), (2, payload(2, 10))]);
        let reader = BlockFlushFileReader::open(&data_path, &index_path, 2, true)
            .await
            .unwrap();
        let mut stream = reader.register(1).unwrap();
        stream.init().unwrap();
        reader.start();

        assert!(reader.register(2).is_none());
        assert_eq!(read_all(&mut stream).await.unwrap(), payload(1, 10));
        reader.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_is_lazy_until_start() {
        let dir = tempfile::tempdir().unwrap();
        let (data_path, index_path) = write_flush_files(dir.path(), &[(1, payload(1, 10))]);
        let reader = BlockFlushFileReader::open(&data_path, &index_path, 2, true)
            .await
            .unwrap();
        let mut stream = reader.register(1).unwrap();
        stream.init().unwrap();

        // nothing is produced before start()
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), stream.next_chunk()).await;
        assert!(pending.is_err());

        reader.start();
        assert_eq!(read_all(&mut stream).await.unwrap(), payload(1, 10));
        reader.close().await;
    }

    #[tokio::test]
    async fn test_io_error_is_isolated_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let good = payload(7, 2 * CHUNK_SIZE);
        let (data_path, index_path) = write_flush_files(dir.path(), &[(1, good.clone())]);
        // index entry pointing past the end of the data file
        let mut index = std::fs::read(&index_path).unwrap();
        IndexRecord {
            offset: 1 << 30,
            length: 100,
            uncompress_length: 100,
            crc: 0,
            block_id: 2,
            task_attempt_id: 1,
        }
        .encode(&mut index);
        std::fs::write(&index_path, &index).unwrap();

        let reader = BlockFlushFileReader::open(&data_path, &index_path, 2, true)
            .await
            .unwrap();
        let mut ok_stream = reader.register(1).unwrap();
        let mut bad_stream = reader.register(2).unwrap();
        ok_stream.init().unwrap();
        bad_stream.init().unwrap();
        reader.start();

        let err = read_all(&mut bad_stream).await.unwrap_err();
        assert!(matches!(err, MergeError::StreamFailed(2, _)));
        assert_eq!(read_all(&mut ok_stream).await.unwrap(), good);
        reader.close().await;
    }

    #[tokio::test]
    async fn test_small_ring_backpressure() {
        let dir = tempfile::tempdir().unwrap();
        let big = payload(9, 10 * CHUNK_SIZE + 1);
        let (data_path, index_path) = write_flush_files(dir.path(), &[(1, big.clone())]);

        let reader = BlockFlushFileReader::open(&data_path, &index_path, 2, true)
            .await
            .unwrap();
        let mut stream = reader.register(1).unwrap();
        stream.init().unwrap();
        reader.start();

        // drain slowly; the producer must park and resume without loss
        let mut out = vec![];
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
            tokio::task::yield_now().await;
        }
        assert_eq!(out, big);
        reader.close().await;
    }
}

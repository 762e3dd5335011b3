// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

//! The per-partition sort-merge engine.
//!
//! For each (app, shuffle, partition) triple the engine assembles the
//! partition's blocks from the shuffle buffers and the flushed data files,
//! runs a k-way merge under the shuffle's key comparator, and publishes the
//! ordered output as fixed-size merged blocks under the merged-app alias,
//! serving readers while the merge is still in flight.

mod driver;
mod event;
mod flush_reader;
mod manager;
mod meta;
mod partition;
mod result;
mod segment;
mod state;


pub use driver::merge_segments;
pub use event::{MergeEvent, MergeEventHandler, QueuedMergeEventHandler};
pub use flush_reader::{BlockFlushFileReader, BlockInputStream, CHUNK_SIZE};
pub use manager::{Shuffle, ShuffleMergeManager};
pub use meta::{decode_index, FileRegion, IndexRecord, ShuffleMeta, INDEX_RECORD_SIZE};
pub use partition::{DataResult, Partition};
pub use result::{MergedBlockSink, MergedOutput, MergedResult};
pub use segment::{build_segments, collect_blocks, StreamedSegment};
pub use state::{MergeState, MergeStatus};

/// Suffix appended to an application id to address its merged output. The
/// alias behaves like a normal app on every cache and flush path.
pub const MERGE_APP_SUFFIX: &str = "@merged";

// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

//! ShuffleLight: the per-partition sort-merge engine of a remote shuffle
//! service.
//!
//! The engine takes the blocks written for one (app, shuffle, partition)
//! triple, wherever they currently live: still resident in the shuffle
//! buffers or already flushed to a local data file. It sorts them under a
//! user-supplied key comparator and caches the ordered output back into the
//! service as fixed-size merged blocks, which readers can start fetching
//! while the merge is still running.
//!
//! Block storage, memory admission and file layout stay with the
//! surrounding server; the engine consumes them through the traits in
//! [`server`].

pub mod block;
pub mod codec;
pub mod error;
pub mod merge;
pub mod options;
pub mod server;

pub use block::{Block, BlockId, PartitionUid};
pub use error::{MergeError, MergeResult};
pub use merge::{MergeState, MergeStatus, ShuffleMergeManager};
pub use options::MergeOptions;

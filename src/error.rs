// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use thiserror::Error;

use crate::block::BlockId;
use crate::server::CacheStatus;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("block {0} not found in buffers or flush files")]
    BlockNotFound(BlockId),
    #[error("flush stream for block {0} failed: {1}")]
    StreamFailed(BlockId, String),
    #[error("flush file reader: {0}")]
    FlushReader(String),
    #[error("no storage holds flushed data for {0}")]
    StorageNotFound(String),
    #[error("merge cancelled while waiting for memory")]
    Cancelled,
    #[error("failed to cache merged block {0}, status {1:?}")]
    CacheFailed(BlockId, CacheStatus),
    #[error("shuffle {1} of app {0} is not registered")]
    ShuffleNotRegistered(String, u32),
}

impl MergeError {
    pub fn decode(message: impl ToString) -> Self {
        MergeError::Decode(message.to_string())
    }
}

pub type MergeResult<T> = std::result::Result<T, MergeError>;

// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use std::fmt;

/// Lifecycle of a partition merge.
///
/// Valid transitions: INITED -> MERGING, INITED -> DONE (empty input),
/// INITED -> INTERNAL_ERROR (trigger refused), MERGING -> DONE,
/// MERGING -> INTERNAL_ERROR. DONE and INTERNAL_ERROR are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeState {
    Inited,
    Merging,
    Done,
    InternalError,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeState::Inited => "INITED",
            MergeState::Merging => "MERGING",
            MergeState::Done => "DONE",
            MergeState::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{name}")
    }
}

impl MergeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MergeState::Done | MergeState::InternalError)
    }
}

/// A state snapshot paired with the size of a requested merged block, or -1
/// when that block is not fetchable yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeStatus {
    pub state: MergeState,
    pub size: i64,
}

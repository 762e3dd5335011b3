// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use std::collections::BTreeSet;

use tokio::sync::mpsc;

use crate::block::{BlockId, PartitionUid};

/// Request to merge one partition's expected block set.
#[derive(Clone, Debug)]
pub struct MergeEvent {
    pub uid: PartitionUid,
    pub expected_blocks: BTreeSet<BlockId>,
}

/// Accepts merge events for background execution. A refusal is final: the
/// partition that submitted the event moves to the error state.
pub trait MergeEventHandler: Send + Sync + 'static {
    fn handle(&self, event: MergeEvent) -> bool;
}

/// Dispatches events onto a bounded worker queue without blocking the
/// trigger path; a full or closed queue refuses the event.
pub struct QueuedMergeEventHandler {
    tx: mpsc::Sender<MergeEvent>,
}

impl QueuedMergeEventHandler {
    pub fn new(tx: mpsc::Sender<MergeEvent>) -> Self {
        Self { tx }
    }
}

impl MergeEventHandler for QueuedMergeEventHandler {
    fn handle(&self, event: MergeEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(partition_id: u32) -> MergeEvent {
        MergeEvent {
            uid: PartitionUid::new("app", 0, partition_id),
            expected_blocks: BTreeSet::from([1]),
        }
    }

    #[tokio::test]
    async fn test_full_queue_refuses() {
        let (tx, mut rx) = mpsc::channel(1);
        let handler = QueuedMergeEventHandler::new(tx);
        assert!(handler.handle(event(0)));
        assert!(!handler.handle(event(1)));

        rx.recv().await.unwrap();
        assert!(handler.handle(event(2)));
    }

    #[tokio::test]
    async fn test_closed_queue_refuses() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handler = QueuedMergeEventHandler::new(tx);
        assert!(!handler.handle(event(0)));
    }
}

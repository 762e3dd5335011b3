// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::event::{MergeEvent, MergeEventHandler, QueuedMergeEventHandler};
use super::partition::{DataResult, Partition};
use super::state::MergeStatus;
use crate::block::{BlockId, PartitionUid};
use crate::codec::{KeyComparator, RecordCodec};
use crate::error::{MergeError, MergeResult};
use crate::options::MergeOptions;
use crate::server::ServerEnv;

/// Shared context of one registered shuffle; partitions are created lazily
/// on first touch.
pub struct Shuffle {
    app_id: String,
    shuffle_id: u32,
    comparator: Arc<dyn KeyComparator>,
    codec: Arc<dyn RecordCodec>,
    options: Arc<MergeOptions>,
    env: Arc<ServerEnv>,
    event_handler: Arc<dyn MergeEventHandler>,
    partitions: RwLock<HashMap<u32, Arc<Partition>>>,
}

impl Shuffle {
    fn partition(&self, partition_id: u32) -> Arc<Partition> {
        if let Some(partition) = self.partitions.read().get(&partition_id) {
            return partition.clone();
        }
        let mut partitions = self.partitions.write();
        partitions
            .entry(partition_id)
            .or_insert_with(|| {
                Arc::new(Partition::new(
                    PartitionUid::new(self.app_id.clone(), self.shuffle_id, partition_id),
                    self.comparator.clone(),
                    self.codec.clone(),
                    self.options.clone(),
                    self.env.clone(),
                    self.event_handler.clone(),
                ))
            })
            .clone()
    }
}

/// Owns every registered shuffle and the worker pool that executes merge
/// events. All public entry points are keyed by (app, shuffle, partition)
/// and routed to the partition.
pub struct ShuffleMergeManager {
    options: Arc<MergeOptions>,
    env: Arc<ServerEnv>,
    event_handler: Arc<dyn MergeEventHandler>,
    shuffles: RwLock<HashMap<String, HashMap<u32, Arc<Shuffle>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ShuffleMergeManager {
    /// Build the manager and spawn its merge workers.
    pub fn new(options: MergeOptions, env: ServerEnv) -> Arc<Self> {
        let options = Arc::new(options);
        let (tx, rx) = mpsc::channel(options.event_queue_capacity);
        let manager = Arc::new(Self {
            options: options.clone(),
            env: Arc::new(env),
            event_handler: Arc::new(QueuedMergeEventHandler::new(tx)),
            shuffles: RwLock::new(HashMap::new()),
            workers: Mutex::new(vec![]),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = manager.workers.lock();
        for _ in 0..options.worker_threads {
            let rx = rx.clone();
            let manager = Arc::downgrade(&manager);
            workers.push(tokio::spawn(worker_loop(manager, rx)));
        }
        drop(workers);
        manager
    }

    /// Register comparator and codec for one shuffle; idempotent.
    pub fn register_shuffle(
        &self,
        app_id: impl Into<String>,
        shuffle_id: u32,
        comparator: Arc<dyn KeyComparator>,
        codec: Arc<dyn RecordCodec>,
    ) {
        let app_id = app_id.into();
        let mut shuffles = self.shuffles.write();
        let app_shuffles = shuffles.entry(app_id.clone()).or_default();
        if app_shuffles.contains_key(&shuffle_id) {
            return;
        }
        info!("registered shuffle {} of app {}", shuffle_id, app_id);
        app_shuffles.insert(
            shuffle_id,
            Arc::new(Shuffle {
                app_id,
                shuffle_id,
                comparator,
                codec,
                options: self.options.clone(),
                env: self.env.clone(),
                event_handler: self.event_handler.clone(),
                partitions: RwLock::new(HashMap::new()),
            }),
        );
    }

    fn shuffle(&self, app_id: &str, shuffle_id: u32) -> MergeResult<Arc<Shuffle>> {
        self.shuffles
            .read()
            .get(app_id)
            .and_then(|shuffles| shuffles.get(&shuffle_id))
            .cloned()
            .ok_or_else(|| MergeError::ShuffleNotRegistered(app_id.to_string(), shuffle_id))
    }

    /// Trigger the merge of one partition's expected block set.
    pub fn start_sort_merge(
        &self,
        uid: &PartitionUid,
        expected_blocks: BTreeSet<BlockId>,
    ) -> MergeResult<()> {
        let shuffle = self.shuffle(&uid.app_id, uid.shuffle_id)?;
        shuffle.partition(uid.partition_id).start_sort_merge(expected_blocks);
        Ok(())
    }

    /// Probe the merge state and the size of one merged block.
    pub fn try_get_block(&self, uid: &PartitionUid, block_id: BlockId) -> MergeResult<MergeStatus> {
        let shuffle = self.shuffle(&uid.app_id, uid.shuffle_id)?;
        Ok(shuffle.partition(uid.partition_id).try_get_block(block_id))
    }

    /// Fetch one merged block's payload.
    pub async fn get_data(&self, uid: &PartitionUid, block_id: BlockId) -> MergeResult<DataResult> {
        let shuffle = self.shuffle(&uid.app_id, uid.shuffle_id)?;
        let partition = shuffle.partition(uid.partition_id);
        partition.get_data(block_id).await
    }

    /// Tear down every shuffle of an application: cancel in-flight
    /// admission waits and drop cached metadata.
    pub async fn cleanup_app(&self, app_id: &str) {
        let Some(shuffles) = self.shuffles.write().remove(app_id) else {
            return;
        };
        info!("cleaning up {} shuffles of app {}", shuffles.len(), app_id);
        for shuffle in shuffles.values() {
            let partitions = shuffle.partitions.read().values().cloned().collect::<Vec<_>>();
            for partition in partitions {
                partition.cleanup().await;
            }
        }
    }

    /// Stop the merge workers; in-flight merges are abandoned.
    pub fn shutdown(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    async fn process_event(&self, event: MergeEvent) {
        match self.shuffle(&event.uid.app_id, event.uid.shuffle_id) {
            Ok(shuffle) => {
                let partition = shuffle.partition(event.uid.partition_id);
                partition.run_merge(&event.expected_blocks).await;
            }
            Err(e) => warn!("dropping merge event for {}: {}", event.uid, e),
        }
    }
}

async fn worker_loop(
    manager: Weak<ShuffleMergeManager>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MergeEvent>>>,
) {
    loop {
        let event = { rx.lock().await.recv().await };
        let Some(event) = event else {
            break;
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.process_event(event).await;
    }
}

// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use tracing::info;

/// Options for the merge engine.
#[derive(Clone, Debug)]
pub struct MergeOptions {
    /// Requested per-stream ring capacity for the block-flush file reader.
    /// The effective capacity is [`normalized_ring_capacity`] of this value.
    pub ring_buffer_size: usize,
    /// Initial sleep when memory admission refuses a merged block.
    pub cache_merged_block_init_sleep_ms: u64,
    /// Upper bound of the admission backoff; the sleep doubles until it
    /// reaches this cap and resets on the next successful emit.
    pub cache_merged_block_max_sleep_ms: u64,
    /// Target size of each emitted merged block. The final block of a
    /// partition may be shorter.
    pub merged_block_size: usize,
    /// Prefer the positioned-read file backend over seek-under-lock.
    pub direct: bool,
    /// Number of background merge workers draining the event queue.
    pub worker_threads: usize,
    /// Capacity of the bounded merge event queue; a full queue refuses
    /// further triggers.
    pub event_queue_capacity: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            ring_buffer_size: 4,
            cache_merged_block_init_sleep_ms: 100,
            cache_merged_block_max_sleep_ms: 2000,
            merged_block_size: 16 << 20,
            direct: true,
            worker_threads: 2,
            event_queue_capacity: 1024,
        }
    }
}

impl MergeOptions {
    pub fn default_for_test() -> Self {
        Self {
            merged_block_size: 4096,
            cache_merged_block_init_sleep_ms: 10,
            cache_merged_block_max_sleep_ms: 80,
            worker_threads: 2,
            event_queue_capacity: 16,
            ..Default::default()
        }
    }

    /// Effective per-stream ring capacity.
    pub fn ring_buffer_capacity(&self) -> usize {
        normalized_ring_capacity(self.ring_buffer_size)
    }
}

/// Normalize a requested ring capacity: clamp to [2, 32], then round up to
/// the next power of two. Requests of 2 and 32 are kept as-is; anything the
/// user asked for in between lands on 4, 8, 16 or 32. The adjustment is
/// logged so an operator can see the capacity actually in effect.
pub fn normalized_ring_capacity(requested: usize) -> usize {
    let capacity = requested.clamp(2, 32).next_power_of_two();
    if capacity != requested {
        info!(
            "ring buffer size adjusted from {} to {}",
            requested, capacity
        );
    }
    capacity
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_ring_capacity() {
        let cases = [
            (0, 2),
            (1, 2),
            (2, 2),
            (3, 4),
            (4, 4),
            (5, 8),
            (31, 32),
            (32, 32),
            (33, 32),
            (100, 32),
        ];
        for (requested, expected) in cases {
            assert_eq!(normalized_ring_capacity(requested), expected);
        }
    }

    #[test]
    fn test_capacity_is_power_of_two() {
        for requested in 0..64 {
            let capacity = normalized_ring_capacity(requested);
            assert!(capacity.is_power_of_two());
            assert!((2..=32).contains(&capacity));
        }
    }
}

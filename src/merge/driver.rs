// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

use std::cmp::Ordering;
use std::sync::Arc;

use bytes::BytesMut;

use super::result::MergedOutput;
use super::segment::StreamedSegment;
use crate::codec::{KeyComparator, RecordCodec};
use crate::error::MergeResult;

/// k-way merge of the segments into `output`.
///
/// Segments must already be initialized and, for file-backed ones, the
/// flush reader started; this primes each segment's first record, then
/// drains the min-heap, writing records through the codec. Equal keys are
/// emitted in segment insertion order, so the merge is a stable permutation
/// of its inputs. On success the output's tail block is flushed.
pub async fn merge_segments(
    segments: &mut [StreamedSegment],
    comparator: &Arc<dyn KeyComparator>,
    codec: &Arc<dyn RecordCodec>,
    output: &mut MergedOutput,
) -> MergeResult<()> {
    let mut queue = MergeQueue {
        raw: comparator.is_raw(),
        comparator: comparator.as_ref(),
        segments,
        heap: vec![],
    };

    for idx in 0..queue.segments.len() {
        if queue.segments[idx].next().await? {
            queue.push(idx);
        }
    }

    let mut scratch = BytesMut::new();
    while let Some(&top) = queue.heap.first() {
        scratch.clear();
        {
            let record = queue.segments[top].current().unwrap();
            codec.write_record(&mut scratch, record);
        }
        output.write(&scratch).await?;
        if queue.segments[top].next().await? {
            // the replaced root usually sinks only a little; cheaper than
            // a pop followed by a push
            queue.sift_down(0);
        } else {
            queue.pop_top();
        }
    }

    output.finish().await
}

/// Min-heap of segment indices ordered by each segment's current key.
///
/// The compare logic is dynamic (user comparator plus insertion-order
/// tie-break), so the heap is hand-rolled over a plain vector.
struct MergeQueue<'a> {
    segments: &'a mut [StreamedSegment],
    heap: Vec<usize>,
    comparator: &'a dyn KeyComparator,
    raw: bool,
}

impl MergeQueue<'_> {
    fn compare_segments(&self, left: usize, right: usize) -> Ordering {
        let lhs = &self.segments[left].current().unwrap().key;
        let rhs = &self.segments[right].current().unwrap().key;
        let ord = if self.raw {
            lhs.cmp(rhs)
        } else {
            self.comparator.compare(lhs, rhs)
        };
        // equal keys drain in insertion order
        ord.then(left.cmp(&right))
    }

    fn compare_in_heap(&self, left: usize, right: usize) -> Ordering {
        self.compare_segments(self.heap[left], self.heap[right])
    }

    fn push(&mut self, segment_idx: usize) {
        self.heap.push(segment_idx);
        let mut child = self.heap.len() - 1;
        while child > 0 {
            // parent = (child - 1) / 2
            let parent = (child - 1) / 2;
            if self.compare_in_heap(parent, child) == Ordering::Greater {
                self.heap.swap(parent, child);
                child = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut parent: usize) {
        loop {
            let left = parent * 2 + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < self.heap.len() && self.compare_in_heap(left, right) == Ordering::Greater {
                child = right;
            }
            if self.compare_in_heap(parent, child) != Ordering::Greater {
                break;
            }
            self.heap.swap(parent, child);
            parent = child;
        }
    }

    fn pop_top(&mut self) {
        let last = self.heap.pop().unwrap();
        if !self.heap.is_empty() {
            self.heap[0] = last;
            self.sift_down(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::block::BlockId;
    use crate::codec::{BytewiseComparator, LengthPrefixedCodec, Record, SerInput};
    use crate::error::MergeError;
    use crate::merge::result::{MergedBlockSink, MergedResult};
    use async_trait::async_trait;

    #[derive(Default)]
    struct CollectingSink {
        blocks: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl MergedBlockSink for CollectingSink {
        async fn emit(&self, data: Bytes, _block_id: BlockId, _length: usize) -> MergeResult<()> {
            self.blocks.lock().push(data);
            Ok(())
        }
    }

    fn segment(block_id: BlockId, records: &[(&[u8], &[u8])]) -> StreamedSegment {
        let codec = LengthPrefixedCodec;
        let mut buf = BytesMut::new();
        for (key, value) in records {
            codec.write_record(
                &mut buf,
                &Record {
                    key: Bytes::copy_from_slice(key),
                    value: Bytes::copy_from_slice(value),
                },
            );
        }
        StreamedSegment::from_memory(block_id, buf.freeze(), Arc::new(LengthPrefixedCodec))
    }

    async fn decode_merged(sink: &CollectingSink) -> Vec<(Bytes, Bytes)> {
        let mut all = BytesMut::new();
        for block in sink.blocks.lock().iter() {
            all.extend_from_slice(block);
        }
        let codec = LengthPrefixedCodec;
        let mut input = SerInput::memory(all.freeze());
        let mut records = vec![];
        while let Some(r) = codec.read_record(&mut input).await.unwrap() {
            records.push((r.key, r.value));
        }
        records
    }

    async fn run_merge(
        mut segments: Vec<StreamedSegment>,
        comparator: Arc<dyn KeyComparator>,
    ) -> (Arc<MergedResult>, Arc<CollectingSink>) {
        let codec: Arc<dyn RecordCodec> = Arc::new(LengthPrefixedCodec);
        let result = Arc::new(MergedResult::new(64));
        let sink = Arc::new(CollectingSink::default());
        let mut output = result.open(0, sink.clone());
        merge_segments(&mut segments, &comparator, &codec, &mut output)
            .await
            .unwrap();
        (result, sink)
    }

    #[tokio::test]
    async fn test_merge_orders_across_segments() {
        let segments = vec![
            segment(1, &[(b"b", b"s1"), (b"d", b"s1")]),
            segment(2, &[(b"a", b"s2"), (b"c", b"s2"), (b"e", b"s2")]),
            segment(3, &[]),
        ];
        let (_, sink) = run_merge(segments, Arc::new(BytewiseComparator)).await;

        let keys = decode_merged(&sink)
            .await
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_equal_keys_are_stable() {
        let segments = vec![
            segment(1, &[(b"k", b"first"), (b"k", b"second")]),
            segment(2, &[(b"k", b"third")]),
        ];
        let (_, sink) = run_merge(segments, Arc::new(BytewiseComparator)).await;

        let values = decode_merged(&sink)
            .await
            .into_iter()
            .map(|(_, v)| v)
            .collect::<Vec<_>>();
        assert_eq!(values, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_custom_comparator_order() {
        struct ReverseComparator;
        impl KeyComparator for ReverseComparator {
            fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
                right.cmp(left)
            }
        }

        let segments = vec![
            segment(1, &[(b"c", b""), (b"a", b"")]),
            segment(2, &[(b"b", b"")]),
        ];
        let (_, sink) = run_merge(segments, Arc::new(ReverseComparator)).await;

        let keys = decode_merged(&sink)
            .await
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_write_failure_aborts_merge() {
        struct FailingSink;
        #[async_trait]
        impl MergedBlockSink for FailingSink {
            async fn emit(&self, _: Bytes, block_id: BlockId, _: usize) -> MergeResult<()> {
                Err(MergeError::CacheFailed(
                    block_id,
                    crate::server::CacheStatus::NoBuffer,
                ))
            }
        }

        let mut segments = vec![segment(1, &[(b"a", b"xxxxxxxxxxxxxxxx")])];
        let codec: Arc<dyn RecordCodec> = Arc::new(LengthPrefixedCodec);
        let comparator: Arc<dyn KeyComparator> = Arc::new(BytewiseComparator);
        let result = Arc::new(MergedResult::new(8));
        let mut output = result.open(0, Arc::new(FailingSink));
        let err = merge_segments(&mut segments, &comparator, &codec, &mut output)
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::CacheFailed(0, _)));
    }
}

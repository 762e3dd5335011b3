// Copyright 2025 ShuffleLight Project Authors. Licensed under Apache-2.0.

//! User-supplied key ordering and record codec.
//!
//! The engine treats keys and values as opaque bytes. All it needs is to
//! compare two keys in wire form, read a record from a byte source, and
//! write a record to a byte sink.

use std::cmp::Ordering;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{MergeError, MergeResult};
use crate::merge::BlockInputStream;

/// One (key, value) pair in wire form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

/// Orders serialized keys.
pub trait KeyComparator: Send + Sync + 'static {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;

    /// True when serialized byte order equals logical key order, which lets
    /// the merge compare keys with a plain byte comparison.
    fn is_raw(&self) -> bool {
        false
    }
}

/// Orders keys by their raw bytes.
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }

    fn is_raw(&self) -> bool {
        true
    }
}

/// Reads and writes records in wire form.
#[async_trait]
pub trait RecordCodec: Send + Sync + 'static {
    /// Decode the next record, or `None` at a clean end of input.
    async fn read_record(&self, input: &mut SerInput) -> MergeResult<Option<Record>>;

    /// Append one record to `out`.
    fn write_record(&self, out: &mut BytesMut, record: &Record);
}

/// `key_len | key | value_len | value`, lengths big-endian u32.
pub struct LengthPrefixedCodec;

#[async_trait]
impl RecordCodec for LengthPrefixedCodec {
    async fn read_record(&self, input: &mut SerInput) -> MergeResult<Option<Record>> {
        if input.remaining() == 0 {
            return Ok(None);
        }
        let key_len = input.read_u32().await? as usize;
        let key = input.read_bytes(key_len).await?;
        let value_len = input.read_u32().await? as usize;
        let value = input.read_bytes(value_len).await?;
        Ok(Some(Record { key, value }))
    }

    fn write_record(&self, out: &mut BytesMut, record: &Record) {
        out.put_u32(record.key.len() as u32);
        out.extend_from_slice(&record.key);
        out.put_u32(record.value.len() as u32);
        out.extend_from_slice(&record.value);
    }
}

/// Byte source feeding a record codec: a resident buffer or a lazy stream
/// over the block-flush file.
pub enum SerInput {
    Memory(Bytes),
    Stream(StreamInput),
}

impl SerInput {
    pub fn memory(data: Bytes) -> Self {
        SerInput::Memory(data)
    }

    pub fn stream(stream: BlockInputStream) -> Self {
        let remaining = stream.available();
        SerInput::Stream(StreamInput {
            stream,
            current: Bytes::new(),
            remaining,
        })
    }

    /// Unread bytes left in this input.
    pub fn remaining(&self) -> usize {
        match self {
            SerInput::Memory(data) => data.len(),
            SerInput::Stream(input) => input.remaining,
        }
    }

    /// Allocate streaming resources. For flush-file inputs this claims the
    /// per-stream ring, which must happen before the reader starts.
    pub fn init(&mut self) -> MergeResult<()> {
        match self {
            SerInput::Memory(_) => Ok(()),
            SerInput::Stream(input) => input.stream.init(),
        }
    }

    pub async fn read_u32(&mut self) -> MergeResult<u32> {
        let bytes = self.read_bytes(4).await?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes);
        Ok(u32::from_be_bytes(buf))
    }

    pub async fn read_bytes(&mut self, len: usize) -> MergeResult<Bytes> {
        match self {
            SerInput::Memory(data) => {
                if data.len() < len {
                    return Err(MergeError::decode("unexpected end of block data"));
                }
                Ok(data.split_to(len))
            }
            SerInput::Stream(input) => input.read_bytes(len).await,
        }
    }

    /// Release buffers and, for flush-file inputs, the ring slots.
    pub fn close(&mut self) {
        match self {
            SerInput::Memory(data) => *data = Bytes::new(),
            SerInput::Stream(input) => input.stream.close(),
        }
    }
}

/// Chunk-buffered reads over one [`BlockInputStream`].
pub struct StreamInput {
    stream: BlockInputStream,
    /// Unconsumed part of the chunk fetched last.
    current: Bytes,
    remaining: usize,
}

impl StreamInput {
    async fn read_bytes(&mut self, len: usize) -> MergeResult<Bytes> {
        if self.remaining < len {
            return Err(MergeError::decode("unexpected end of block stream"));
        }
        // fast path: the current chunk already covers the request
        if self.current.len() >= len {
            self.remaining -= len;
            return Ok(self.current.split_to(len));
        }
        let mut out = BytesMut::with_capacity(len);
        while out.len() < len {
            if self.current.is_empty() {
                self.current = match self.stream.next_chunk().await? {
                    Some(chunk) => chunk,
                    None => return Err(MergeError::decode("block stream ended early")),
                };
            }
            let take = (len - out.len()).min(self.current.len());
            out.extend_from_slice(&self.current.split_to(take));
        }
        self.remaining -= len;
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &[u8], value: &[u8]) -> Record {
        Record {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        }
    }

    #[tokio::test]
    async fn test_length_prefixed_round_trip() {
        let codec = LengthPrefixedCodec;
        let records = vec![record(b"a", b"1"), record(b"bb", b""), record(b"", b"22")];

        let mut encoded = BytesMut::new();
        for r in &records {
            codec.write_record(&mut encoded, r);
        }

        let mut input = SerInput::memory(encoded.freeze());
        let mut decoded = vec![];
        while let Some(r) = codec.read_record(&mut input).await.unwrap() {
            decoded.push(r);
        }
        assert_eq!(decoded, records);
    }

    #[tokio::test]
    async fn test_truncated_record_fails() {
        let codec = LengthPrefixedCodec;
        let mut encoded = BytesMut::new();
        codec.write_record(&mut encoded, &record(b"key", b"value"));
        let mut truncated = encoded.freeze();
        truncated.truncate(truncated.len() - 2);

        let mut input = SerInput::memory(truncated);
        let err = codec.read_record(&mut input).await.unwrap_err();
        assert!(matches!(err, MergeError::Decode(_)));
    }

    #[test]
    fn test_bytewise_comparator_is_raw() {
        let comparator = BytewiseComparator;
        assert!(comparator.is_raw());
        assert_eq!(comparator.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(comparator.compare(b"b", b"ab"), Ordering::Greater);
        assert_eq!(comparator.compare(b"ab", b"ab"), Ordering::Equal);
    }
}

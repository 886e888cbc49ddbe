//! Multi-reader ring buffer for captured keyword audio
//!
//! One writer (the capture loop) appends raw PCM bytes; any number of
//! readers consume independently. Each listener that detected can register a
//! keyword window so second-stage consumers know where its keyword sits in
//! the linear stream written since the last reset.

use crate::session::ListenerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Invalid buffer size: {0}")]
    InvalidSize(usize),
}

/// Keyword location for one listener, in bytes relative to the buffer's
/// logical start. Offsets may exceed the physical capacity; readers wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeywordWindow {
    pub start_index: usize,
    pub end_index: usize,
    pub pre_roll: usize,
}

type ReaderId = u64;

#[derive(Debug, Default)]
struct ReaderState {
    read_offset: usize,
    unread: usize,
}

struct RingInner {
    data: Vec<u8>,
    write_offset: usize,
    total_written: u64,
    readers: HashMap<ReaderId, ReaderState>,
    windows: HashMap<ListenerId, KeywordWindow>,
    next_reader: ReaderId,
}

impl RingInner {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn reset(&mut self) {
        self.write_offset = 0;
        self.total_written = 0;
        for reader in self.readers.values_mut() {
            *reader = ReaderState::default();
        }
        self.windows.clear();
    }
}

/// Fixed-capacity byte ring with independent read cursors
pub struct RingBuffer {
    inner: Mutex<RingInner>,
}

impl RingBuffer {
    /// Create a ring buffer holding `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity == 0 {
            return Err(RingBufferError::InvalidSize(capacity));
        }

        debug!("Creating ring buffer with capacity: {} bytes", capacity);

        Ok(Self {
            inner: Mutex::new(RingInner {
                data: vec![0; capacity],
                write_offset: 0,
                total_written: 0,
                readers: HashMap::new(),
                windows: HashMap::new(),
                next_reader: 0,
            }),
        })
    }

    /// Register a new reader positioned at the current write offset
    pub fn new_reader(self: &Arc<Self>) -> RingBufferReader {
        let mut inner = self.inner.lock();
        let id = inner.next_reader;
        inner.next_reader += 1;
        let write_offset = inner.write_offset;
        inner.readers.insert(
            id,
            ReaderState {
                read_offset: write_offset,
                unread: 0,
            },
        );

        RingBufferReader {
            ring: Arc::clone(self),
            id,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers.len()
    }

    /// Total bytes written since the last reset
    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().total_written
    }

    /// Write bytes, wrapping at capacity.
    ///
    /// Readers that fall more than one capacity behind lose their oldest
    /// unread bytes; their unread count never exceeds capacity.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let capacity = inner.capacity();

        // Only the trailing `capacity` bytes can survive the write
        let skip = bytes.len().saturating_sub(capacity);
        let mut offset = (inner.write_offset + skip) % capacity;
        let mut remaining = &bytes[skip..];
        while !remaining.is_empty() {
            let chunk = remaining.len().min(capacity - offset);
            inner.data[offset..offset + chunk].copy_from_slice(&remaining[..chunk]);
            offset = (offset + chunk) % capacity;
            remaining = &remaining[chunk..];
        }

        inner.write_offset = offset;
        inner.total_written += bytes.len() as u64;

        let mut overrun = false;
        for reader in inner.readers.values_mut() {
            let unread = reader.unread + bytes.len();
            if unread > capacity {
                reader.unread = capacity;
                reader.read_offset = offset;
                overrun = true;
            } else {
                reader.unread = unread;
            }
        }

        if overrun {
            warn!("Ring buffer overrun, oldest unread bytes dropped");
        }
        trace!("Wrote {} bytes to ring buffer", bytes.len());

        bytes.len()
    }

    /// Space left before the slowest reader starts losing data
    pub fn free_size(&self) -> usize {
        let inner = self.inner.lock();
        let max_unread = inner.readers.values().map(|r| r.unread).max().unwrap_or(0);
        inner.capacity() - max_unread
    }

    /// Discard all data, rewind every reader and forget keyword windows
    pub fn reset(&self) {
        self.inner.lock().reset();
        debug!("Ring buffer reset");
    }

    /// Change capacity; contents are discarded
    pub fn resize(&self, capacity: usize) -> Result<(), RingBufferError> {
        if capacity == 0 {
            return Err(RingBufferError::InvalidSize(capacity));
        }

        let mut inner = self.inner.lock();
        debug!(
            "Resize ring buffer, old size: {} to new size: {}",
            inner.capacity(),
            capacity
        );
        inner.data = vec![0; capacity];
        inner.reset();
        Ok(())
    }

    /// Register the keyword window for `listener`
    pub fn update_kwd_config(
        &self,
        listener: ListenerId,
        start_index: usize,
        end_index: usize,
        pre_roll: usize,
    ) {
        debug!(
            "Keyword window for listener {}: [{}, {}) pre-roll {}",
            listener, start_index, end_index, pre_roll
        );
        self.inner.lock().windows.insert(
            listener,
            KeywordWindow {
                start_index,
                end_index,
                pre_roll,
            },
        );
    }

    /// Keyword window registered for `listener`
    pub fn indices(&self, listener: ListenerId) -> Option<KeywordWindow> {
        self.inner.lock().windows.get(&listener).copied()
    }

    fn with_reader<T>(&self, id: ReaderId, f: impl FnOnce(&mut RingInner, ReaderId) -> T) -> T {
        let mut inner = self.inner.lock();
        f(&mut inner, id)
    }
}

/// Independent read cursor over a [`RingBuffer`]. Deregisters on drop.
pub struct RingBufferReader {
    ring: Arc<RingBuffer>,
    id: ReaderId,
}

impl RingBufferReader {
    /// Copy up to `out.len()` unread bytes, returning how many were read
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.ring.with_reader(self.id, |inner, id| {
            let capacity = inner.capacity();
            let Some(state) = inner.readers.get(&id) else {
                return 0;
            };
            let to_read = out.len().min(state.unread);
            let mut offset = state.read_offset;
            let mut copied = 0;
            while copied < to_read {
                let chunk = (to_read - copied).min(capacity - offset);
                out[copied..copied + chunk].copy_from_slice(&inner.data[offset..offset + chunk]);
                copied += chunk;
                offset = (offset + chunk) % capacity;
            }

            if let Some(state) = inner.readers.get_mut(&id) {
                state.read_offset = offset;
                state.unread -= to_read;
            }
            to_read
        })
    }

    /// Unread bytes available to this reader (never above capacity)
    pub fn unread_size(&self) -> usize {
        self.ring
            .with_reader(self.id, |inner, id| inner.readers.get(&id).map_or(0, |r| r.unread))
    }

    /// Position the reader at a linear offset from the buffer's logical
    /// start. Offsets older than one capacity are clamped to the oldest
    /// byte still held.
    pub fn seek(&self, linear_offset: u64) {
        self.ring.with_reader(self.id, |inner, id| {
            let capacity = inner.capacity();
            let total = inner.total_written;
            let unread = total.saturating_sub(linear_offset).min(capacity as u64) as usize;
            let read_offset = ((total - unread as u64) % capacity as u64) as usize;
            if let Some(state) = inner.readers.get_mut(&id) {
                state.unread = unread;
                state.read_offset = read_offset;
            }
        });
    }

    /// Skip up to `bytes` unread bytes
    pub fn advance(&self, bytes: usize) -> usize {
        self.ring.with_reader(self.id, |inner, id| {
            let capacity = inner.capacity();
            match inner.readers.get_mut(&id) {
                Some(state) => {
                    let skipped = bytes.min(state.unread);
                    state.unread -= skipped;
                    state.read_offset = (state.read_offset + skipped) % capacity;
                    skipped
                }
                None => 0,
            }
        })
    }

    /// Drop all unread bytes and park the cursor at the current write offset
    pub fn reset(&self) {
        self.ring.with_reader(self.id, |inner, id| {
            let write_offset = inner.write_offset;
            if let Some(state) = inner.readers.get_mut(&id) {
                state.read_offset = write_offset;
                state.unread = 0;
            }
        });
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }
}

impl Drop for RingBufferReader {
    fn drop(&mut self) {
        self.ring.with_reader(self.id, |inner, id| {
            inner.readers.remove(&id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> Arc<RingBuffer> {
        Arc::new(RingBuffer::new(capacity).unwrap())
    }

    fn ramp(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            RingBuffer::new(0).err(),
            Some(RingBufferError::InvalidSize(0))
        );
    }

    #[test]
    fn test_write_and_read_round_trip() {
        let buffer = ring(1000);
        let reader = buffer.new_reader();
        let data = ramp(1000);

        assert_eq!(buffer.write(&data), 1000);
        assert_eq!(reader.unread_size(), 1000);

        let mut out = vec![0u8; 1000];
        assert_eq!(reader.read(&mut out), 1000);
        assert_eq!(out, data);
        assert_eq!(reader.unread_size(), 0);
    }

    #[test]
    fn test_read_across_wrap() {
        let buffer = ring(10);
        let reader = buffer.new_reader();

        buffer.write(&[1, 2, 3, 4, 5, 6, 7]);
        let mut out = [0u8; 7];
        reader.read(&mut out);

        buffer.write(&[8, 9, 10, 11, 12]);
        let mut out = [0u8; 5];
        assert_eq!(reader.read(&mut out), 5);
        assert_eq!(out, [8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_overflow_keeps_newest_bytes() {
        let buffer = ring(10);
        let reader = buffer.new_reader();

        buffer.write(&[1; 10]);
        buffer.write(&[2; 5]);

        // Never more than capacity available
        assert_eq!(reader.unread_size(), 10);

        let mut out = [0u8; 10];
        reader.read(&mut out);
        assert_eq!(&out[..5], &[1; 5]);
        assert_eq!(&out[5..], &[2; 5]);
    }

    #[test]
    fn test_single_write_larger_than_capacity() {
        let buffer = ring(8);
        let reader = buffer.new_reader();
        let data = ramp(20);

        buffer.write(&data);
        assert_eq!(reader.unread_size(), 8);
        assert_eq!(buffer.bytes_written(), 20);

        let mut out = [0u8; 8];
        reader.read(&mut out);
        assert_eq!(&out[..], &data[12..]);
    }

    #[test]
    fn test_readers_are_independent() {
        let buffer = ring(100);
        let fast = buffer.new_reader();
        let slow = buffer.new_reader();

        buffer.write(&ramp(60));

        let mut out = [0u8; 60];
        assert_eq!(fast.read(&mut out), 60);
        assert_eq!(fast.unread_size(), 0);
        assert_eq!(slow.unread_size(), 60);

        // Free size is bounded by the slowest reader
        assert_eq!(buffer.free_size(), 40);
    }

    #[test]
    fn test_free_size_without_readers() {
        let buffer = ring(64);
        buffer.write(&[0; 32]);
        assert_eq!(buffer.free_size(), 64);
    }

    #[test]
    fn test_reader_drop_deregisters() {
        let buffer = ring(64);
        {
            let _reader = buffer.new_reader();
            assert_eq!(buffer.reader_count(), 1);
        }
        assert_eq!(buffer.reader_count(), 0);
    }

    #[test]
    fn test_reset_rewinds_readers_and_windows() {
        let buffer = ring(64);
        let reader = buffer.new_reader();
        buffer.write(&[7; 32]);
        buffer.update_kwd_config(1, 0, 16, 8);

        buffer.reset();

        assert_eq!(reader.unread_size(), 0);
        assert_eq!(buffer.bytes_written(), 0);
        assert!(buffer.indices(1).is_none());
    }

    #[test]
    fn test_resize() {
        let buffer = ring(16);
        let reader = buffer.new_reader();
        buffer.write(&[1; 16]);

        buffer.resize(32).unwrap();
        assert_eq!(buffer.capacity(), 32);
        assert_eq!(reader.unread_size(), 0);
        assert!(buffer.resize(0).is_err());
    }

    #[test]
    fn test_keyword_windows() {
        let buffer = ring(64);
        buffer.update_kwd_config(3, 1000, 4000, 500);

        let window = buffer.indices(3).unwrap();
        assert_eq!(window.start_index, 1000);
        assert_eq!(window.end_index, 4000);
        assert_eq!(window.pre_roll, 500);
        assert!(buffer.indices(4).is_none());
    }

    #[test]
    fn test_seek_to_linear_offset() {
        let buffer = ring(10);
        let reader = buffer.new_reader();
        let data = ramp(25);
        buffer.write(&data);

        // Offset 20 is still held: 5 bytes left
        reader.seek(20);
        assert_eq!(reader.unread_size(), 5);
        let mut out = [0u8; 5];
        reader.read(&mut out);
        assert_eq!(&out[..], &data[20..]);

        // Offset 2 has been overwritten: clamp to the oldest held byte
        reader.seek(2);
        assert_eq!(reader.unread_size(), 10);
        let mut out = [0u8; 10];
        reader.read(&mut out);
        assert_eq!(&out[..], &data[15..]);
    }

    #[test]
    fn test_reader_reset_follows_write_offset() {
        let buffer = ring(8);
        let reader = buffer.new_reader();
        buffer.write(&[1, 2, 3, 4, 5]);

        reader.reset();
        assert_eq!(reader.unread_size(), 0);

        buffer.write(&[9, 9]);
        let mut out = [0u8; 2];
        assert_eq!(reader.read(&mut out), 2);
        assert_eq!(out, [9, 9]);
    }

    #[test]
    fn test_advance() {
        let buffer = ring(32);
        let reader = buffer.new_reader();
        buffer.write(&ramp(10));

        assert_eq!(reader.advance(4), 4);
        let mut out = [0u8; 6];
        reader.read(&mut out);
        assert_eq!(out, [4, 5, 6, 7, 8, 9]);
        assert_eq!(reader.advance(4), 0);
    }
}

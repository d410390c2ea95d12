//! FIFO reslicing of variably sized buffers into fixed-size windows.
//!
//! Encoders, decoders and payloaders need input in exact frame sizes, while
//! upstream delivers buffers of whatever size it likes. An [`Adapter`] queues
//! incoming buffers and hands out byte-exact windows:
//!
//! ```text
//! push: [10 bytes][5 bytes][20 bytes]
//! peek(12):  [..........|..]              assembled in scratch (spans two buffers)
//! flush(12): skip = 2 into the 5-byte buffer
//! peek(20):               [...|.................]
//! ```
//!
//! Peeks that fit inside the head buffer return a slice into that buffer
//! without copying. Only peeks that cross buffer boundaries are assembled into
//! a scratch buffer.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::AdapterConfig;
use crate::{AdapterError, Buffer};

/// A FIFO of buffers exposing peek/flush of exact byte counts.
///
/// An adapter has a single owner; it is not meant to be shared between
/// threads without external locking.
///
/// # Example
///
/// ```
/// use stream_media::{Adapter, Buffer};
///
/// const FRAME: usize = 4;
///
/// let mut adapter = Adapter::new();
/// adapter.push(Buffer::from_vec(vec![1, 2, 3]));
/// adapter.push(Buffer::from_vec(vec![4, 5, 6, 7, 8, 9]));
///
/// let mut frames = Vec::new();
/// while adapter.available() >= FRAME {
///     frames.push(adapter.peek(FRAME).unwrap().to_vec());
///     adapter.flush(FRAME).unwrap();
/// }
///
/// assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
/// assert_eq!(adapter.available(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Adapter {
    buffers: VecDeque<Buffer>,
    /// Sum of the sizes of all queued buffers.
    queued: usize,
    /// Bytes of the head buffer already consumed.
    skip: usize,
    scratch: Vec<u8>,
    /// Valid bytes in `scratch`, 0 when nothing is assembled.
    assembled_len: usize,
    config: AdapterConfig,
    timestamp: Option<Duration>,
    distance: u64,
}

impl Adapter {
    /// Creates an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty adapter with the given configuration.
    pub fn with_config(config: AdapterConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Queues `buffer` after the buffers already queued.
    ///
    /// Zero-length buffers are accepted; they take a queue slot but add no bytes.
    pub fn push(&mut self, buffer: Buffer) {
        let size = buffer.size();
        if self.buffers.is_empty() {
            self.update_timestamp(&buffer);
        }
        self.queued += size;
        self.buffers.push_back(buffer);
        tracing::trace!(size, available = self.available(), "adapter push");
    }

    /// Number of bytes that can be peeked or flushed.
    pub fn available(&self) -> usize {
        self.queued - self.skip
    }

    /// Returns `true` if no bytes are queued.
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Largest size a single [`peek`](Adapter::peek) can return without copying.
    ///
    /// This is the already assembled length if there is one, otherwise the
    /// unread part of the first non-empty buffer.
    pub fn available_fast(&self) -> usize {
        if self.buffers.is_empty() {
            return 0;
        }
        if self.assembled_len > 0 {
            return self.assembled_len;
        }
        self.head_span().map_or(0, |(_, _, len)| len)
    }

    /// Returns the next `size` bytes without consuming them.
    ///
    /// The slice points into the head buffer when it holds all `size` bytes,
    /// and into a scratch buffer otherwise. It stays valid until the adapter
    /// is next modified.
    ///
    /// # Errors
    ///
    /// Returns `ZeroLength` if `size` is 0 and `NotEnoughData` if fewer than
    /// `size` bytes are queued. The adapter is left unchanged on error.
    pub fn peek(&mut self, size: usize) -> Result<&[u8], AdapterError> {
        self.check_request(size)?;

        if self.assembled_len >= size {
            return Ok(&self.scratch[..size]);
        }

        if self.head_holds(size) || self.try_merge_up(size) {
            if let Some((index, start, _)) = self.head_span() {
                return Ok(&self.buffers[index].as_slice()[start..start + size]);
            }
        }

        let capacity = self.config.scratch_capacity_for(size);
        if self.scratch.len() < capacity {
            tracing::debug!(
                from = self.scratch.len(),
                to = capacity,
                "adapter scratch buffer grown"
            );
            self.scratch.resize(capacity, 0);
        }

        tracing::trace!(size, "adapter assembling across buffers");
        copy_from_queue(&self.buffers, self.skip, 0, &mut self.scratch[..size]);
        self.assembled_len = size;
        Ok(&self.scratch[..size])
    }

    /// Discards the next `size` bytes.
    ///
    /// Fully consumed buffers are released; a partially consumed head buffer
    /// stays queued with its read position advanced.
    ///
    /// # Errors
    ///
    /// Returns `ZeroLength` if `size` is 0 and `NotEnoughData` if fewer than
    /// `size` bytes are queued.
    pub fn flush(&mut self, size: usize) -> Result<(), AdapterError> {
        self.check_request(size)?;
        self.assembled_len = 0;

        let mut remaining = size;
        while remaining > 0 {
            let Some(head) = self.buffers.front() else {
                break;
            };
            let head_size = head.size();
            let head_remaining = head_size - self.skip;

            if head_remaining <= remaining {
                remaining -= head_remaining;
                self.distance += head_remaining as u64;
                self.queued -= head_size;
                self.skip = 0;
                self.buffers.pop_front();
                if let Some(next) = self.buffers.front().cloned() {
                    self.update_timestamp(&next);
                }
            } else {
                self.skip += remaining;
                self.distance += remaining as u64;
                remaining = 0;
            }
        }

        tracing::trace!(size, available = self.available(), "adapter flush");
        Ok(())
    }

    /// Returns a copy of the next `size` bytes and consumes them.
    ///
    /// # Errors
    ///
    /// Same as [`peek`](Adapter::peek).
    pub fn take(&mut self, size: usize) -> Result<Vec<u8>, AdapterError> {
        let data = self.peek(size)?.to_vec();
        self.flush(size)?;
        Ok(data)
    }

    /// Returns the next `size` bytes as a buffer and consumes them.
    ///
    /// When the head buffer holds all `size` bytes the result shares its
    /// storage (the head itself, or a sub-buffer of it). Otherwise the bytes
    /// are copied into a new buffer.
    ///
    /// # Errors
    ///
    /// Same as [`peek`](Adapter::peek).
    pub fn take_buffer(&mut self, size: usize) -> Result<Buffer, AdapterError> {
        self.check_request(size)?;

        let shared = if self.head_holds(size) || self.try_merge_up(size) {
            match self.head_span() {
                Some((index, start, _)) => {
                    let head = &self.buffers[index];
                    if start == 0 && head.size() == size {
                        Some(head.clone())
                    } else {
                        Some(head.create_sub(start, size)?)
                    }
                }
                None => None,
            }
        } else {
            None
        };

        let buffer = match shared {
            Some(buffer) => buffer,
            None => Buffer::from_vec(self.peek(size)?.to_vec()),
        };
        self.flush(size)?;
        Ok(buffer)
    }

    /// Copies `dest.len()` bytes starting `offset` bytes past the read
    /// position into `dest`, without consuming anything.
    ///
    /// # Errors
    ///
    /// Returns `NotEnoughData` if the range reaches past the queued data.
    pub fn copy_into(&self, dest: &mut [u8], offset: usize) -> Result<(), AdapterError> {
        let available = self.available();
        let end = offset.checked_add(dest.len());
        if end.map_or(true, |end| end > available) {
            return Err(AdapterError::NotEnoughData {
                requested: offset.saturating_add(dest.len()),
                available,
            });
        }
        copy_from_queue(&self.buffers, self.skip, offset, dest);
        Ok(())
    }

    /// Scans `size` bytes starting at `offset` for a big-endian 32-bit word
    /// `w` with `w & mask == pattern`.
    ///
    /// Returns the offset of the first matching word, relative to the read
    /// position. The whole word must lie inside the scanned range.
    ///
    /// # Errors
    ///
    /// Returns `ZeroLength` if `size` is 0 and `NotEnoughData` if the range
    /// reaches past the queued data.
    pub fn masked_scan_u32(
        &self,
        mask: u32,
        pattern: u32,
        offset: usize,
        size: usize,
    ) -> Result<Option<usize>, AdapterError> {
        if size == 0 {
            return Err(AdapterError::ZeroLength);
        }
        let available = self.available();
        if offset.checked_add(size).map_or(true, |end| end > available) {
            return Err(AdapterError::NotEnoughData {
                requested: offset.saturating_add(size),
                available,
            });
        }
        if size < 4 {
            return Ok(None);
        }

        let mut state: u32 = !pattern;
        let bytes = self
            .buffers
            .iter()
            .flat_map(|buffer| buffer.as_slice().iter().copied())
            .skip(self.skip + offset)
            .take(size);
        for (index, byte) in bytes.enumerate() {
            state = (state << 8) | u32::from(byte);
            if index >= 3 && state & mask == pattern {
                return Ok(Some(offset + index - 3));
            }
        }
        Ok(None)
    }

    /// Timestamp of the most recent buffer carrying one at or before the read
    /// position, and the number of bytes read since that buffer started.
    pub fn prev_timestamp(&self) -> (Option<Duration>, u64) {
        (self.timestamp, self.distance)
    }

    /// Releases all queued buffers and resets the adapter.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.queued = 0;
        self.skip = 0;
        self.assembled_len = 0;
        self.timestamp = None;
        self.distance = 0;
    }

    fn check_request(&self, size: usize) -> Result<(), AdapterError> {
        if size == 0 {
            return Err(AdapterError::ZeroLength);
        }
        let available = self.available();
        if size > available {
            return Err(AdapterError::NotEnoughData {
                requested: size,
                available,
            });
        }
        Ok(())
    }

    fn update_timestamp(&mut self, buffer: &Buffer) {
        if let Some(timestamp) = buffer.timestamp() {
            self.timestamp = Some(timestamp);
            self.distance = 0;
        }
    }

    /// Index, start offset and unread length of the first buffer with unread bytes.
    fn head_span(&self) -> Option<(usize, usize, usize)> {
        self.buffers
            .iter()
            .enumerate()
            .map(|(index, buffer)| {
                let start = if index == 0 { self.skip } else { 0 };
                (index, start, buffer.size() - start)
            })
            .find(|&(_, _, len)| len > 0)
    }

    fn head_holds(&self, size: usize) -> bool {
        self.head_span().is_some_and(|(_, _, len)| len >= size)
    }

    /// Joins the head with following buffers that alias adjacent storage,
    /// until the head holds `size` bytes. Returns `true` on success.
    fn try_merge_up(&mut self, size: usize) -> bool {
        let mut merged = false;
        while self.buffers.len() >= 2 {
            if self.buffers[0].size() - self.skip >= size {
                break;
            }
            if !Buffer::is_span_fast(&self.buffers[0], &self.buffers[1]) {
                break;
            }
            let Ok(joined) = Buffer::merge(&self.buffers[0], &self.buffers[1]) else {
                break;
            };
            self.buffers.pop_front();
            self.buffers.pop_front();
            self.buffers.push_front(joined);
            merged = true;
        }
        if merged {
            tracing::trace!(size, "adapter merged adjacent sub-buffers");
        }
        self.head_holds(size)
    }
}

/// Copies bytes from the queue into `dest`, starting `offset` bytes past the
/// read position (`skip` bytes into the head buffer).
fn copy_from_queue(buffers: &VecDeque<Buffer>, skip: usize, offset: usize, dest: &mut [u8]) {
    let mut to_skip = skip + offset;
    let mut written = 0;
    for buffer in buffers {
        if written == dest.len() {
            break;
        }
        let data = buffer.as_slice();
        if to_skip >= data.len() {
            to_skip -= data.len();
            continue;
        }
        let part = &data[to_skip..];
        let count = part.len().min(dest.len() - written);
        dest[written..written + count].copy_from_slice(&part[..count]);
        written += count;
        to_skip = 0;
    }
}

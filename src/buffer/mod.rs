//! Shared, timestamped byte buffers.
//!
//! A [`Buffer`] is the unit of data passed between processing stages. Handles
//! are reference counted: cloning a handle takes a reference, dropping it
//! releases one. When the last handle goes away the storage is released exactly
//! once, either back to its [`BufferPool`] or to the allocator.
//!
//! Sub-buffers alias a window of another buffer's storage without copying and
//! keep that storage alive for as long as they exist:
//!
//! ```text
//! root storage  [...........................................]
//! sub-buffer              [offset .. offset + size)
//! ```
//!
//! Storage is never mutated while more than one handle can observe it. Setters
//! on a shared handle first detach that handle from the others.

mod flags;
mod meta;
mod pool;

pub use flags::BufferFlags;
pub use meta::{Meta, MetaAny};
pub use pool::{BufferPool, FreeListPool, PoolStats};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::BufferError;

/// Backing bytes of a buffer.
enum Storage {
    /// Storage owned by this buffer.
    Owned(Vec<u8>),
    /// Storage the buffer does not own and never releases.
    Static(&'static [u8]),
    /// A window into the storage of `parent`, which is never itself a sub-buffer.
    Sub {
        parent: Buffer,
        offset: usize,
        size: usize,
        max_size: usize,
    },
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(data) => data,
            Storage::Static(data) => data,
            Storage::Sub {
                parent,
                offset,
                size,
                ..
            } => &parent.as_slice()[*offset..*offset + *size],
        }
    }

    /// Writable view of owned storage. Storage this buffer does not own
    /// exposes no writable bytes.
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(data) => data.as_mut_slice(),
            Storage::Static(_) | Storage::Sub { .. } => &mut [],
        }
    }
}

struct BufferInner {
    storage: Storage,
    timestamp: Option<Duration>,
    duration: Option<Duration>,
    offset: Option<u64>,
    offset_end: Option<u64>,
    flags: BufferFlags,
    metas: Vec<Arc<dyn Meta>>,
    pool: Option<Arc<dyn BufferPool>>,
}

impl BufferInner {
    fn new(storage: Storage) -> Self {
        Self {
            storage,
            timestamp: None,
            duration: None,
            offset: None,
            offset_end: None,
            flags: BufferFlags::empty(),
            metas: Vec::new(),
            pool: None,
        }
    }

    /// Copies all metadata onto new storage. The pool is not carried over.
    fn with_storage(&self, storage: Storage) -> Self {
        Self {
            storage,
            timestamp: self.timestamp,
            duration: self.duration,
            offset: self.offset,
            offset_end: self.offset_end,
            flags: self.flags,
            metas: self.metas.clone(),
            pool: None,
        }
    }
}

impl Clone for BufferInner {
    fn clone(&self) -> Self {
        let storage = match &self.storage {
            Storage::Owned(data) => Storage::Owned(data.clone()),
            Storage::Static(data) => Storage::Static(*data),
            Storage::Sub {
                parent,
                offset,
                size,
                max_size,
            } => Storage::Sub {
                parent: parent.clone(),
                offset: *offset,
                size: *size,
                max_size: *max_size,
            },
        };
        self.with_storage(storage)
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        // Sub-buffer parents and static storage are released by dropping the
        // storage variant itself; only owned pooled storage needs a detour.
        if let Some(pool) = self.pool.take() {
            if let Storage::Owned(data) = &mut self.storage {
                let data = std::mem::take(data);
                tracing::trace!(size = data.len(), "returning buffer storage to pool");
                pool.release(data);
            }
        }
    }
}

/// A shared, reference-counted span of bytes with timing metadata.
///
/// Cloning a `Buffer` is cheap: it takes another reference to the same
/// buffer. The contents are immutable while shared; use [`data_mut`] to
/// obtain a private writable copy when needed.
///
/// # Example
///
/// ```
/// use stream_media::Buffer;
/// use std::time::Duration;
///
/// let mut buffer = Buffer::from_vec((0..100).collect());
/// buffer.set_timestamp(Some(Duration::from_millis(40)));
///
/// // A window [20, 50) sharing the same storage
/// let sub = buffer.create_sub(20, 30).unwrap();
/// drop(buffer); // the storage stays alive through `sub`
///
/// assert_eq!(sub.as_slice()[0], 20);
/// assert_eq!(sub.size(), 30);
/// ```
///
/// [`data_mut`]: Buffer::data_mut
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    fn from_inner(inner: BufferInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a buffer owning `size` bytes of zeroed storage.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailed` if the storage cannot be allocated.
    pub fn with_size(size: usize) -> Result<Self, BufferError> {
        let storage = alloc_zeroed(size)?;
        Ok(Self::from_vec(storage))
    }

    /// Creates a buffer taking ownership of `data` without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::from_inner(BufferInner::new(Storage::Owned(data)))
    }

    /// Creates a buffer over static data.
    ///
    /// The storage is never released; the buffer carries [`BufferFlags::DONT_FREE`].
    pub fn from_static(data: &'static [u8]) -> Self {
        let mut inner = BufferInner::new(Storage::Static(data));
        inner.flags.insert(BufferFlags::DONT_FREE);
        Self::from_inner(inner)
    }

    /// Creates a buffer whose storage is checked out of `pool`.
    ///
    /// When the last handle is dropped the storage is returned to `pool`.
    ///
    /// # Errors
    ///
    /// Propagates the pool's error if it cannot provide storage.
    pub fn from_pool(pool: &Arc<dyn BufferPool>, size: usize) -> Result<Self, BufferError> {
        let mut storage = pool.acquire(size)?;
        storage.resize(size, 0);
        tracing::trace!(size, "buffer checked out of pool");

        let mut inner = BufferInner::new(Storage::Owned(storage));
        inner.pool = Some(Arc::clone(pool));
        Ok(Self::from_inner(inner))
    }

    /// Returns the buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        self.inner.storage.as_slice()
    }

    /// Returns a writable view of the contents.
    ///
    /// If the storage is shared with another handle, aliased by a sub-buffer
    /// view, or static, the contents are first copied into storage owned by
    /// this handle. Other handles keep seeing the old contents.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailed` if the copy cannot be allocated.
    pub fn data_mut(&mut self) -> Result<&mut [u8], BufferError> {
        let owned_unique = Arc::get_mut(&mut self.inner)
            .is_some_and(|inner| matches!(inner.storage, Storage::Owned(_)));
        if !owned_unique {
            let copy = alloc_copy(&[self.as_slice()])?;
            let mut inner = self.inner.with_storage(Storage::Owned(copy));
            inner.flags.remove(BufferFlags::DONT_FREE);
            self.inner = Arc::new(inner);
        }

        // Unique and owned at this point, so make_mut never clones.
        Ok(Arc::make_mut(&mut self.inner).storage.as_mut_slice())
    }

    /// Number of valid bytes.
    pub fn size(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns `true` if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of bytes the storage can hold.
    ///
    /// For a sub-buffer this is the parent size minus the window offset.
    pub fn max_size(&self) -> usize {
        match &self.inner.storage {
            Storage::Owned(data) => data.capacity(),
            Storage::Static(data) => data.len(),
            Storage::Sub { max_size, .. } => *max_size,
        }
    }

    /// Presentation timestamp, if known.
    pub fn timestamp(&self) -> Option<Duration> {
        self.inner.timestamp
    }

    /// Duration of the data, if known.
    pub fn duration(&self) -> Option<Duration> {
        self.inner.duration
    }

    /// Position of the first byte in the logical stream, if known.
    pub fn offset(&self) -> Option<u64> {
        self.inner.offset
    }

    /// Position just past the last byte in the logical stream, if known.
    pub fn offset_end(&self) -> Option<u64> {
        self.inner.offset_end
    }

    /// Flags set on this buffer.
    pub fn flags(&self) -> BufferFlags {
        self.inner.flags
    }

    /// The buffer whose storage this sub-buffer aliases.
    pub fn parent(&self) -> Option<&Buffer> {
        match &self.inner.storage {
            Storage::Sub { parent, .. } => Some(parent),
            Storage::Owned(_) | Storage::Static(_) => None,
        }
    }

    /// The pool this buffer's storage returns to.
    pub fn pool(&self) -> Option<&Arc<dyn BufferPool>> {
        self.inner.pool.as_ref()
    }

    /// Number of handles referencing this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns `true` if this is the only handle, so setters act in place.
    pub fn is_writable(&self) -> bool {
        self.ref_count() == 1
    }

    /// Takes `count` additional references at once.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRefCount` if `count` is zero.
    pub fn ref_by_count(&self, count: usize) -> Result<Vec<Buffer>, BufferError> {
        if count == 0 {
            return Err(BufferError::InvalidRefCount);
        }
        Ok((0..count).map(|_| self.clone()).collect())
    }

    /// Releases this handle.
    ///
    /// Equivalent to dropping it. When this was the last handle, the storage
    /// goes back to its pool or is freed, and the parent reference of a
    /// sub-buffer is released in turn.
    pub fn unref(self) {
        drop(self);
    }

    /// Detaches this handle from other handles so metadata can be changed.
    ///
    /// When shared, the handle is replaced by a zero-copy view of the same
    /// bytes carrying a copy of the metadata.
    pub fn make_metadata_writable(&mut self) {
        if Arc::get_mut(&mut self.inner).is_some() {
            return;
        }
        let storage = if self.is_empty() {
            Storage::Owned(Vec::new())
        } else {
            let (parent, offset) = self.root();
            Storage::Sub {
                parent,
                offset,
                size: self.size(),
                max_size: self.max_size(),
            }
        };
        let mut inner = self.inner.with_storage(storage);
        inner.flags.remove(BufferFlags::DONT_FREE);
        self.inner = Arc::new(inner);
    }

    fn inner_mut(&mut self) -> &mut BufferInner {
        self.make_metadata_writable();
        Arc::make_mut(&mut self.inner)
    }

    /// Sets the presentation timestamp.
    pub fn set_timestamp(&mut self, timestamp: Option<Duration>) {
        self.inner_mut().timestamp = timestamp;
    }

    /// Sets the duration.
    pub fn set_duration(&mut self, duration: Option<Duration>) {
        self.inner_mut().duration = duration;
    }

    /// Sets the stream offset.
    pub fn set_offset(&mut self, offset: Option<u64>) {
        self.inner_mut().offset = offset;
    }

    /// Sets the stream end offset.
    pub fn set_offset_end(&mut self, offset_end: Option<u64>) {
        self.inner_mut().offset_end = offset_end;
    }

    /// Replaces the flag set.
    pub fn set_flags(&mut self, flags: BufferFlags) {
        self.inner_mut().flags = flags;
    }

    /// Sets the given flags, keeping the others.
    pub fn insert_flags(&mut self, flags: BufferFlags) {
        self.inner_mut().flags.insert(flags);
    }

    /// Clears the given flags, keeping the others.
    pub fn remove_flags(&mut self, flags: BufferFlags) {
        self.inner_mut().flags.remove(flags);
    }

    /// Attaches a metadata record, taking a reference on it.
    pub fn add_meta(&mut self, meta: Arc<dyn Meta>) {
        tracing::trace!(meta = meta.name(), "meta attached");
        self.inner_mut().metas.push(meta);
    }

    /// Attached metadata records in attachment order.
    pub fn metas(&self) -> impl Iterator<Item = &Arc<dyn Meta>> + '_ {
        self.inner.metas.iter()
    }

    /// The first attached record of type `T`.
    pub fn first_meta<T: Meta + 'static>(&self) -> Option<&T> {
        self.inner
            .metas
            .iter()
            .find_map(|m| meta::downcast_meta::<T>(m.as_ref()))
    }

    /// Detaches `meta`, releasing this buffer's reference on it.
    ///
    /// Records are matched by identity. Returns `false` if `meta` was not attached.
    pub fn remove_meta(&mut self, meta: &Arc<dyn Meta>) -> bool {
        let target = Arc::as_ptr(meta).cast::<()>();
        let attached = self
            .inner
            .metas
            .iter()
            .any(|m| Arc::as_ptr(m).cast::<()>() == target);
        if !attached {
            return false;
        }

        let metas = &mut self.inner_mut().metas;
        if let Some(index) = metas
            .iter()
            .position(|m| Arc::as_ptr(m).cast::<()>() == target)
        {
            metas.remove(index);
        }
        true
    }

    /// Storage owner and absolute window offset of this buffer.
    fn root(&self) -> (Buffer, usize) {
        match &self.inner.storage {
            Storage::Sub { parent, offset, .. } => (parent.clone(), *offset),
            Storage::Owned(_) | Storage::Static(_) => (self.clone(), 0),
        }
    }

    /// Creates a sub-buffer aliasing `[offset, offset + size)` of this buffer.
    ///
    /// No bytes are copied. The sub-buffer keeps the storage alive. Flags and
    /// timestamp are copied; the stream offset is copied when the window starts
    /// at 0, duration and end offset when it covers the whole buffer.
    ///
    /// # Errors
    ///
    /// Returns `EmptySubBuffer` if `size` is 0 and `SubBufferOutOfRange` if the
    /// window does not fit.
    pub fn create_sub(&self, offset: usize, size: usize) -> Result<Buffer, BufferError> {
        if size == 0 {
            return Err(BufferError::EmptySubBuffer);
        }
        let parent_size = self.size();
        if offset.checked_add(size).map_or(true, |end| end > parent_size) {
            return Err(BufferError::SubBufferOutOfRange {
                offset,
                size,
                parent_size,
            });
        }

        let (root, base) = self.root();
        let mut inner = BufferInner::new(Storage::Sub {
            parent: root,
            offset: base + offset,
            size,
            max_size: parent_size - offset,
        });
        inner.flags = self.flags().without(BufferFlags::DONT_FREE);
        inner.timestamp = self.timestamp();
        if offset == 0 {
            inner.offset = self.offset();
            if size == parent_size {
                inner.duration = self.duration();
                inner.offset_end = self.offset_end();
            }
        }
        Ok(Self::from_inner(inner))
    }

    /// Appends the bytes of `other` after the bytes of this buffer.
    ///
    /// When this is the only handle and it owns its storage, the storage is
    /// grown in place and the same buffer is returned. Otherwise a new buffer
    /// holding both contents is allocated and this handle is released. The
    /// result never aliases either input.
    ///
    /// The result keeps this buffer's timestamp and offset; the duration is
    /// the sum of both when both are known and the end offset is `other`'s.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailed` if the grown or new storage cannot be allocated.
    pub fn append(mut self, other: Buffer) -> Result<Buffer, BufferError> {
        let duration = sum_durations(self.duration(), other.duration());
        let offset_end = other.offset_end();

        // Arc::get_mut checks uniqueness atomically; holding `self` by value
        // means no other thread can take a new reference meanwhile.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            if let Storage::Owned(data) = &mut inner.storage {
                data.try_reserve(other.size())
                    .map_err(|_| BufferError::AllocationFailed {
                        size: data.len() + other.size(),
                    })?;
                data.extend_from_slice(other.as_slice());
                inner.duration = duration;
                inner.offset_end = offset_end;
                tracing::trace!(size = data.len(), "buffer appended in place");
                return Ok(self);
            }
        }

        let joined = alloc_copy(&[self.as_slice(), other.as_slice()])?;
        let mut inner = BufferInner::new(Storage::Owned(joined));
        inner.timestamp = self.timestamp();
        inner.offset = self.offset();
        inner.flags = self.flags().without(BufferFlags::DONT_FREE);
        inner.duration = duration;
        inner.offset_end = offset_end;
        Ok(Self::from_inner(inner))
    }

    /// Creates a deep copy with fresh storage and copied metadata.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailed` if the storage cannot be allocated.
    pub fn copy(&self) -> Result<Buffer, BufferError> {
        let data = alloc_copy(&[self.as_slice()])?;
        let mut inner = self.inner.with_storage(Storage::Owned(data));
        inner.flags.remove(BufferFlags::DONT_FREE);
        Ok(Self::from_inner(inner))
    }

    /// Returns `true` if `first` and `second` are adjacent windows of the same
    /// storage, so [`span`](Buffer::span) can join them without copying.
    pub fn is_span_fast(first: &Buffer, second: &Buffer) -> bool {
        match (&first.inner.storage, &second.inner.storage) {
            (
                Storage::Sub {
                    parent: a,
                    offset: a_offset,
                    size: a_size,
                    ..
                },
                Storage::Sub {
                    parent: b,
                    offset: b_offset,
                    ..
                },
            ) => Arc::ptr_eq(&a.inner, &b.inner) && a_offset + a_size == *b_offset,
            _ => false,
        }
    }

    /// Creates a buffer of `len` bytes starting at `offset` in `first` and
    /// continuing into `second`.
    ///
    /// Zero-copy when the two are span-fast, copied otherwise. Timestamp and
    /// stream offset come from `first` when the span starts at 0; for a span
    /// covering both buffers, durations are summed and the end offset comes
    /// from `second`.
    ///
    /// # Errors
    ///
    /// Returns `EmptySubBuffer` if `len` is 0, `SpanOutOfRange` if the span
    /// reaches past the end of `second`, or `AllocationFailed`.
    pub fn span(
        first: &Buffer,
        offset: usize,
        second: &Buffer,
        len: usize,
    ) -> Result<Buffer, BufferError> {
        if len == 0 {
            return Err(BufferError::EmptySubBuffer);
        }
        let total = first.size() + second.size();
        if offset.checked_add(len).map_or(true, |end| end > total) {
            return Err(BufferError::SpanOutOfRange { offset, len, total });
        }

        let mut span = if Buffer::is_span_fast(first, second) {
            let (root, base) = first.root();
            root.create_sub(base + offset, len)?
        } else {
            let joined = first.as_slice().iter().chain(second.as_slice());
            let mut data = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|_| BufferError::AllocationFailed { size: len })?;
            data.extend(joined.skip(offset).take(len));
            Buffer::from_vec(data)
        };

        let inner = span.inner_mut();
        inner.flags = BufferFlags::empty();
        inner.timestamp = None;
        inner.offset = None;
        inner.duration = None;
        inner.offset_end = None;
        if offset == 0 {
            inner.timestamp = first.timestamp();
            inner.offset = first.offset();
            if len == total {
                inner.duration = sum_durations(first.duration(), second.duration());
                inner.offset_end = second.offset_end();
            }
        }
        Ok(span)
    }

    /// Joins two buffers into one covering both.
    ///
    /// # Errors
    ///
    /// Returns `AllocationFailed` if the joined storage cannot be allocated.
    pub fn merge(first: &Buffer, second: &Buffer) -> Result<Buffer, BufferError> {
        let total = first.size() + second.size();
        if total == 0 {
            let mut empty = Buffer::from_vec(Vec::new());
            let inner = empty.inner_mut();
            inner.timestamp = first.timestamp();
            inner.offset = first.offset();
            inner.duration = sum_durations(first.duration(), second.duration());
            inner.offset_end = second.offset_end();
            return Ok(empty);
        }
        Buffer::span(first, 0, second, total)
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("timestamp", &self.timestamp())
            .field("duration", &self.duration())
            .field("offset", &self.offset())
            .field("offset_end", &self.offset_end())
            .field("flags", &self.flags())
            .field("metas", &self.inner.metas.len())
            .field("sub", &self.parent().is_some())
            .field("refs", &self.ref_count())
            .finish()
    }
}

fn sum_durations(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    a.zip(b).map(|(a, b)| a + b)
}

fn alloc_zeroed(size: usize) -> Result<Vec<u8>, BufferError> {
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| BufferError::AllocationFailed { size })?;
    data.resize(size, 0);
    Ok(data)
}

fn alloc_copy(parts: &[&[u8]]) -> Result<Vec<u8>, BufferError> {
    let size = parts.iter().map(|part| part.len()).sum();
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| BufferError::AllocationFailed { size })?;
    for part in parts {
        data.extend_from_slice(part);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(len: u8) -> Buffer {
        Buffer::from_vec((0..len).collect())
    }

    /// Pool that counts releases and never reuses.
    #[derive(Default)]
    struct CountingPool {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl BufferPool for CountingPool {
        fn acquire(&self, size: usize) -> Result<Vec<u8>, BufferError> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(vec![0; size])
        }

        fn release(&self, _storage: Vec<u8>) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct Tag(&'static str);

    impl Meta for Tag {}

    #[derive(Debug)]
    struct Level(i32);

    impl Meta for Level {}

    #[test]
    fn test_with_size() {
        let buffer = Buffer::with_size(64).unwrap();
        assert_eq!(buffer.size(), 64);
        assert_eq!(buffer.ref_count(), 1);
        assert!(buffer.parent().is_none());
        assert_eq!(buffer.metas().count(), 0);
        assert_eq!(buffer.timestamp(), None);
    }

    #[test]
    fn test_from_static_sets_dont_free() {
        let buffer = Buffer::from_static(b"header");
        assert!(buffer.flags().contains(BufferFlags::DONT_FREE));
        assert_eq!(buffer.as_slice(), b"header");
    }

    #[test]
    fn test_clone_takes_reference() {
        let buffer = counting(4);
        let other = buffer.clone();
        assert_eq!(buffer.ref_count(), 2);
        assert!(!buffer.is_writable());
        other.unref();
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn test_ref_by_count() {
        let buffer = counting(4);
        let refs = buffer.ref_by_count(3).unwrap();
        assert_eq!(buffer.ref_count(), 4);
        drop(refs);
        assert_eq!(buffer.ref_count(), 1);
        assert!(matches!(
            buffer.ref_by_count(0),
            Err(BufferError::InvalidRefCount)
        ));
    }

    #[test]
    fn test_create_sub_window() {
        let buffer = counting(100);
        let sub = buffer.create_sub(20, 30).unwrap();
        assert_eq!(sub.size(), 30);
        assert_eq!(sub.max_size(), 80);
        assert_eq!(sub.as_slice()[0], 20);
        assert_eq!(sub.as_slice()[29], 49);
        assert_eq!(buffer.ref_count(), 2);
    }

    #[test]
    fn test_create_sub_rejects_empty() {
        let buffer = counting(10);
        assert!(matches!(
            buffer.create_sub(0, 0),
            Err(BufferError::EmptySubBuffer)
        ));
    }

    #[test]
    fn test_create_sub_rejects_out_of_range() {
        let buffer = counting(10);
        assert!(matches!(
            buffer.create_sub(5, 6),
            Err(BufferError::SubBufferOutOfRange { parent_size: 10, .. })
        ));
        assert!(buffer.create_sub(usize::MAX, 2).is_err());
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn test_create_sub_of_sub_flattens_to_root() {
        let buffer = counting(100);
        let sub = buffer.create_sub(10, 50).unwrap();
        let subsub = sub.create_sub(5, 10).unwrap();

        assert_eq!(subsub.as_slice()[0], 15);
        assert_eq!(subsub.max_size(), 45);
        let parent = subsub.parent().unwrap();
        assert_eq!(parent.size(), 100);
        assert_eq!(sub.ref_count(), 1);
    }

    #[test]
    fn test_create_sub_metadata() {
        let mut buffer = counting(100);
        buffer.set_timestamp(Some(Duration::from_secs(1)));
        buffer.set_duration(Some(Duration::from_millis(10)));
        buffer.set_offset(Some(4800));
        buffer.set_offset_end(Some(4900));
        buffer.set_flags(BufferFlags::DISCONT);

        let whole = buffer.create_sub(0, 100).unwrap();
        assert_eq!(whole.timestamp(), Some(Duration::from_secs(1)));
        assert_eq!(whole.duration(), Some(Duration::from_millis(10)));
        assert_eq!(whole.offset(), Some(4800));
        assert_eq!(whole.offset_end(), Some(4900));
        assert!(whole.flags().contains(BufferFlags::DISCONT));

        let head = buffer.create_sub(0, 10).unwrap();
        assert_eq!(head.offset(), Some(4800));
        assert_eq!(head.duration(), None);

        let tail = buffer.create_sub(50, 10).unwrap();
        assert_eq!(tail.timestamp(), Some(Duration::from_secs(1)));
        assert_eq!(tail.offset(), None);
        assert!(tail.flags().contains(BufferFlags::DISCONT));
    }

    #[test]
    fn test_sub_keeps_parent_alive() {
        let pool = Arc::new(CountingPool::default());
        let dyn_pool: Arc<dyn BufferPool> = pool.clone();

        let parent = Buffer::from_pool(&dyn_pool, 100).unwrap();
        let sub = parent.create_sub(20, 30).unwrap();
        drop(parent);
        assert_eq!(pool.released.load(Ordering::SeqCst), 0);
        assert_eq!(sub.size(), 30);

        drop(sub);
        assert_eq!(pool.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_release_exactly_once() {
        let pool = Arc::new(CountingPool::default());
        let dyn_pool: Arc<dyn BufferPool> = pool.clone();

        let buffer = Buffer::from_pool(&dyn_pool, 16).unwrap();
        let refs = buffer.ref_by_count(5).unwrap();
        let sub = buffer.create_sub(0, 8).unwrap();
        drop(buffer);
        drop(refs);
        assert_eq!(pool.released.load(Ordering::SeqCst), 0);
        drop(sub);
        assert_eq!(pool.released.load(Ordering::SeqCst), 1);
        assert_eq!(pool.acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_append_in_place() {
        let buffer = Buffer::from_vec(vec![1, 2, 3]);
        let other = Buffer::from_vec(vec![4, 5]);

        let joined = buffer.append(other.clone()).unwrap();
        assert_eq!(joined.as_slice(), &[1, 2, 3, 4, 5]);
        assert_eq!(other.as_slice(), &[4, 5]);
        assert_eq!(other.ref_count(), 1);
        assert!(joined.max_size() >= 5);
        assert!(joined.parent().is_none());
    }

    #[test]
    fn test_append_shared_copies() {
        let buffer = Buffer::from_vec(vec![1, 2, 3]);
        let keep = buffer.clone();

        let joined = buffer.append(Buffer::from_vec(vec![4])).unwrap();
        assert_eq!(joined.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(keep.as_slice(), &[1, 2, 3]);
        assert_eq!(keep.ref_count(), 1);
    }

    #[test]
    fn test_append_sub_buffer_copies() {
        let parent = counting(10);
        let sub = parent.create_sub(2, 3).unwrap();

        let joined = sub.append(Buffer::from_vec(vec![99])).unwrap();
        assert_eq!(joined.as_slice(), &[2, 3, 4, 99]);
        assert!(joined.parent().is_none());
        assert_eq!(parent.ref_count(), 1);
    }

    #[test]
    fn test_append_timing() {
        let mut first = Buffer::from_vec(vec![0; 4]);
        first.set_timestamp(Some(Duration::from_millis(100)));
        first.set_duration(Some(Duration::from_millis(10)));
        first.set_offset(Some(0));
        let mut second = Buffer::from_vec(vec![0; 4]);
        second.set_duration(Some(Duration::from_millis(10)));
        second.set_offset_end(Some(8));

        let joined = first.append(second).unwrap();
        assert_eq!(joined.timestamp(), Some(Duration::from_millis(100)));
        assert_eq!(joined.duration(), Some(Duration::from_millis(20)));
        assert_eq!(joined.offset(), Some(0));
        assert_eq!(joined.offset_end(), Some(8));
    }

    #[test]
    fn test_setter_on_shared_does_not_leak() {
        let buffer = counting(8);
        let mut other = buffer.clone();
        other.set_timestamp(Some(Duration::from_secs(3)));

        assert_eq!(buffer.timestamp(), None);
        assert_eq!(other.timestamp(), Some(Duration::from_secs(3)));
        // Detached handle still shares the bytes
        assert_eq!(other.as_slice(), buffer.as_slice());
        assert!(other.parent().is_some());
    }

    #[test]
    fn test_data_mut_unique_in_place() {
        let mut buffer = counting(4);
        buffer.data_mut().unwrap()[0] = 42;
        assert_eq!(buffer.as_slice(), &[42, 1, 2, 3]);
        assert!(buffer.parent().is_none());
    }

    #[test]
    fn test_data_mut_shared_copies() {
        let buffer = counting(4);
        let mut other = buffer.clone();
        other.data_mut().unwrap()[0] = 42;
        assert_eq!(buffer.as_slice(), &[0, 1, 2, 3]);
        assert_eq!(other.as_slice(), &[42, 1, 2, 3]);
    }

    #[test]
    fn test_data_mut_static_copies() {
        let mut buffer = Buffer::from_static(b"abc");
        buffer.data_mut().unwrap()[0] = b'x';
        assert_eq!(buffer.as_slice(), b"xbc");
        assert!(!buffer.flags().contains(BufferFlags::DONT_FREE));
    }

    #[test]
    fn test_data_mut_sub_buffer_copies_window() {
        let parent = counting(8);
        let mut sub = parent.create_sub(2, 3).unwrap();
        sub.data_mut().unwrap().copy_from_slice(&[9, 9, 9]);
        assert_eq!(sub.as_slice(), &[9, 9, 9]);
        assert!(sub.parent().is_none());
        assert_eq!(parent.as_slice(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_metas_in_attachment_order() {
        let mut buffer = counting(4);
        let first: Arc<dyn Meta> = Arc::new(Tag("first"));
        buffer.add_meta(first.clone());
        buffer.add_meta(Arc::new(Level(3)));
        buffer.add_meta(Arc::new(Tag("second")));

        assert_eq!(buffer.metas().count(), 3);
        assert_eq!(buffer.first_meta::<Tag>().map(|t| t.0), Some("first"));
        assert_eq!(buffer.first_meta::<Level>().map(|l| l.0), Some(3));
        assert_eq!(Arc::strong_count(&first), 2);

        assert!(buffer.remove_meta(&first));
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(buffer.first_meta::<Tag>().map(|t| t.0), Some("second"));
        assert!(!buffer.remove_meta(&first));
    }

    #[test]
    fn test_is_span_fast() {
        let buffer = counting(20);
        let a = buffer.create_sub(0, 10).unwrap();
        let b = buffer.create_sub(10, 10).unwrap();
        let c = buffer.create_sub(12, 5).unwrap();

        assert!(Buffer::is_span_fast(&a, &b));
        assert!(!Buffer::is_span_fast(&b, &a));
        assert!(!Buffer::is_span_fast(&a, &c));
        assert!(!Buffer::is_span_fast(&buffer, &a));
    }

    #[test]
    fn test_span_fast_is_zero_copy() {
        let buffer = counting(20);
        let a = buffer.create_sub(0, 10).unwrap();
        let b = buffer.create_sub(10, 10).unwrap();

        let span = Buffer::span(&a, 5, &b, 10).unwrap();
        assert_eq!(span.as_slice(), &(5..15).collect::<Vec<u8>>()[..]);
        assert!(span.parent().is_some());
    }

    #[test]
    fn test_span_copy_path() {
        let a = Buffer::from_vec(vec![1, 2, 3]);
        let b = Buffer::from_vec(vec![4, 5, 6]);
        let span = Buffer::span(&a, 1, &b, 4).unwrap();
        assert_eq!(span.as_slice(), &[2, 3, 4, 5]);
        assert!(Buffer::span(&a, 4, &b, 3).is_err());
        assert!(matches!(
            Buffer::span(&a, 0, &b, 0),
            Err(BufferError::EmptySubBuffer)
        ));
    }

    #[test]
    fn test_merge() {
        let mut a = Buffer::from_vec(vec![1, 2]);
        a.set_timestamp(Some(Duration::from_millis(5)));
        a.set_duration(Some(Duration::from_millis(1)));
        let mut b = Buffer::from_vec(vec![3]);
        b.set_duration(Some(Duration::from_millis(2)));

        let merged = Buffer::merge(&a, &b).unwrap();
        assert_eq!(merged.as_slice(), &[1, 2, 3]);
        assert_eq!(merged.timestamp(), Some(Duration::from_millis(5)));
        assert_eq!(merged.duration(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_copy_is_independent() {
        let mut buffer = counting(4);
        buffer.set_offset(Some(7));
        let copy = buffer.copy().unwrap();
        assert_eq!(copy.as_slice(), buffer.as_slice());
        assert_eq!(copy.offset(), Some(7));
        assert_eq!(buffer.ref_count(), 1);
        assert!(copy.parent().is_none());
    }

    #[test]
    fn test_concurrent_ref_unref() {
        let pool = Arc::new(CountingPool::default());
        let dyn_pool: Arc<dyn BufferPool> = pool.clone();
        let buffer = Buffer::from_pool(&dyn_pool, 32).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let extra = buffer.clone();
                        drop(extra);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.ref_count(), 1);
        drop(buffer);
        assert_eq!(pool.released.load(Ordering::SeqCst), 1);
    }
}

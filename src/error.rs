//! Error types for stream-media.
//!
//! Errors are split by subsystem:
//! - **Buffer errors** ([`BufferError`]): precondition violations and allocation failure
//! - **Adapter errors** ([`AdapterError`]): requests beyond the queued data
//! - **Ring buffer errors** ([`RingBufferError`]): rejected state transitions
//! - **Device errors** ([`DeviceError`]): failures reported by device hooks
//!
//! All of them are synchronous and local to the call that failed. Device failures
//! that happen on the ring buffer thread are surfaced through the
//! [`EventCallback`](crate::EventCallback) instead.

use crate::ringbuffer::RingBufferMode;

/// Errors returned by [`Buffer`](crate::Buffer) and [`BufferPool`](crate::BufferPool) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// A sub-buffer was requested with a zero-length window.
    #[error("sub-buffer window must not be empty")]
    EmptySubBuffer,

    /// A sub-buffer window does not fit inside its parent.
    #[error("sub-buffer window {offset}+{size} exceeds parent size {parent_size}")]
    SubBufferOutOfRange {
        /// Requested window start.
        offset: usize,
        /// Requested window length.
        size: usize,
        /// Size of the parent buffer.
        parent_size: usize,
    },

    /// A reference count operation was requested with a zero count.
    #[error("reference count increment must be at least 1")]
    InvalidRefCount,

    /// Storage for the buffer could not be allocated.
    #[error("failed to allocate {size} bytes of buffer storage")]
    AllocationFailed {
        /// Number of bytes requested.
        size: usize,
    },

    /// The pool refused to hand out storage.
    #[error("buffer pool exhausted")]
    PoolExhausted,

    /// A span request reached past the end of the joined buffers.
    #[error("span of {len} bytes at offset {offset} exceeds combined size {total}")]
    SpanOutOfRange {
        /// Offset into the first buffer.
        offset: usize,
        /// Requested span length.
        len: usize,
        /// Combined size of both buffers.
        total: usize,
    },
}

/// Errors returned by [`Adapter`](crate::Adapter) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// More bytes were requested than are queued.
    #[error("not enough data: requested {requested} bytes, {available} available")]
    NotEnoughData {
        /// Bytes requested by the caller.
        requested: usize,
        /// Bytes currently queued.
        available: usize,
    },

    /// A zero-length peek, flush or take was requested.
    #[error("requested length must be greater than zero")]
    ZeroLength,

    /// Building an output buffer failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Errors reported by a [`RingBufferDevice`](crate::RingBufferDevice) hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The transfer was cut short by a reset. Not a failure.
    #[error("transfer interrupted by reset")]
    Interrupted,

    /// The device failed to move data.
    #[error("device I/O failed: {reason}")]
    Io {
        /// Description of what went wrong.
        reason: String,
    },

    /// Custom error for user-implemented devices.
    #[error("{0}")]
    Custom(String),
}

impl DeviceError {
    /// Creates a custom device error with the given message.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Creates an I/O error with the given reason.
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }
}

/// Errors returned by [`RingBuffer`](crate::RingBuffer) and
/// [`RingBufferThread`](crate::RingBufferThread) operations.
///
/// A failed transition leaves the ring buffer in the last state it reached.
#[derive(Debug, thiserror::Error)]
pub enum RingBufferError {
    /// The ring buffer has no thread attached.
    #[error("no ring buffer thread attached")]
    NoThread,

    /// The ring buffer has not been acquired with a spec.
    #[error("ring buffer not acquired")]
    NotAcquired,

    /// `acquire` was called on an already acquired ring buffer.
    #[error("ring buffer already acquired")]
    AlreadyAcquired,

    /// The device must be opened before acquiring.
    #[error("device not open")]
    DeviceNotOpen,

    /// The ring buffer spec is unusable.
    #[error("invalid ring buffer spec: {reason}")]
    InvalidSpec {
        /// Why the spec was rejected.
        reason: String,
    },

    /// An application-side call does not match the ring buffer direction.
    #[error("operation requires a {expected:?} ring buffer, this one is {actual:?}")]
    WrongMode {
        /// Mode the operation needs.
        expected: RingBufferMode,
        /// Mode of this ring buffer.
        actual: RingBufferMode,
    },

    /// One of the ring buffers is already linked to a different peer.
    #[error("ring buffer already linked to another ring buffer")]
    AlreadyLinked,

    /// The thread already drives another ring buffer in the same mode.
    #[error("thread already drives a {0:?} ring buffer")]
    SlotTaken(RingBufferMode),

    /// The thread was started before its worker was spawned.
    #[error("ring buffer thread is not active")]
    ThreadNotActive,

    /// The worker thread could not be spawned.
    #[error("failed to spawn ring buffer thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// A device hook failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

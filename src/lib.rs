//! # stream-media
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! The data plane of a streaming media pipeline: shared timestamped buffers,
//! an adapter that reslices them into fixed-size frames, and device ring
//! buffers driven by a dedicated I/O thread.
//!
//! ## Quick Start
//!
//! ```rust
//! use stream_media::{Adapter, Buffer};
//! use std::time::Duration;
//!
//! // Upstream delivers buffers of arbitrary size...
//! let mut first = Buffer::from_vec(vec![0u8; 700]);
//! first.set_timestamp(Some(Duration::ZERO));
//! let second = Buffer::from_vec(vec![1u8; 900]);
//!
//! // ...an encoder needs 512-byte frames.
//! let mut adapter = Adapter::new();
//! adapter.push(first);
//! adapter.push(second);
//!
//! let mut frames = 0;
//! while adapter.available() >= 512 {
//!     let frame = adapter.take_buffer(512)?;
//!     assert_eq!(frame.size(), 512);
//!     frames += 1;
//! }
//! assert_eq!(frames, 3);
//! assert_eq!(adapter.available(), 64);
//! # Ok::<(), stream_media::AdapterError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Buffer**: reference-counted handle; sub-buffers alias a window of their
//!   parent's storage and keep it alive. Storage is released exactly once,
//!   to its [`BufferPool`] if it came from one.
//! - **Adapter**: single-owner FIFO; peeks inside one buffer are zero-copy,
//!   peeks across buffers are assembled into a scratch buffer.
//! - **Ring Buffer Thread**: one OS thread per device calls the device's
//!   `process` hook; control calls (`start`/`pause`/`stop`) come from other
//!   threads and interrupt a blocked transfer through the `reset` hook.

// unsafe_code lint is configured in Cargo.toml as "deny"
#![warn(missing_docs)]
// Sample and duration math requires intentional numeric casts
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod adapter;
mod buffer;
mod config;
mod error;
mod event;
mod ringbuffer;

pub use adapter::Adapter;
pub use buffer::{Buffer, BufferFlags, BufferPool, FreeListPool, Meta, MetaAny, PoolStats};
pub use config::{AdapterConfig, PoolConfig, RingBufferSpec};
pub use error::{AdapterError, BufferError, DeviceError, RingBufferError};
pub use event::{event_callback, EventCallback, RingBufferEvent};
pub use ringbuffer::{
    MockDevice, MockSignal, ResetToken, RingBuffer, RingBufferDevice, RingBufferMode,
    RingBufferState, RingBufferThread,
};

//! Device hooks a ring buffer drives.

use crate::config::RingBufferSpec;
use crate::DeviceError;

use super::ResetToken;

/// The device-specific half of a ring buffer.
///
/// A device moves one segment of bytes per [`process`](RingBufferDevice::process)
/// call, on the ring buffer thread. Everything else is called from the
/// controlling thread.
///
/// # Implementation Notes
///
/// - Methods take `&self` - use interior mutability (`Mutex`, atomics) if needed
/// - `process` may block on hardware I/O, but must return promptly once the
///   [`ResetToken`] is set
/// - `reset` must never block; it is how pause and stop interrupt a transfer
/// - A duplex device shared by a playback and a capture ring buffer receives
///   `process` calls for both from the same thread
///
/// # Example
///
/// ```
/// use stream_media::{DeviceError, ResetToken, RingBufferDevice};
/// use std::time::Duration;
///
/// /// Discards everything, paced at 10ms per segment.
/// struct NullSink;
///
/// impl RingBufferDevice for NullSink {
///     fn name(&self) -> &str {
///         "null"
///     }
///
///     fn process(&self, segment: &mut [u8], reset: &ResetToken) -> Result<usize, DeviceError> {
///         if reset.wait_timeout(Duration::from_millis(10)) {
///             return Err(DeviceError::Interrupted);
///         }
///         Ok(segment.len())
///     }
/// }
/// ```
pub trait RingBufferDevice: Send + Sync {
    /// Human-readable name for logging and error messages.
    fn name(&self) -> &str;

    /// Opens the device.
    ///
    /// Default implementation does nothing.
    fn open(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Closes the device.
    ///
    /// Default implementation does nothing.
    fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Configures the device for the given segment layout.
    ///
    /// Default implementation does nothing.
    fn acquire(&self, _spec: &RingBufferSpec) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Releases what [`acquire`](RingBufferDevice::acquire) set up.
    ///
    /// Default implementation does nothing.
    fn release(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Transfers one segment.
    ///
    /// For playback `segment` holds the bytes to write; for capture the device
    /// fills it. Returns the number of bytes transferred.
    ///
    /// A short playback write is resumed with the rest of the segment; a
    /// short capture delivers only the returned bytes. Transferring zero
    /// bytes counts as a failure.
    ///
    /// Return [`DeviceError::Interrupted`] when the transfer was cut short by
    /// `reset`. Other errors are retried by the ring buffer thread according to
    /// the ring buffer spec.
    fn process(&self, segment: &mut [u8], reset: &ResetToken) -> Result<usize, DeviceError>;

    /// Interrupts an in-progress [`process`](RingBufferDevice::process) call.
    ///
    /// Called after the reset token is set, for devices that block on
    /// something the token cannot wake (a pipe, a driver call).
    ///
    /// Default implementation does nothing.
    fn reset(&self) {}
}

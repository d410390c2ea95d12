//! Runtime events emitted by ring buffers and their driving thread.
//!
//! Events are notifications about device I/O that happens on the ring buffer
//! thread, where there is no caller to return an error to. The owning element
//! decides how to react (log, post a fatal message, stop the pipeline).

use std::sync::Arc;

use crate::ringbuffer::{RingBufferMode, RingBufferState};

/// Runtime events emitted while a ring buffer is driven.
///
/// # Example
///
/// ```
/// use stream_media::RingBufferEvent;
///
/// fn handle_event(event: RingBufferEvent) {
///     match event {
///         RingBufferEvent::StateChanged { mode, previous, current } => {
///             eprintln!("{mode:?} ring buffer: {previous:?} -> {current:?}");
///         }
///         RingBufferEvent::Underrun { silence_bytes, .. } => {
///             eprintln!("Underrun: played {silence_bytes} bytes of silence");
///         }
///         RingBufferEvent::Overflow { dropped_bytes } => {
///             eprintln!("Overflow: dropped {dropped_bytes} captured bytes");
///         }
///         RingBufferEvent::DeviceError { error, attempt, .. } => {
///             eprintln!("Device error (attempt {attempt}): {error}");
///         }
///         RingBufferEvent::DeviceFailed { mode, error } => {
///             eprintln!("{mode:?} device failed: {error}");
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum RingBufferEvent {
    /// A ring buffer completed a state transition.
    StateChanged {
        /// Direction of the ring buffer.
        mode: RingBufferMode,
        /// State before the transition.
        previous: RingBufferState,
        /// State after the transition.
        current: RingBufferState,
    },

    /// A playback segment was due but the application had not committed
    /// enough data. The missing part was filled with the silence byte.
    Underrun {
        /// Direction of the ring buffer (always playback).
        mode: RingBufferMode,
        /// Number of silence bytes written to the device.
        silence_bytes: usize,
    },

    /// Captured data was dropped because the application did not read fast enough.
    Overflow {
        /// Number of captured bytes that were discarded.
        dropped_bytes: usize,
    },

    /// A `process` call failed and will be retried.
    DeviceError {
        /// Direction of the failing ring buffer.
        mode: RingBufferMode,
        /// Description of the error.
        error: String,
        /// Attempt number, starting at 1.
        attempt: u32,
    },

    /// `process` kept failing after all retries. The ring buffer was paused.
    DeviceFailed {
        /// Direction of the failing ring buffer.
        mode: RingBufferMode,
        /// Description of the last error.
        error: String,
    },
}

/// Callback type for receiving ring buffer events.
///
/// Events are delivered on the thread that produced them, which for device
/// I/O is the ring buffer thread. Callbacks must not block.
pub type EventCallback = Arc<dyn Fn(RingBufferEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use stream_media::{event_callback, RingBufferEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(RingBufferEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_debug() {
        let event = RingBufferEvent::Overflow { dropped_bytes: 1764 };
        let debug = format!("{:?}", event);
        assert!(debug.contains("Overflow"));
        assert!(debug.contains("1764"));
    }

    #[test]
    fn test_event_clone() {
        let event = RingBufferEvent::DeviceFailed {
            mode: RingBufferMode::Capture,
            error: "device gone".to_string(),
        };
        if let RingBufferEvent::DeviceFailed { mode, error } = event.clone() {
            assert_eq!(mode, RingBufferMode::Capture);
            assert_eq!(error, "device gone");
        } else {
            panic!("Expected DeviceFailed variant");
        }
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(RingBufferEvent::Overflow { dropped_bytes: 0 });
        assert!(called.load(Ordering::SeqCst));
    }
}

//! Configuration types for adapters, pools and ring buffers.

use std::time::Duration;

use crate::RingBufferError;

/// Configuration for an [`Adapter`](crate::Adapter).
///
/// # Example
///
/// ```
/// use stream_media::{Adapter, AdapterConfig};
///
/// let adapter = Adapter::with_config(AdapterConfig { scratch_quantum: 4096 });
/// assert_eq!(adapter.available(), 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Growth step of the scratch buffer used when a peek spans buffers.
    ///
    /// The scratch buffer is grown to the next multiple of this value that
    /// holds the requested size. A value of 0 is treated as 1.
    /// Default: 16 bytes
    pub scratch_quantum: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            scratch_quantum: 16,
        }
    }
}

impl AdapterConfig {
    /// Rounds `size` up to the scratch growth quantum.
    #[must_use]
    pub fn scratch_capacity_for(&self, size: usize) -> usize {
        let quantum = self.scratch_quantum.max(1);
        size.div_ceil(quantum) * quantum
    }
}

/// Configuration for a [`FreeListPool`](crate::FreeListPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of released storages kept for reuse.
    ///
    /// Storage released while the free list is full is dropped.
    /// Default: 32
    pub max_free: usize,

    /// Minimum capacity of freshly allocated storage.
    ///
    /// Default: 0
    pub min_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_free: 32,
            min_capacity: 0,
        }
    }
}

/// Layout and failure policy of a [`RingBuffer`](crate::RingBuffer).
///
/// The ring buffer memory is `segment_total` segments of `segment_size` bytes.
/// The ring buffer thread moves exactly one segment per `process` call.
///
/// # Example
///
/// ```
/// use stream_media::RingBufferSpec;
/// use std::time::Duration;
///
/// // 48kHz stereo s16, 10ms segments, 100ms of buffering
/// let spec = RingBufferSpec::from_format(
///     48000,
///     2,
///     2,
///     Duration::from_millis(10),
///     Duration::from_millis(100),
/// );
/// assert_eq!(spec.segment_size, 480 * 4);
/// assert_eq!(spec.segment_total, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBufferSpec {
    /// Size of one segment in bytes.
    pub segment_size: usize,

    /// Number of segments in the ring.
    pub segment_total: usize,

    /// Sample rate in Hz, used for duration calculations only.
    pub rate: u32,

    /// Bytes per frame (channels × bytes per sample).
    pub bytes_per_frame: usize,

    /// Byte value written into playback segments on underrun.
    ///
    /// Default: 0 (silence for signed PCM)
    pub silence_byte: u8,

    /// Number of attempts for a failing `process` call before giving up.
    ///
    /// Default: 3
    pub process_retry_attempts: u32,

    /// Initial delay between `process` retries.
    ///
    /// Uses exponential backoff (delay doubles each attempt).
    /// Default: 10ms
    pub process_retry_delay: Duration,
}

impl Default for RingBufferSpec {
    fn default() -> Self {
        Self::from_format(
            44100,
            2,
            2,
            Duration::from_millis(10),
            Duration::from_millis(200),
        )
    }
}

impl RingBufferSpec {
    /// Derives segment layout from an audio format.
    ///
    /// `latency` is the duration of one segment, `buffer_time` the duration of
    /// the whole ring. At least one frame per segment and one segment per ring
    /// are always allocated.
    #[must_use]
    pub fn from_format(
        rate: u32,
        channels: u16,
        bytes_per_sample: u16,
        latency: Duration,
        buffer_time: Duration,
    ) -> Self {
        let bytes_per_frame = usize::from(channels) * usize::from(bytes_per_sample);
        let frames_per_segment =
            ((f64::from(rate) * latency.as_secs_f64()).round() as usize).max(1);
        let segment_total = if latency.is_zero() {
            1
        } else {
            ((buffer_time.as_secs_f64() / latency.as_secs_f64()).round() as usize).max(1)
        };

        Self {
            segment_size: frames_per_segment * bytes_per_frame,
            segment_total,
            rate,
            bytes_per_frame,
            silence_byte: 0,
            process_retry_attempts: 3,
            process_retry_delay: Duration::from_millis(10),
        }
    }

    /// Total ring capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.segment_size.saturating_mul(self.segment_total)
    }

    /// Playback duration of one segment.
    #[must_use]
    pub fn segment_duration(&self) -> Duration {
        if self.rate == 0 || self.bytes_per_frame == 0 {
            return Duration::ZERO;
        }
        let frames = self.segment_size / self.bytes_per_frame;
        Duration::from_secs_f64(frames as f64 / f64::from(self.rate))
    }

    /// Playback duration of the whole ring.
    #[must_use]
    pub fn buffer_duration(&self) -> Duration {
        self.segment_duration() * self.segment_total as u32
    }

    /// Checks that the spec describes a usable ring.
    pub fn validate(&self) -> Result<(), RingBufferError> {
        if self.segment_size == 0 {
            return Err(RingBufferError::InvalidSpec {
                reason: "segment size must be greater than zero".to_string(),
            });
        }
        if self.segment_total == 0 {
            return Err(RingBufferError::InvalidSpec {
                reason: "segment total must be greater than zero".to_string(),
            });
        }
        if self.segment_size.checked_mul(self.segment_total).is_none() {
            return Err(RingBufferError::InvalidSpec {
                reason: format!(
                    "{} segments of {} bytes overflow the ring capacity",
                    self.segment_total, self.segment_size
                ),
            });
        }
        if self.bytes_per_frame != 0 && self.segment_size % self.bytes_per_frame != 0 {
            return Err(RingBufferError::InvalidSpec {
                reason: format!(
                    "segment size {} is not a multiple of the frame size {}",
                    self.segment_size, self.bytes_per_frame
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_config_default() {
        assert_eq!(AdapterConfig::default().scratch_quantum, 16);
    }

    #[test]
    fn test_scratch_capacity_rounds_up() {
        let config = AdapterConfig::default();
        assert_eq!(config.scratch_capacity_for(1), 16);
        assert_eq!(config.scratch_capacity_for(16), 16);
        assert_eq!(config.scratch_capacity_for(17), 32);
    }

    #[test]
    fn test_scratch_capacity_zero_quantum() {
        let config = AdapterConfig { scratch_quantum: 0 };
        assert_eq!(config.scratch_capacity_for(13), 13);
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_free, 32);
        assert_eq!(config.min_capacity, 0);
    }

    #[test]
    fn test_spec_defaults() {
        let spec = RingBufferSpec::default();
        assert_eq!(spec.segment_size, 441 * 4);
        assert_eq!(spec.segment_total, 20);
        assert_eq!(spec.silence_byte, 0);
        assert_eq!(spec.process_retry_attempts, 3);
        assert_eq!(spec.segment_duration(), Duration::from_millis(10));
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_spec_capacity() {
        let spec = RingBufferSpec::from_format(
            16000,
            1,
            2,
            Duration::from_millis(20),
            Duration::from_millis(100),
        );
        assert_eq!(spec.segment_size, 640);
        assert_eq!(spec.segment_total, 5);
        assert_eq!(spec.capacity(), 3200);
        assert_eq!(spec.buffer_duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_spec_rejects_zero_segments() {
        let spec = RingBufferSpec {
            segment_total: 0,
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(RingBufferError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_spec_rejects_capacity_overflow() {
        let spec = RingBufferSpec {
            segment_size: usize::MAX / 2,
            segment_total: 4,
            bytes_per_frame: 1,
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(RingBufferError::InvalidSpec { .. })
        ));
        assert_eq!(spec.capacity(), usize::MAX);
    }

    #[test]
    fn test_spec_rejects_partial_frames() {
        let spec = RingBufferSpec {
            segment_size: 1763,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_zero_rate_duration() {
        let spec = RingBufferSpec {
            rate: 0,
            ..Default::default()
        };
        assert_eq!(spec.segment_duration(), Duration::ZERO);
    }
}

//! Mock device for testing ring buffers without hardware.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::RingBufferSpec;
use crate::DeviceError;

use super::{ResetToken, RingBufferDevice, RingBufferMode};

/// Signal a capture [`MockDevice`] generates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MockSignal {
    /// Every captured byte has this value.
    Constant(u8),
    /// A full-scale sine wave as interleaved 16-bit little-endian PCM.
    Sine {
        /// Sample rate in Hz.
        rate: u32,
        /// Interleaved channel count.
        channels: u16,
        /// Tone frequency in Hz.
        frequency: f64,
    },
}

struct Generator {
    signal: MockSignal,
    frame: u64,
}

impl Generator {
    fn fill(&mut self, segment: &mut [u8]) {
        match self.signal {
            MockSignal::Constant(value) => segment.fill(value),
            MockSignal::Sine {
                rate,
                channels,
                frequency,
            } => {
                let bytes_per_frame = 2 * usize::from(channels.max(1));
                let rate = f64::from(rate.max(1));
                let mut frames = segment.chunks_exact_mut(bytes_per_frame);
                for frame in &mut frames {
                    let t = self.frame as f64 / rate;
                    let value = (2.0 * std::f64::consts::PI * frequency * t).sin();
                    let sample = ((value * 32767.0) as i16).to_le_bytes();
                    for channel in frame.chunks_exact_mut(2) {
                        channel.copy_from_slice(&sample);
                    }
                    self.frame += 1;
                }
                frames.into_remainder().fill(0);
            }
        }
    }
}

/// A mock device that plays into memory and captures synthetic data.
///
/// The mock can also block inside `process` until reset, or fail a given
/// number of times, to exercise pause/stop and the retry policy. This allows
/// testing the ring buffer thread in CI environments.
///
/// # Example
///
/// ```
/// use stream_media::{MockDevice, MockSignal, ResetToken, RingBufferDevice};
///
/// let device = MockDevice::capture("mic").with_signal(MockSignal::Constant(7));
/// let mut segment = [0u8; 4];
/// device.process(&mut segment, &ResetToken::new()).unwrap();
/// assert_eq!(segment, [7, 7, 7, 7]);
/// ```
pub struct MockDevice {
    name: String,
    mode: RingBufferMode,
    pace: Option<Duration>,
    block_until_reset: bool,
    transfer_limit: Option<usize>,
    failures: AtomicU32,
    generator: Mutex<Generator>,
    played: Mutex<Vec<u8>>,
    loopback: Option<Arc<Mutex<VecDeque<u8>>>>,
    calls: Mutex<usize>,
    calls_changed: Condvar,
    resets: AtomicUsize,
    open: AtomicBool,
    acquired: Mutex<Option<RingBufferSpec>>,
}

impl MockDevice {
    fn new(name: impl Into<String>, mode: RingBufferMode) -> Self {
        Self {
            name: name.into(),
            mode,
            pace: Some(Duration::from_millis(1)),
            block_until_reset: false,
            transfer_limit: None,
            failures: AtomicU32::new(0),
            generator: Mutex::new(Generator {
                signal: MockSignal::Constant(0),
                frame: 0,
            }),
            played: Mutex::new(Vec::new()),
            loopback: None,
            calls: Mutex::new(0),
            calls_changed: Condvar::new(),
            resets: AtomicUsize::new(0),
            open: AtomicBool::new(false),
            acquired: Mutex::new(None),
        }
    }

    /// Creates a playback mock that records every processed segment.
    pub fn playback(name: impl Into<String>) -> Self {
        Self::new(name, RingBufferMode::Playback)
    }

    /// Creates a capture mock producing silence (all zero bytes).
    pub fn capture(name: impl Into<String>) -> Self {
        Self::new(name, RingBufferMode::Capture)
    }

    /// Creates a playback/capture pair where capture returns what playback wrote.
    ///
    /// Capture fills with zero bytes when playback has not written enough yet.
    pub fn loopback_pair(name: &str) -> (Self, Self) {
        let wire = Arc::new(Mutex::new(VecDeque::new()));
        let mut playback = Self::playback(format!("{name}:playback"));
        let mut capture = Self::capture(format!("{name}:capture"));
        playback.loopback = Some(wire.clone());
        capture.loopback = Some(wire);
        (playback, capture)
    }

    /// Sets the signal generated by a capture mock.
    #[must_use]
    pub fn with_signal(self, signal: MockSignal) -> Self {
        *self.generator.lock() = Generator { signal, frame: 0 };
        self
    }

    /// Sets how long each `process` call takes, or `None` to return at once.
    ///
    /// Default: 1ms
    #[must_use]
    pub fn with_pace(mut self, pace: Option<Duration>) -> Self {
        self.pace = pace;
        self
    }

    /// Makes every `process` call block until the reset token is set.
    #[must_use]
    pub fn blocking(mut self) -> Self {
        self.block_until_reset = true;
        self
    }

    /// Moves at most `bytes` per `process` call, like a device that accepts
    /// short writes. `0` makes every call transfer nothing.
    #[must_use]
    pub fn with_transfer_limit(mut self, bytes: usize) -> Self {
        self.transfer_limit = Some(bytes);
        self
    }

    /// Makes the next `times` `process` calls fail with an I/O error.
    #[must_use]
    pub fn failing(self, times: u32) -> Self {
        self.failures.store(times, Ordering::SeqCst);
        self
    }

    /// Returns a copy of every byte processed by a playback mock.
    pub fn played(&self) -> Vec<u8> {
        self.played.lock().clone()
    }

    /// Returns how many times `process` has been entered.
    pub fn process_calls(&self) -> usize {
        *self.calls.lock()
    }

    /// Returns how many times the `reset` hook has been called.
    pub fn reset_calls(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Returns `true` between `open` and `close`.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Returns the spec passed to `acquire`, until `release`.
    pub fn acquired_spec(&self) -> Option<RingBufferSpec> {
        self.acquired.lock().clone()
    }

    /// Waits until `process` has been entered at least `calls` times.
    ///
    /// Returns `false` on timeout.
    pub fn wait_for_process_calls(&self, calls: usize, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut count = self.calls.lock();
        while *count < calls {
            match deadline {
                Some(deadline) => {
                    if self.calls_changed.wait_until(&mut count, deadline).timed_out() {
                        return *count >= calls;
                    }
                }
                None => self.calls_changed.wait(&mut count),
            }
        }
        true
    }

    fn count_call(&self) {
        let mut count = self.calls.lock();
        *count += 1;
        self.calls_changed.notify_all();
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl RingBufferDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<(), DeviceError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn acquire(&self, spec: &RingBufferSpec) -> Result<(), DeviceError> {
        *self.acquired.lock() = Some(spec.clone());
        Ok(())
    }

    fn release(&self) -> Result<(), DeviceError> {
        *self.acquired.lock() = None;
        Ok(())
    }

    fn process(&self, segment: &mut [u8], reset: &ResetToken) -> Result<usize, DeviceError> {
        self.count_call();

        if self.take_failure() {
            return Err(DeviceError::io("injected mock failure"));
        }

        if self.block_until_reset {
            reset.wait_until_reset();
            return Err(DeviceError::Interrupted);
        }

        if let Some(pace) = self.pace {
            if reset.wait_timeout(pace) {
                return Err(DeviceError::Interrupted);
            }
        }

        let len = self
            .transfer_limit
            .map_or(segment.len(), |limit| limit.min(segment.len()));
        let segment = &mut segment[..len];

        match (self.mode, &self.loopback) {
            (RingBufferMode::Playback, wire) => {
                self.played.lock().extend_from_slice(segment);
                if let Some(wire) = wire {
                    wire.lock().extend(segment.iter().copied());
                }
            }
            (RingBufferMode::Capture, Some(wire)) => {
                let mut wire = wire.lock();
                let looped = wire.len().min(segment.len());
                for (dst, src) in segment.iter_mut().zip(wire.drain(..looped)) {
                    *dst = src;
                }
                segment[looped..].fill(0);
            }
            (RingBufferMode::Capture, None) => self.generator.lock().fill(segment),
        }

        Ok(segment.len())
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_playback_records_segments() {
        let device = MockDevice::playback("speaker").with_pace(None);
        let token = ResetToken::new();
        let mut first = [1u8, 2, 3];
        let mut second = [4u8, 5];
        device.process(&mut first, &token).unwrap();
        device.process(&mut second, &token).unwrap();

        assert_eq!(device.played(), vec![1, 2, 3, 4, 5]);
        assert_eq!(device.process_calls(), 2);
    }

    #[test]
    fn test_capture_silence_by_default() {
        let device = MockDevice::capture("mic").with_pace(None);
        let mut segment = [0xffu8; 8];
        device.process(&mut segment, &ResetToken::new()).unwrap();
        assert_eq!(segment, [0; 8]);
    }

    #[test]
    fn test_capture_sine() {
        let device = MockDevice::capture("mic")
            .with_pace(None)
            .with_signal(MockSignal::Sine {
                rate: 16000,
                channels: 2,
                frequency: 440.0,
            });
        let mut segment = vec![0u8; 16000 / 100 * 4];
        device.process(&mut segment, &ResetToken::new()).unwrap();

        let samples: Vec<i16> = segment
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert!(samples.iter().any(|&s| s > 0));
        assert!(samples.iter().any(|&s| s < 0));
        // channels carry the same sample
        assert!(samples.chunks_exact(2).all(|frame| frame[0] == frame[1]));
    }

    #[test]
    fn test_failing_then_recovering() {
        let device = MockDevice::playback("speaker").with_pace(None).failing(2);
        let token = ResetToken::new();
        let mut segment = [0u8; 4];

        assert!(device.process(&mut segment, &token).is_err());
        assert!(device.process(&mut segment, &token).is_err());
        assert!(device.process(&mut segment, &token).is_ok());
    }

    #[test]
    fn test_transfer_limit() {
        let device = MockDevice::playback("speaker")
            .with_pace(None)
            .with_transfer_limit(2);
        let mut segment = [1u8, 2, 3, 4];
        assert_eq!(device.process(&mut segment, &ResetToken::new()), Ok(2));
        assert_eq!(device.played(), vec![1, 2]);
    }

    #[test]
    fn test_wait_for_process_calls_unbounded() {
        let device = MockDevice::playback("speaker").with_pace(None);
        device.process(&mut [0u8; 4], &ResetToken::new()).unwrap();
        assert!(device.wait_for_process_calls(1, Duration::MAX));
    }

    #[test]
    fn test_blocking_until_reset() {
        let device = Arc::new(MockDevice::playback("speaker").blocking());
        let token = Arc::new(ResetToken::new());

        let worker = {
            let device = device.clone();
            let token = token.clone();
            thread::spawn(move || {
                let mut segment = [0u8; 4];
                device.process(&mut segment, &token)
            })
        };

        assert!(device.wait_for_process_calls(1, Duration::from_secs(5)));
        token.reset();
        assert_eq!(worker.join().unwrap(), Err(DeviceError::Interrupted));
    }

    #[test]
    fn test_loopback_pair() {
        let (playback, capture) = MockDevice::loopback_pair("duplex");
        let token = ResetToken::new();

        let mut out = [9u8, 8, 7];
        playback.process(&mut out, &token).unwrap();

        let mut input = [0xffu8; 5];
        capture.process(&mut input, &token).unwrap();
        assert_eq!(input, [9, 8, 7, 0, 0]);
        assert_eq!(playback.name(), "duplex:playback");
    }

    #[test]
    fn test_lifecycle_hooks() {
        let device = MockDevice::capture("mic");
        device.open().unwrap();
        assert!(device.is_open());

        device.acquire(&RingBufferSpec::default()).unwrap();
        assert!(device.acquired_spec().is_some());

        device.reset();
        assert_eq!(device.reset_calls(), 1);

        device.release().unwrap();
        device.close().unwrap();
        assert!(device.acquired_spec().is_none());
        assert!(!device.is_open());
    }
}

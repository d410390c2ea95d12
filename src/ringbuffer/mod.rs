//! Device ring buffers driven by a dedicated I/O thread.
//!
//! A [`RingBuffer`] sits between an element and a device. The application
//! side commits (playback) or reads (capture) bytes without blocking. The
//! device side runs on a [`RingBufferThread`], which moves one segment per
//! [`RingBufferDevice::process`] call for as long as the ring buffer is started.
//!
//! ```text
//!            start()                 pause()
//! Stopped ───────────▶ Started ───────────────▶ Paused
//!    ▲                   ▲  │                     │
//!    │                   │  │ stop()              │ start()
//!    │                   │  ▼                     │
//!    └──── stop() ────── │ ─┴─────────────────────┤
//!                        └────────────────────────┘
//! ```
//!
//! Pause and stop never wait for the device: they set the ring buffer's
//! [`ResetToken`] and call the device `reset` hook, which makes an in-progress
//! `process` call return. Stop additionally releases the thread activation,
//! joining the worker once no ring buffer needs it.

mod device;
mod mock;
mod reset;
mod thread;

pub use device::RingBufferDevice;
pub use mock::{MockDevice, MockSignal};
pub use reset::ResetToken;
pub use thread::RingBufferThread;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::config::RingBufferSpec;
use crate::{EventCallback, RingBufferError, RingBufferEvent};

/// Direction of a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingBufferMode {
    /// The application commits bytes, the device plays them.
    Playback,
    /// The device captures bytes, the application reads them.
    Capture,
}

impl RingBufferMode {
    const fn index(self) -> usize {
        match self {
            RingBufferMode::Playback => 0,
            RingBufferMode::Capture => 1,
        }
    }
}

/// Lifecycle state of a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RingBufferState {
    /// No thread activity. Initial state.
    #[default]
    Stopped,
    /// Attached to its thread but not transferring.
    Paused,
    /// The thread calls `process` repeatedly.
    Started,
}

impl RingBufferState {
    const fn as_u8(self) -> u8 {
        match self {
            RingBufferState::Stopped => 0,
            RingBufferState::Paused => 1,
            RingBufferState::Started => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => RingBufferState::Paused,
            2 => RingBufferState::Started,
            _ => RingBufferState::Stopped,
        }
    }
}

/// Segment memory shared between the application and the worker.
struct SegmentRing {
    spec: RingBufferSpec,
    producer: Mutex<HeapProd<u8>>,
    consumer: Mutex<HeapCons<u8>>,
    /// The segment handed to `process`. Only the worker touches it.
    segment: Mutex<Vec<u8>>,
}

impl SegmentRing {
    fn new(spec: RingBufferSpec) -> Self {
        let (producer, consumer) = HeapRb::<u8>::new(spec.capacity()).split();
        let segment = vec![spec.silence_byte; spec.segment_size];
        Self {
            spec,
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            segment: Mutex::new(segment),
        }
    }
}

#[derive(Default)]
struct Control {
    open: bool,
    ring: Option<Arc<SegmentRing>>,
    thread: Option<RingBufferThread>,
    active: bool,
}

/// State shared by all handles of one ring buffer and its thread.
struct RingShared {
    mode: RingBufferMode,
    device: Arc<dyn RingBufferDevice>,
    /// Read by the worker without taking `control`.
    state: Arc<AtomicU8>,
    control: Mutex<Control>,
    reset: ResetToken,
    peer: Mutex<Option<Weak<RingShared>>>,
    callback: Mutex<Option<EventCallback>>,
    segments_done: AtomicU64,
    underrunning: AtomicBool,
}

impl RingShared {
    fn state(&self) -> RingBufferState {
        RingBufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn store_state(&self, state: RingBufferState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Interrupts the current transfer, if any.
    fn interrupt(&self) {
        self.reset.reset();
        self.device.reset();
    }

    fn emit(&self, event: RingBufferEvent) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn state_changed(&self, previous: RingBufferState, current: RingBufferState) {
        tracing::info!(
            device = self.device.name(),
            mode = ?self.mode,
            ?previous,
            ?current,
            "ring buffer state changed"
        );
        self.emit(RingBufferEvent::StateChanged {
            mode: self.mode,
            previous,
            current,
        });
    }
}

impl Drop for RingShared {
    fn drop(&mut self) {
        self.store_state(RingBufferState::Stopped);
        self.interrupt();

        let this: *const Self = self;
        let control = self.control.get_mut();
        if let Some(thread) = control.thread.take() {
            thread.unregister(self.mode, this);
        }
        if control.ring.take().is_some() {
            if let Err(e) = self.device.release() {
                tracing::warn!(device = self.device.name(), error = %e, "device release failed");
            }
        }
        if control.open {
            if let Err(e) = self.device.close() {
                tracing::warn!(device = self.device.name(), error = %e, "device close failed");
            }
        }
    }
}

/// A fixed-capacity byte ring between an application and a device.
///
/// `RingBuffer` is a handle: clones refer to the same ring buffer. The ring
/// buffer is torn down (stopped, released, closed) when the last handle is
/// dropped.
///
/// # Lifecycle
///
/// 1. [`open_device`](RingBuffer::open_device)
/// 2. [`acquire`](RingBuffer::acquire) with a [`RingBufferSpec`]
/// 3. [`set_thread`](RingBuffer::set_thread)
/// 4. [`start`](RingBuffer::start) / [`pause`](RingBuffer::pause) /
///    [`stop`](RingBuffer::stop), from any thread
/// 5. [`release`](RingBuffer::release), [`close_device`](RingBuffer::close_device)
///
/// # Example
///
/// ```
/// use stream_media::{MockDevice, RingBuffer, RingBufferMode, RingBufferSpec, RingBufferThread};
/// use std::sync::Arc;
///
/// let device = Arc::new(MockDevice::playback("speaker"));
/// let ring = RingBuffer::new(RingBufferMode::Playback, device.clone());
/// let thread = RingBufferThread::new("audio-out");
///
/// ring.open_device()?;
/// ring.acquire(RingBufferSpec::default())?;
/// ring.set_thread(Some(&thread))?;
///
/// ring.commit(&[0u8; 1764])?;
/// ring.start()?;
/// // the thread now feeds the device one segment at a time
/// ring.stop()?;
/// # Ok::<(), stream_media::RingBufferError>(())
/// ```
#[derive(Clone)]
pub struct RingBuffer {
    shared: Arc<RingShared>,
}

impl RingBuffer {
    /// Creates a stopped ring buffer for `device`.
    pub fn new(mode: RingBufferMode, device: Arc<dyn RingBufferDevice>) -> Self {
        Self {
            shared: Arc::new(RingShared {
                mode,
                device,
                state: Arc::new(AtomicU8::new(RingBufferState::Stopped.as_u8())),
                control: Mutex::new(Control::default()),
                reset: ResetToken::new(),
                peer: Mutex::new(None),
                callback: Mutex::new(None),
                segments_done: AtomicU64::new(0),
                underrunning: AtomicBool::new(false),
            }),
        }
    }

    fn from_shared(shared: Arc<RingShared>) -> Self {
        Self { shared }
    }

    /// Sets the callback receiving this ring buffer's events.
    #[must_use]
    pub fn with_event_callback(self, callback: EventCallback) -> Self {
        *self.shared.callback.lock() = Some(callback);
        self
    }

    /// Returns the direction of this ring buffer.
    pub fn mode(&self) -> RingBufferMode {
        self.shared.mode
    }

    /// Returns the current state.
    pub fn state(&self) -> RingBufferState {
        self.shared.state()
    }

    /// Returns the device driven by this ring buffer.
    pub fn device(&self) -> &Arc<dyn RingBufferDevice> {
        &self.shared.device
    }

    /// Returns `true` if the device is open.
    pub fn is_open(&self) -> bool {
        self.shared.control.lock().open
    }

    /// Returns `true` if segment memory is allocated.
    pub fn is_acquired(&self) -> bool {
        self.shared.control.lock().ring.is_some()
    }

    /// Returns `true` if this ring buffer holds an activation of its thread.
    pub fn is_active(&self) -> bool {
        self.shared.control.lock().active
    }

    /// Returns the spec the ring buffer was acquired with.
    pub fn spec(&self) -> Option<RingBufferSpec> {
        self.shared
            .control
            .lock()
            .ring
            .as_ref()
            .map(|ring| ring.spec.clone())
    }

    /// Returns the attached thread.
    pub fn thread(&self) -> Option<RingBufferThread> {
        self.shared.control.lock().thread.clone()
    }

    /// Opens the device. Does nothing if it is already open.
    pub fn open_device(&self) -> Result<(), RingBufferError> {
        let mut control = self.shared.control.lock();
        if control.open {
            return Ok(());
        }
        self.shared.device.open()?;
        control.open = true;
        tracing::info!(device = self.shared.device.name(), mode = ?self.shared.mode, "device opened");
        Ok(())
    }

    /// Closes the device, releasing the ring buffer first if needed.
    pub fn close_device(&self) -> Result<(), RingBufferError> {
        self.release()?;
        let mut control = self.shared.control.lock();
        if !control.open {
            return Ok(());
        }
        self.shared.device.close()?;
        control.open = false;
        tracing::info!(device = self.shared.device.name(), mode = ?self.shared.mode, "device closed");
        Ok(())
    }

    /// Allocates segment memory for `spec` and configures the device.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidSpec` for an unusable spec, `DeviceNotOpen` before
    /// [`open_device`](RingBuffer::open_device), and `AlreadyAcquired` if
    /// called twice without [`release`](RingBuffer::release).
    pub fn acquire(&self, spec: RingBufferSpec) -> Result<(), RingBufferError> {
        spec.validate()?;

        let mut control = self.shared.control.lock();
        if !control.open {
            return Err(RingBufferError::DeviceNotOpen);
        }
        if control.ring.is_some() {
            return Err(RingBufferError::AlreadyAcquired);
        }

        self.shared.device.acquire(&spec)?;
        tracing::info!(
            device = self.shared.device.name(),
            mode = ?self.shared.mode,
            segment_size = spec.segment_size,
            segment_total = spec.segment_total,
            "ring buffer acquired"
        );
        control.ring = Some(Arc::new(SegmentRing::new(spec)));
        self.shared.segments_done.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Stops the ring buffer and frees its segment memory.
    ///
    /// Does nothing if the ring buffer is not acquired.
    pub fn release(&self) -> Result<(), RingBufferError> {
        self.stop()?;
        let mut control = self.shared.control.lock();
        if control.ring.take().is_none() {
            return Ok(());
        }
        tracing::info!(device = self.shared.device.name(), mode = ?self.shared.mode, "ring buffer released");
        self.shared.device.release()?;
        Ok(())
    }

    /// Attaches this ring buffer to `thread`, or detaches it with `None`.
    ///
    /// A running ring buffer is stopped before it moves to another thread.
    ///
    /// # Errors
    ///
    /// Returns `SlotTaken` if `thread` already drives another ring buffer in
    /// the same mode. The previous attachment is kept in that case.
    pub fn set_thread(&self, thread: Option<&RingBufferThread>) -> Result<(), RingBufferError> {
        let current = self.thread();
        if let (Some(current), Some(thread)) = (&current, thread) {
            if current.ptr_eq(thread) {
                return Ok(());
            }
        }

        if current.is_some() {
            self.stop()?;
        }
        if let Some(thread) = thread {
            thread.register(
                self.shared.mode,
                Arc::downgrade(&self.shared),
                self.shared.state.clone(),
            )?;
        }
        if let Some(current) = &current {
            current.unregister(self.shared.mode, Arc::as_ptr(&self.shared));
        }

        self.shared.control.lock().thread = thread.cloned();
        Ok(())
    }

    /// Takes (`true`) or releases (`false`) an activation of the attached thread.
    ///
    /// The thread's worker exists while at least one ring buffer holds an
    /// activation. [`start`](RingBuffer::start) activates implicitly;
    /// deactivating a running ring buffer stops it.
    ///
    /// # Errors
    ///
    /// Activation fails with `NoThread` without an attached thread and with
    /// `NotAcquired` before [`acquire`](RingBuffer::acquire).
    pub fn activate(&self, active: bool) -> Result<(), RingBufferError> {
        if !active {
            return self.stop();
        }

        let mut control = self.shared.control.lock();
        let thread = control.thread.clone().ok_or(RingBufferError::NoThread)?;
        if control.ring.is_none() {
            return Err(RingBufferError::NotAcquired);
        }
        if control.active {
            return Ok(());
        }
        thread.activate_slot(self.shared.mode, false)?;
        control.active = true;
        Ok(())
    }

    /// Moves to `Started`: the thread begins calling `process`.
    ///
    /// Does nothing if already started.
    ///
    /// # Errors
    ///
    /// Fails with `NoThread` without an attached thread and with `NotAcquired`
    /// before [`acquire`](RingBuffer::acquire). State and activation are
    /// unchanged on error.
    pub fn start(&self) -> Result<(), RingBufferError> {
        let mut control = self.shared.control.lock();
        let previous = self.shared.state();
        if previous == RingBufferState::Started {
            return Ok(());
        }

        let thread = control.thread.clone().ok_or(RingBufferError::NoThread)?;
        if control.ring.is_none() {
            return Err(RingBufferError::NotAcquired);
        }

        // The worker must observe Started as soon as it is let loose.
        self.shared.reset.clear();
        self.shared.store_state(RingBufferState::Started);
        if let Err(e) = thread.activate_slot(self.shared.mode, true) {
            self.shared.store_state(previous);
            return Err(e);
        }
        control.active = true;
        drop(control);

        self.shared.state_changed(previous, RingBufferState::Started);
        Ok(())
    }

    /// Moves a started ring buffer to `Paused`, interrupting the current transfer.
    ///
    /// Pausing a paused or stopped ring buffer does nothing. Never waits for
    /// the device.
    pub fn pause(&self) -> Result<(), RingBufferError> {
        let control = self.shared.control.lock();
        let previous = self.shared.state();
        if previous != RingBufferState::Started {
            return Ok(());
        }

        self.shared.store_state(RingBufferState::Paused);
        self.shared.interrupt();
        if let Some(thread) = &control.thread {
            thread.park_if_idle();
        }
        drop(control);

        self.shared.state_changed(previous, RingBufferState::Paused);
        Ok(())
    }

    /// Moves to `Stopped`, interrupting the current transfer and releasing
    /// the thread activation.
    ///
    /// The worker is joined when no other ring buffer keeps the thread active;
    /// this returns promptly as long as the device honours `reset`.
    pub fn stop(&self) -> Result<(), RingBufferError> {
        let mut control = self.shared.control.lock();
        let previous = self.shared.state();
        if previous != RingBufferState::Stopped {
            self.shared.store_state(RingBufferState::Stopped);
            self.shared.interrupt();
        }
        // Slot bookkeeping happens under the ring lock so a concurrent start
        // sees it complete; only the join waits until the lock is dropped.
        let was_active = std::mem::take(&mut control.active);
        let retired = control.thread.as_ref().and_then(|thread| {
            thread.park_if_idle();
            was_active
                .then(|| thread.deactivate_slot(self.shared.mode))
                .flatten()
                .map(|handle| (thread.clone(), handle))
        });
        drop(control);

        if let Some((thread, handle)) = retired {
            thread.join_worker(handle);
        }

        if previous != RingBufferState::Stopped {
            self.shared.underrunning.store(false, Ordering::Relaxed);
            self.shared.state_changed(previous, RingBufferState::Stopped);
        }
        Ok(())
    }

    /// Links two ring buffers operating the same duplex device.
    ///
    /// The association is mutual and only informational: the owning element
    /// reads it through [`linked`](RingBuffer::linked) to coordinate pause and
    /// stop. Relinking the same pair, or a ring buffer with itself, does nothing.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyLinked` if either ring buffer is linked to a third one.
    pub fn link(a: &RingBuffer, b: &RingBuffer) -> Result<(), RingBufferError> {
        if Arc::ptr_eq(&a.shared, &b.shared) {
            return Ok(());
        }

        // Lock in address order so concurrent links cannot deadlock.
        let (first, second) = if Arc::as_ptr(&a.shared) < Arc::as_ptr(&b.shared) {
            (&a.shared, &b.shared)
        } else {
            (&b.shared, &a.shared)
        };
        let mut first_peer = first.peer.lock();
        let mut second_peer = second.peer.lock();

        let linked_elsewhere = |peer: &Option<Weak<RingShared>>, other: &Arc<RingShared>| {
            peer.as_ref()
                .is_some_and(|peer| peer.strong_count() > 0 && !std::ptr::eq(peer.as_ptr(), Arc::as_ptr(other)))
        };
        if linked_elsewhere(&*first_peer, second) || linked_elsewhere(&*second_peer, first) {
            return Err(RingBufferError::AlreadyLinked);
        }

        *first_peer = Some(Arc::downgrade(second));
        *second_peer = Some(Arc::downgrade(first));
        tracing::debug!(
            a = a.shared.device.name(),
            b = b.shared.device.name(),
            "ring buffers linked"
        );
        Ok(())
    }

    /// Removes the link to the peer ring buffer, on both sides.
    pub fn unlink(&self) {
        let peer = self.shared.peer.lock().take();
        if let Some(peer) = peer.and_then(|peer| peer.upgrade()) {
            let mut back = peer.peer.lock();
            if back
                .as_ref()
                .is_some_and(|back| std::ptr::eq(back.as_ptr(), Arc::as_ptr(&self.shared)))
            {
                *back = None;
            }
        }
    }

    /// Returns the linked ring buffer, if it still exists.
    pub fn linked(&self) -> Option<RingBuffer> {
        self.shared
            .peer
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(RingBuffer::from_shared)
    }

    /// Queues bytes for playback without blocking.
    ///
    /// Returns how many bytes were accepted; fewer than `data.len()` means the
    /// ring is full.
    ///
    /// # Errors
    ///
    /// Fails with `WrongMode` on a capture ring buffer and `NotAcquired` before
    /// [`acquire`](RingBuffer::acquire).
    pub fn commit(&self, data: &[u8]) -> Result<usize, RingBufferError> {
        self.expect_mode(RingBufferMode::Playback)?;
        let ring = self.ring()?;
        let written = ring.producer.lock().push_slice(data);
        tracing::trace!(requested = data.len(), written, "ring buffer commit");
        Ok(written)
    }

    /// Reads captured bytes without blocking.
    ///
    /// Returns how many bytes were copied into `dest`.
    ///
    /// # Errors
    ///
    /// Fails with `WrongMode` on a playback ring buffer and `NotAcquired`
    /// before [`acquire`](RingBuffer::acquire).
    pub fn read(&self, dest: &mut [u8]) -> Result<usize, RingBufferError> {
        self.expect_mode(RingBufferMode::Capture)?;
        let ring = self.ring()?;
        let read = ring.consumer.lock().pop_slice(dest);
        tracing::trace!(requested = dest.len(), read, "ring buffer read");
        Ok(read)
    }

    /// Bytes the application can move right now: free space for playback,
    /// captured bytes for capture. 0 when not acquired.
    pub fn available(&self) -> usize {
        let Ok(ring) = self.ring() else {
            return 0;
        };
        match self.shared.mode {
            RingBufferMode::Playback => ring.producer.lock().vacant_len(),
            RingBufferMode::Capture => ring.consumer.lock().occupied_len(),
        }
    }

    /// Discards every byte waiting between the application and the device.
    pub fn clear(&self) {
        if let Ok(ring) = self.ring() {
            let dropped = ring.consumer.lock().clear();
            tracing::debug!(dropped, mode = ?self.shared.mode, "ring buffer cleared");
        }
    }

    /// Number of segments the device has transferred since acquire.
    pub fn segments_done(&self) -> u64 {
        self.shared.segments_done.load(Ordering::Relaxed)
    }

    fn expect_mode(&self, expected: RingBufferMode) -> Result<(), RingBufferError> {
        if self.shared.mode == expected {
            Ok(())
        } else {
            Err(RingBufferError::WrongMode {
                expected,
                actual: self.shared.mode,
            })
        }
    }

    fn ring(&self) -> Result<Arc<SegmentRing>, RingBufferError> {
        self.shared
            .control
            .lock()
            .ring
            .clone()
            .ok_or(RingBufferError::NotAcquired)
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("device", &self.shared.device.name())
            .field("mode", &self.shared.mode)
            .field("state", &self.shared.state())
            .field("segments_done", &self.segments_done())
            .finish_non_exhaustive()
    }
}

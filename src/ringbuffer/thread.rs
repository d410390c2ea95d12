//! The dedicated OS thread that drives ring buffer I/O.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Producer};

use crate::{DeviceError, RingBufferError, RingBufferEvent};

use super::{RingBuffer, RingBufferMode, RingBufferState, RingShared, SegmentRing};

struct Slot {
    ring: Weak<RingShared>,
    state: Arc<AtomicU8>,
    active: bool,
}

impl Slot {
    fn is_started(&self) -> bool {
        RingBufferState::from_u8(self.state.load(Ordering::Acquire)) == RingBufferState::Started
    }
}

#[derive(Default)]
struct ThreadControl {
    /// Indexed by [`RingBufferMode::index`].
    slots: [Option<Slot>; 2],
    running: bool,
    /// Bumped on every shutdown; a worker exits when it no longer matches.
    generation: u64,
    worker: Option<JoinHandle<()>>,
}

impl ThreadControl {
    fn any_active(&self) -> bool {
        self.slots.iter().flatten().any(|slot| slot.active)
    }

    fn any_started(&self) -> bool {
        self.slots.iter().flatten().any(Slot::is_started)
    }

    /// Started ring buffers, forgetting slots whose ring buffer is gone.
    fn started(&mut self) -> Vec<Arc<RingShared>> {
        let mut started = Vec::new();
        for slot in &mut self.slots {
            let Some(entry) = slot else {
                continue;
            };
            if !entry.is_started() {
                continue;
            }
            match entry.ring.upgrade() {
                Some(ring) => started.push(ring),
                None => *slot = None,
            }
        }
        started
    }
}

struct ThreadShared {
    name: String,
    control: Mutex<ThreadControl>,
    wakeup: Condvar,
}

/// A worker thread moving segments for up to one playback and one capture
/// ring buffer.
///
/// Two ring buffers on the same duplex device share one thread, so their
/// transfers are never concurrent. `RingBufferThread` is a handle: clones refer
/// to the same thread.
///
/// Ring buffers manage the thread through
/// [`RingBuffer::set_thread`](crate::RingBuffer::set_thread),
/// [`start`](crate::RingBuffer::start) and [`stop`](crate::RingBuffer::stop).
/// A worker activated directly with [`activate`](RingBufferThread::activate)
/// must be deactivated the same way.
///
/// # Example
///
/// ```
/// use stream_media::RingBufferThread;
///
/// let thread = RingBufferThread::new("duplex-io");
/// thread.activate(true)?;
/// assert!(thread.is_active());
/// thread.activate(false)?;
/// assert!(!thread.is_active());
/// # Ok::<(), stream_media::RingBufferError>(())
/// ```
#[derive(Clone)]
pub struct RingBufferThread {
    shared: Arc<ThreadShared>,
}

impl RingBufferThread {
    /// Creates an inactive thread. The OS thread gets `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(ThreadShared {
                name: name.into(),
                control: Mutex::new(ThreadControl::default()),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Returns the thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns `true` while the worker thread exists.
    pub fn is_active(&self) -> bool {
        self.shared.control.lock().worker.is_some()
    }

    /// Returns `true` between [`start`](RingBufferThread::start) and
    /// [`stop`](RingBufferThread::stop).
    pub fn is_running(&self) -> bool {
        self.shared.control.lock().running
    }

    /// Returns `true` if both handles refer to the same thread.
    pub fn ptr_eq(&self, other: &RingBufferThread) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Spawns (`true`) or shuts down and joins (`false`) the worker.
    ///
    /// Both directions are idempotent. Deactivating from the worker itself
    /// (for example inside an event callback) detaches it instead of joining.
    pub fn activate(&self, active: bool) -> Result<(), RingBufferError> {
        if active {
            let mut control = self.shared.control.lock();
            self.spawn_locked(&mut control)
        } else {
            self.shutdown();
            Ok(())
        }
    }

    /// Lets the worker call `process` for started ring buffers.
    ///
    /// # Errors
    ///
    /// Returns `ThreadNotActive` if the worker has not been spawned.
    pub fn start(&self) -> Result<(), RingBufferError> {
        let mut control = self.shared.control.lock();
        if control.worker.is_none() {
            return Err(RingBufferError::ThreadNotActive);
        }
        control.running = true;
        self.shared.wakeup.notify_all();
        Ok(())
    }

    /// Parks the worker after its current iteration.
    pub fn stop(&self) {
        let mut control = self.shared.control.lock();
        control.running = false;
        self.shared.wakeup.notify_all();
    }

    /// Parks the worker if no attached ring buffer is started.
    pub(super) fn park_if_idle(&self) {
        let mut control = self.shared.control.lock();
        if !control.any_started() {
            control.running = false;
        }
    }

    pub(super) fn register(
        &self,
        mode: RingBufferMode,
        ring: Weak<RingShared>,
        state: Arc<AtomicU8>,
    ) -> Result<(), RingBufferError> {
        let mut control = self.shared.control.lock();
        let slot = &mut control.slots[mode.index()];
        if let Some(existing) = slot {
            if existing.ring.strong_count() > 0 && !Weak::ptr_eq(&existing.ring, &ring) {
                return Err(RingBufferError::SlotTaken(mode));
            }
        }
        *slot = Some(Slot {
            ring,
            state,
            active: false,
        });
        tracing::debug!(thread = %self.shared.name, ?mode, "ring buffer attached");
        Ok(())
    }

    pub(super) fn unregister(&self, mode: RingBufferMode, ring: *const RingShared) {
        let idle = {
            let mut control = self.shared.control.lock();
            let slot = &mut control.slots[mode.index()];
            if slot
                .as_ref()
                .is_some_and(|slot| std::ptr::eq(slot.ring.as_ptr(), ring))
            {
                *slot = None;
                tracing::debug!(thread = %self.shared.name, ?mode, "ring buffer detached");
            }
            control.worker.is_some() && !control.any_active()
        };
        if idle {
            self.shutdown();
        }
    }

    /// Records that the ring buffer in `mode` holds an activation, spawning
    /// the worker for the first one. With `run` the worker is also let loose,
    /// under the same lock, so a concurrent deactivation cannot land between
    /// spawning and running.
    ///
    /// On error the slot keeps its previous activation.
    pub(super) fn activate_slot(
        &self,
        mode: RingBufferMode,
        run: bool,
    ) -> Result<(), RingBufferError> {
        let mut control = self.shared.control.lock();
        let Some(slot) = control.slots[mode.index()].as_mut() else {
            return Err(RingBufferError::NoThread);
        };
        let was_active = std::mem::replace(&mut slot.active, true);

        if let Err(e) = self.spawn_locked(&mut control) {
            if let Some(slot) = control.slots[mode.index()].as_mut() {
                slot.active = was_active;
            }
            return Err(e);
        }
        if run {
            control.running = true;
            self.shared.wakeup.notify_all();
        }
        Ok(())
    }

    /// Drops the activation held by the ring buffer in `mode`.
    ///
    /// After the last one the worker is told to exit and its handle is
    /// returned; pass it to [`join_worker`](RingBufferThread::join_worker)
    /// once no ring buffer lock is held.
    #[must_use]
    pub(super) fn deactivate_slot(&self, mode: RingBufferMode) -> Option<JoinHandle<()>> {
        let mut control = self.shared.control.lock();
        if let Some(slot) = control.slots[mode.index()].as_mut() {
            slot.active = false;
        }
        if control.any_active() {
            return None;
        }
        self.retire_locked(&mut control)
    }

    fn spawn_locked(&self, control: &mut ThreadControl) -> Result<(), RingBufferError> {
        if control.worker.is_some() {
            return Ok(());
        }

        let generation = control.generation;
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_worker(&shared, generation))
            .map_err(RingBufferError::ThreadSpawn)?;
        control.worker = Some(handle);
        tracing::debug!(thread = %self.shared.name, "ring buffer thread spawned");
        Ok(())
    }

    /// Tells the current worker to exit and takes its handle.
    fn retire_locked(&self, control: &mut ThreadControl) -> Option<JoinHandle<()>> {
        control.generation += 1;
        control.running = false;
        self.shared.wakeup.notify_all();
        control.worker.take()
    }

    /// Waits for a retired worker. Called from the worker itself (for example
    /// inside an event callback) it detaches instead.
    pub(super) fn join_worker(&self, handle: JoinHandle<()>) {
        if handle.thread().id() == thread::current().id() {
            tracing::debug!(thread = %self.shared.name, "ring buffer thread detached from itself");
            return;
        }
        if handle.join().is_err() {
            tracing::error!(thread = %self.shared.name, "ring buffer thread panicked");
        } else {
            tracing::debug!(thread = %self.shared.name, "ring buffer thread joined");
        }
    }

    fn shutdown(&self) {
        let handle = self.retire_locked(&mut self.shared.control.lock());
        if let Some(handle) = handle {
            self.join_worker(handle);
        }
    }
}

impl std::fmt::Debug for RingBufferThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferThread")
            .field("name", &self.shared.name)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// Worker loop: sleep until something is started, then move one segment for
/// each started ring buffer.
fn run_worker(shared: &ThreadShared, generation: u64) {
    tracing::debug!(thread = %shared.name, "ring buffer thread running");
    loop {
        let targets = {
            let mut control = shared.control.lock();
            loop {
                if control.generation != generation {
                    tracing::debug!(thread = %shared.name, "ring buffer thread exiting");
                    return;
                }
                if control.running {
                    let started = control.started();
                    if !started.is_empty() {
                        break started;
                    }
                }
                shared.wakeup.wait(&mut control);
            }
        };

        for ring in &targets {
            if shared.control.lock().generation != generation {
                break;
            }
            drive_segment(ring);
        }
    }
}

fn drive_segment(shared: &Arc<RingShared>) {
    if shared.state() != RingBufferState::Started {
        return;
    }
    let Some(ring) = shared.control.lock().ring.clone() else {
        return;
    };
    let mut segment = ring.segment.lock();

    match shared.mode {
        RingBufferMode::Playback => {
            let filled = ring.consumer.lock().pop_slice(&mut segment);
            if filled < segment.len() {
                let silence_bytes = segment.len() - filled;
                segment[filled..].fill(ring.spec.silence_byte);
                if !shared.underrunning.swap(true, Ordering::Relaxed) {
                    tracing::warn!(device = shared.device.name(), silence_bytes, "playback underrun");
                }
                shared.emit(RingBufferEvent::Underrun {
                    mode: shared.mode,
                    silence_bytes,
                });
            } else {
                shared.underrunning.store(false, Ordering::Relaxed);
            }

            // A device may accept part of the segment per call
            let mut written = 0;
            while written < segment.len() {
                let Some(n) = process_with_retry(shared, &ring, &mut segment[written..]) else {
                    return;
                };
                written += n;
            }
            shared.segments_done.fetch_add(1, Ordering::Relaxed);
        }
        RingBufferMode::Capture => {
            let Some(captured) = process_with_retry(shared, &ring, &mut segment) else {
                return;
            };
            let pushed = ring.producer.lock().push_slice(&segment[..captured]);
            if pushed < captured {
                let dropped_bytes = captured - pushed;
                tracing::warn!(device = shared.device.name(), dropped_bytes, "capture overflow");
                shared.emit(RingBufferEvent::Overflow { dropped_bytes });
            }
            shared.segments_done.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Calls `process` until it succeeds, the ring buffer leaves `Started`, or
/// the retry budget is spent. Returns the bytes transferred on success; a
/// transfer of zero bytes counts as a failure.
fn process_with_retry(
    shared: &Arc<RingShared>,
    ring: &SegmentRing,
    segment: &mut [u8],
) -> Option<usize> {
    let max_attempts = ring.spec.process_retry_attempts.max(1);
    let mut attempts = 0;
    let mut delay = ring.spec.process_retry_delay;

    loop {
        if shared.state() != RingBufferState::Started {
            return None;
        }

        let result = match shared.device.process(segment, &shared.reset) {
            Ok(0) => Err(DeviceError::io("device transferred no bytes")),
            other => other,
        };
        match result {
            Ok(transferred) => return Some(transferred.min(segment.len())),
            Err(DeviceError::Interrupted) => return None,
            Err(_) if shared.reset.is_reset() => return None,
            Err(e) => {
                attempts += 1;
                tracing::warn!(
                    device = shared.device.name(),
                    error = %e,
                    attempt = attempts,
                    "device process failed"
                );
                shared.emit(RingBufferEvent::DeviceError {
                    mode: shared.mode,
                    error: e.to_string(),
                    attempt: attempts,
                });

                if attempts >= max_attempts {
                    tracing::error!(
                        device = shared.device.name(),
                        error = %e,
                        "device failed, pausing ring buffer"
                    );
                    shared.emit(RingBufferEvent::DeviceFailed {
                        mode: shared.mode,
                        error: e.to_string(),
                    });
                    if let Err(e) = RingBuffer::from_shared(shared.clone()).pause() {
                        tracing::error!(error = %e, "failed to pause ring buffer");
                    }
                    return None;
                }

                // Exponential backoff, cut short by a reset
                if shared.reset.wait_timeout(delay) {
                    return None;
                }
                delay = delay.saturating_mul(2);
            }
        }
    }
}

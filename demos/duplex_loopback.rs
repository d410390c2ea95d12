//! Duplex loopback example.
//!
//! Plays a tone through a mock duplex device, captures it back on the same
//! ring buffer thread, and reslices the captured bytes into 20ms frames with
//! an adapter.
//!
//! Run with: cargo run --example duplex_loopback
//! Set RUST_LOG=stream_media=debug to see thread and state transitions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stream_media::{
    event_callback, Adapter, Buffer, MockDevice, RingBuffer, RingBufferEvent, RingBufferMode,
    RingBufferSpec, RingBufferThread,
};
use tracing_subscriber::EnvFilter;

const RATE: u32 = 48000;
const CHANNELS: u16 = 2;
const FRAME: Duration = Duration::from_millis(20);

fn tone(frequency: f64, duration: Duration) -> Vec<u8> {
    let frames = (f64::from(RATE) * duration.as_secs_f64()) as usize;
    let mut bytes = Vec::with_capacity(frames * usize::from(CHANNELS) * 2);
    for i in 0..frames {
        let t = i as f64 / f64::from(RATE);
        let sample = ((2.0 * std::f64::consts::PI * frequency * t).sin() * 16000.0) as i16;
        for _ in 0..CHANNELS {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
    }
    bytes
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let spec = RingBufferSpec::from_format(
        RATE,
        CHANNELS,
        2,
        Duration::from_millis(10),
        Duration::from_millis(100),
    );
    println!(
        "Segments: {} x {} bytes ({:?} buffered)",
        spec.segment_total,
        spec.segment_size,
        spec.buffer_duration()
    );

    // Pace the mock like real hardware: one segment per segment duration
    let (playback_device, capture_device) = MockDevice::loopback_pair("loopback");
    let pace = Some(spec.segment_duration());
    let playback_device = Arc::new(playback_device.with_pace(pace));
    let capture_device = Arc::new(capture_device.with_pace(pace));

    let underruns = Arc::new(AtomicU64::new(0));
    let underruns_clone = underruns.clone();
    let on_event = event_callback(move |event| match event {
        RingBufferEvent::Underrun { .. } => {
            underruns_clone.fetch_add(1, Ordering::Relaxed);
        }
        RingBufferEvent::DeviceFailed { mode, error } => {
            eprintln!("{mode:?} device failed: {error}");
        }
        _ => {}
    });

    let playback = RingBuffer::new(RingBufferMode::Playback, playback_device)
        .with_event_callback(on_event.clone());
    let capture =
        RingBuffer::new(RingBufferMode::Capture, capture_device).with_event_callback(on_event);
    RingBuffer::link(&playback, &capture)?;

    let thread = RingBufferThread::new("duplex-io");
    for ring in [&playback, &capture] {
        ring.open_device()?;
        ring.acquire(spec.clone())?;
        ring.set_thread(Some(&thread))?;
    }

    let signal = tone(440.0, Duration::from_secs(1));
    let frame_bytes = (f64::from(RATE) * FRAME.as_secs_f64()) as usize * usize::from(CHANNELS) * 2;
    let mut pending = &signal[..];
    let mut adapter = Adapter::new();
    let mut frames = 0;
    let mut loud_frames = 0;

    playback.start()?;
    capture.start()?;
    println!("Looping back 1s of 440Hz...");

    let deadline = Instant::now() + Duration::from_millis(1500);
    let mut scratch = vec![0u8; spec.segment_size];
    while Instant::now() < deadline {
        if !pending.is_empty() {
            let written = playback.commit(pending)?;
            pending = &pending[written..];
        }

        let read = capture.read(&mut scratch)?;
        if read > 0 {
            adapter.push(Buffer::from_vec(scratch[..read].to_vec()));
        }
        while adapter.available() >= frame_bytes {
            let frame = adapter.take_buffer(frame_bytes)?;
            frames += 1;
            if frame.as_slice().iter().any(|&b| b != 0) {
                loud_frames += 1;
            }
        }

        std::thread::sleep(Duration::from_millis(2));
    }

    // Stop both sides of the duplex device together
    if let Some(peer) = playback.linked() {
        peer.stop()?;
    }
    playback.stop()?;

    println!(
        "Captured {frames} frames of {FRAME:?} ({loud_frames} with signal), \
         {} segments played, {} underrun segments",
        playback.segments_done(),
        underruns.load(Ordering::Relaxed)
    );

    for ring in [&playback, &capture] {
        ring.close_device()?;
    }
    Ok(())
}

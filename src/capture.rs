//! Frame capture pipeline
//!
//! The producer runs in the driver's receive interrupt: it copies the frame
//! into a bounded lock-free ring and wakes the consumer, dropping the frame
//! when the ring is full. The consumer thread drains the ring, stamps and
//! formats each frame, and hands the line to a `LineSink`. It waits at most
//! one poll interval at a time so it notices a stop request without traffic.

use std::fmt::Write as _;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use crossbeam::queue::ArrayQueue;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::driver::FrameSource;
use crate::error::{Result, TwaiError};
use crate::frame::TwaiFrame;
use crate::structures::{CaptureSettings, TimestampMode};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Microseconds on the process-wide monotonic clock
///
/// The epoch is fixed on first use; `Twai::new` takes that first reading so
/// the receive interrupt never initializes it.
pub fn monotonic_us() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// A received frame with its capture time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedFrame {
    pub frame: TwaiFrame,
    /// Monotonic capture time in microseconds
    pub timestamp_us: u64,
}

/// Destination of formatted capture lines
pub trait LineSink: Send + Sync {
    /// Emit one line (newline included)
    fn emit(&self, line: &str);
}

impl<F> LineSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn emit(&self, line: &str) {
        self(line)
    }
}

/// Writes lines to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl LineSink for StdoutSink {
    fn emit(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        // Console output is best effort
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

/// Keeps lines in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines emitted so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl LineSink for MemorySink {
    fn emit(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Computes the timestamp prefix of each captured frame
#[derive(Debug, Clone, Copy)]
pub struct TimestampFormatter {
    mode: TimestampMode,
    start_us: u64,
    last_us: Option<u64>,
}

impl TimestampFormatter {
    /// Create a formatter for a capture started at `start_us`
    pub fn new(mode: TimestampMode, start_us: u64) -> Self {
        Self {
            mode,
            start_us,
            last_us: None,
        }
    }

    /// Timestamp to print for a frame captured at `timestamp_us`
    pub fn stamp(&mut self, timestamp_us: u64) -> Option<u64> {
        match self.mode {
            TimestampMode::None => None,
            TimestampMode::Absolute => Some(timestamp_us),
            TimestampMode::Delta => {
                let delta = self
                    .last_us
                    .map_or(0, |last| timestamp_us.saturating_sub(last));
                self.last_us = Some(timestamp_us);
                Some(delta)
            }
            TimestampMode::ZeroRelative => Some(timestamp_us.saturating_sub(self.start_us)),
        }
    }
}

/// Render one capture line
///
/// `(sec.usec) twai<N>  <ID>  [<len>]  <byte>  <byte>...` with the prefix
/// omitted when `stamp_us` is None. Remote frames show `[R<dlc>]` and no
/// bytes.
pub fn format_capture_line(controller: usize, frame: &TwaiFrame, stamp_us: Option<u64>) -> String {
    let mut line = String::with_capacity(48 + frame.data_len() * 4);
    // Writing into a String cannot fail
    let _ = write_capture_line(&mut line, controller, frame, stamp_us);
    line
}

fn write_capture_line(
    out: &mut String,
    controller: usize,
    frame: &TwaiFrame,
    stamp_us: Option<u64>,
) -> std::fmt::Result {
    if let Some(us) = stamp_us {
        write!(out, "({}.{:06}) ", us / 1_000_000, us % 1_000_000)?;
    }
    write!(out, "twai{}  ", controller)?;
    if frame.is_extended() {
        write!(out, "{:08X}  ", frame.id())?;
    } else {
        write!(out, "{:03X}  ", frame.id())?;
    }
    if frame.is_remote() {
        write!(out, "[R{}]", frame.dlc())?;
    } else {
        let len = frame.dlc_length();
        write!(out, "[{}]", len)?;
        for byte in &frame.padded_data()[..len] {
            write!(out, "  {:02X}", byte)?;
        }
    }
    out.push('\n');
    Ok(())
}

/// Bounded ring between the producer and the consumer
pub(crate) struct FrameRing {
    queue: ArrayQueue<CapturedFrame>,
    dropped: AtomicU64,
    consumer: OnceLock<Thread>,
}

impl FrameRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
            consumer: OnceLock::new(),
        }
    }

    /// Non-blocking enqueue; a full ring drops the frame
    pub(crate) fn push(&self, frame: CapturedFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => {
                if let Some(consumer) = self.consumer.get() {
                    consumer.unpark();
                }
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<CapturedFrame> {
        self.queue.pop()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn wake_consumer(&self) {
        if let Some(consumer) = self.consumer.get() {
            consumer.unpark();
        }
    }
}

/// Capture state of one controller
pub(crate) struct CaptureState {
    running: AtomicBool,
    ring: RwLock<Option<Arc<FrameRing>>>,
    exited: Mutex<Option<Receiver<()>>>,
    last_dropped: AtomicU64,
}

impl CaptureState {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            ring: RwLock::new(None),
            exited: Mutex::new(None),
            last_dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Frames dropped by the current capture, or by the last one
    pub(crate) fn dropped(&self) -> u64 {
        match self.ring.read().as_ref() {
            Some(ring) => ring.dropped(),
            None => self.last_dropped.load(Ordering::Relaxed),
        }
    }

    /// Producer; runs in the driver's receive interrupt
    ///
    /// Never blocks, allocates or logs.
    pub(crate) fn on_receive(&self, source: &dyn FrameSource) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let Some(frame) = source.receive_non_blocking() else {
            return;
        };
        let captured = CapturedFrame {
            frame,
            timestamp_us: monotonic_us(),
        };
        // A writer holds the lock only while swapping rings; drop the frame then
        if let Some(slot) = self.ring.try_read() {
            if let Some(ring) = slot.as_ref() {
                ring.push(captured);
            }
        }
    }

    /// Start the consumer thread for `controller`
    ///
    /// # Arguments
    /// * `controller` - Controller id printed on every line
    /// * `mode` - Timestamp mode
    /// * `settings` - Ring depth, poll interval and consumer stack size
    /// * `sink` - Where lines go
    pub(crate) fn start(
        self: &Arc<Self>,
        controller: usize,
        mode: TimestampMode,
        settings: &CaptureSettings,
        sink: Arc<dyn LineSink>,
    ) -> Result<()> {
        if self.is_running() {
            warn!("twai{}: dump is already running", controller);
            return Ok(());
        }
        {
            let mut exited = self.exited.lock();
            if let Some(rx) = exited.as_ref() {
                if let Err(TryRecvError::Empty) = rx.try_recv() {
                    return Err(TwaiError::invalid_state(format!(
                        "twai{}: previous dump task has not exited yet",
                        controller
                    )));
                }
                *exited = None;
            }
        }

        let ring = Arc::new(FrameRing::new(settings.queue_depth));
        *self.ring.write() = Some(Arc::clone(&ring));
        let (exit_tx, exit_rx) = bounded(1);
        self.running.store(true, Ordering::Release);

        let state = Arc::clone(self);
        let formatter = TimestampFormatter::new(mode, monotonic_us());
        let poll = settings.poll_interval;
        let spawned = thread::Builder::new()
            .name(format!("twai{}-dump", controller))
            .stack_size(settings.stack_size)
            .spawn(move || state.run_consumer(controller, ring, formatter, poll, sink, exit_tx));

        match spawned {
            Ok(_) => {
                *self.exited.lock() = Some(exit_rx);
                info!(
                    "twai{}: dump started (queue {}, timestamps '{}')",
                    controller,
                    settings.queue_depth,
                    mode.selector()
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                *self.ring.write() = None;
                error!("twai{}: cannot create dump task: {}", controller, e);
                Err(TwaiError::ResourceExhausted(format!(
                    "twai{}: dump task: {}",
                    controller, e
                )))
            }
        }
    }

    /// Request the consumer to stop and wait up to `timeout` for it
    pub(crate) fn stop(&self, controller: usize, timeout: Duration) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            debug!("twai{}: dump is not running", controller);
            return Ok(());
        }
        if let Some(ring) = self.ring.read().as_ref() {
            ring.wake_consumer();
        }

        let Some(rx) = self.exited.lock().take() else {
            return Ok(());
        };
        match rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("twai{}: dump stopped", controller);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                *self.exited.lock() = Some(rx);
                error!(
                    "twai{}: dump task did not exit within {} ms",
                    controller,
                    timeout.as_millis()
                );
                Err(TwaiError::Timeout {
                    operation: "dump stop",
                    timeout,
                })
            }
        }
    }

    fn run_consumer(
        &self,
        controller: usize,
        ring: Arc<FrameRing>,
        mut formatter: TimestampFormatter,
        poll: Duration,
        sink: Arc<dyn LineSink>,
        exit_tx: Sender<()>,
    ) {
        let _ = ring.consumer.set(thread::current());
        debug!("twai{}: dump task running", controller);

        while self.running.load(Ordering::Acquire) {
            match ring.pop() {
                Some(captured) => {
                    let stamp = formatter.stamp(captured.timestamp_us);
                    sink.emit(&format_capture_line(controller, &captured.frame, stamp));
                }
                None => thread::park_timeout(poll),
            }
        }

        // Release the ring unless a newer capture already replaced it
        {
            let mut slot = self.ring.write();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &ring)) {
                *slot = None;
            }
        }
        let dropped = ring.dropped();
        self.last_dropped.store(dropped, Ordering::Relaxed);
        if dropped > 0 {
            warn!("twai{}: {} frame(s) dropped, queue full", controller, dropped);
        }
        debug!("twai{}: dump task exiting", controller);
        let _ = exit_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured(id: u32, data: &[u8], timestamp_us: u64) -> CapturedFrame {
        CapturedFrame {
            frame: TwaiFrame::with_data(id, false, data).unwrap(),
            timestamp_us,
        }
    }

    #[test]
    fn test_line_standard_frame() {
        let frame = TwaiFrame::with_data(0x123, false, &[0xAA, 0xBB]).unwrap();
        assert_eq!(
            format_capture_line(0, &frame, None),
            "twai0  123  [2]  AA  BB\n"
        );
        assert_eq!(
            format_capture_line(1, &frame, Some(1_500_002)),
            "(1.500002) twai1  123  [2]  AA  BB\n"
        );
    }

    #[test]
    fn test_line_extended_remote_frame() {
        let frame = TwaiFrame::remote(0xABC, true, 4).unwrap();
        assert_eq!(
            format_capture_line(0, &frame, None),
            "twai0  00000ABC  [R4]\n"
        );
    }

    #[test]
    fn test_line_fd_frame_shows_padding() {
        let frame = TwaiFrame::with_fd_data(0x10, false, &[1; 10], false).unwrap();
        let line = format_capture_line(0, &frame, None);
        assert!(line.starts_with("twai0  010  [12]  01"));
        assert!(line.ends_with("  01  01  00  00\n"));
    }

    #[test]
    fn test_delta_starts_at_zero() {
        let mut stamps = TimestampFormatter::new(TimestampMode::Delta, 100);
        assert_eq!(stamps.stamp(1_000), Some(0));
        assert_eq!(stamps.stamp(1_250), Some(250));
        assert_eq!(stamps.stamp(2_000), Some(750));
    }

    #[test]
    fn test_zero_relative_keeps_reference() {
        let mut stamps = TimestampFormatter::new(TimestampMode::ZeroRelative, 100);
        assert_eq!(stamps.stamp(1_000), Some(900));
        assert_eq!(stamps.stamp(2_000), Some(1_900));

        let mut stamps = TimestampFormatter::new(TimestampMode::Absolute, 100);
        assert_eq!(stamps.stamp(2_000), Some(2_000));
        let mut stamps = TimestampFormatter::new(TimestampMode::None, 100);
        assert_eq!(stamps.stamp(2_000), None);
    }

    #[test]
    fn test_full_ring_drops_newest() {
        let ring = FrameRing::new(4);
        for id in 1..=5 {
            ring.push(captured(id, &[id as u8], id as u64));
        }
        assert_eq!(ring.dropped(), 1);
        let ids: Vec<u32> = std::iter::from_fn(|| ring.pop())
            .map(|c| c.frame.id())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_ring_preserves_order_across_threads() {
        let ring = Arc::new(FrameRing::new(8));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for id in 0..500u32 {
                    while !ring.push(captured(id, &[], 0)) {
                        thread::yield_now();
                    }
                }
            })
        };
        let mut seen = Vec::with_capacity(500);
        while seen.len() < 500 {
            match ring.pop() {
                Some(c) => seen.push(c.frame.id()),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    /// Hands out one frame per receive interrupt
    struct OneFrame(std::cell::Cell<Option<TwaiFrame>>);

    impl FrameSource for OneFrame {
        fn receive_non_blocking(&self) -> Option<TwaiFrame> {
            self.0.take()
        }
    }

    #[test]
    fn test_frames_before_consumer_runs_keep_queue_capacity() {
        let state = Arc::new(CaptureState::new());
        let ring = Arc::new(FrameRing::new(4));
        *state.ring.write() = Some(Arc::clone(&ring));
        state.running.store(true, Ordering::Release);

        // Nothing has been dequeued yet
        for id in 1..=5u32 {
            let source = OneFrame(std::cell::Cell::new(Some(
                TwaiFrame::with_data(id, false, &[id as u8]).unwrap(),
            )));
            state.on_receive(&source);
        }
        assert_eq!(state.dropped(), 1);

        let sink = Arc::new(MemorySink::new());
        let (exit_tx, exit_rx) = bounded(1);
        let consumer = {
            let state = Arc::clone(&state);
            let ring = Arc::clone(&ring);
            let sink: Arc<dyn LineSink> = sink.clone();
            let formatter = TimestampFormatter::new(TimestampMode::None, 0);
            thread::spawn(move || {
                state.run_consumer(0, ring, formatter, Duration::from_millis(5), sink, exit_tx)
            })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.lines().len() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(20));
        state.running.store(false, Ordering::Release);
        ring.wake_consumer();
        exit_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        consumer.join().unwrap();

        let lines = sink.lines();
        assert_eq!(
            lines,
            vec![
                "twai0  001  [1]  01\n",
                "twai0  002  [1]  02\n",
                "twai0  003  [1]  03\n",
                "twai0  004  [1]  04\n",
            ]
        );
        assert_eq!(state.dropped(), 1);
        assert!(state.ring.read().is_none());
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let state = CaptureState::new();
        assert!(state.stop(0, Duration::from_millis(10)).is_ok());
        assert!(!state.is_running());
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn test_spawn_failure_rolls_back() {
        let state = Arc::new(CaptureState::new());
        let settings = CaptureSettings {
            stack_size: 1 << 50,
            ..CaptureSettings::default()
        };
        let err = state
            .start(0, TimestampMode::None, &settings, Arc::new(MemorySink::new()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ResourceExhausted);
        assert!(!state.is_running());
        assert!(state.ring.read().is_none());
    }
}

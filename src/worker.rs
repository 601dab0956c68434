//! Channel worker & lifecycle (C6): one thread per active streaming
//! channel, owning a [`crate::reader::FrameReader`] and a processor,
//! cooperatively stoppable.
//!
//! Thread-per-unit-of-work and a clone-able cancellation token follow
//! `src/mtgraph.rs`'s `MTGraph::run` shape (named `std::thread::Builder`
//! threads, a token checked each loop iteration); reimplemented here over
//! a single `Arc<AtomicBool>` for one worker instead of a whole
//! multi-block graph, since this driver has no dataflow graph to schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::error::DriverError;
use crate::histogram_processor::HistogramProcessor;
use crate::image_processor::ImageProcessor;
use crate::metrics::{MemoryEstimator, ProcTimeEstimator, RateEstimator, TotalCounts};
use crate::parambus::ParamBus;
use crate::reader::{Frame, FrameReader};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Reconnect backoff, per spec.md §4.2.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// Granularity at which a cancelable sleep rechecks the token, so
/// cancellation is observed well within the ≤1s quantum spec.md §5 requires.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Per-channel cooperative stop signal. Clone-able; every clone shares the
/// same underlying flag (`src/mtgraph.rs`'s `CancellationToken` usage
/// pattern, reimplemented over `Arc<AtomicBool>`).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, not-yet-canceled token.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`Self::cancel`] has been called.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn sleep_cancelable(total: Duration, token: &CancelToken) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if token.is_canceled() {
            return;
        }
        std::thread::sleep(CANCEL_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// The channel's per-frame decoder, one of the two C4/C5 instantiations
/// spec.md §9 asks to unify behind one generic worker shape.
pub enum ChannelProcessor {
    /// An image-streaming channel (C4).
    Image(ImageProcessor),
    /// A histogram-streaming channel (C5).
    Histogram(HistogramProcessor),
}

impl ChannelProcessor {
    fn process(
        &mut self,
        frame: Frame,
        accumulation_enabled: bool,
        prefix: &str,
        bus: &dyn ParamBus,
    ) -> Result<(i64, f64, u64, Duration, usize), DriverError> {
        match (self, frame) {
            (ChannelProcessor::Image(p), Frame::Image { header, payload }) => {
                let o = p.process(&header, &payload, accumulation_enabled, prefix, bus)?;
                Ok((o.frame_number, o.time_at_frame, o.frame_total, o.processing_time, o.memory_bytes))
            }
            (ChannelProcessor::Histogram(p), Frame::Histogram { header, payload }) => {
                let o = p.process(&header, &payload, accumulation_enabled, prefix, bus)?;
                Ok((o.frame_number, o.time_at_frame, o.frame_total, o.processing_time, o.memory_bytes))
            }
            (ChannelProcessor::Image(_), Frame::Histogram { header, .. }) => Err(DriverError::BadHeader(
                format!("histogram frame on image channel: frameNumber={}", header.frame_number),
            )),
            (ChannelProcessor::Histogram(_), Frame::Image { header, .. }) => Err(DriverError::BadHeader(
                format!("image frame on histogram channel: frameNumber={}", header.frame_number),
            )),
        }
    }

    fn reset(&mut self) {
        match self {
            ChannelProcessor::Image(p) => p.reset(),
            ChannelProcessor::Histogram(p) => p.reset(),
        }
    }

    fn fill_ratio(&self) -> f64 {
        match self {
            ChannelProcessor::Image(p) => p.fill_ratio(),
            ChannelProcessor::Histogram(p) => p.fill_ratio(),
        }
    }

    fn set_frames_to_sum(&mut self, n: usize, prefix: &str, bus: &dyn ParamBus) {
        match self {
            ChannelProcessor::Image(p) => p.set_frames_to_sum(n, prefix, bus),
            ChannelProcessor::Histogram(p) => p.set_frames_to_sum(n, prefix, bus),
        }
    }
}

/// Shared metrics/processor state, guarded by one mutex per spec.md §5
/// ("each channel has a single mutex guarding... accumulators, frame
/// buffer, rate and processing-time sample windows...").
struct SharedState {
    processor: ChannelProcessor,
    rate: RateEstimator,
    proc_time: ProcTimeEstimator,
    total_counts: TotalCounts,
    memory: MemoryEstimator,
    connected: bool,
}

/// A running (or recently stopped) channel worker: the thread handle plus
/// the handles needed to observe/stop it.
pub struct WorkerHandle {
    cancel: CancelToken,
    shared: Arc<Mutex<SharedState>>,
    join: Option<JoinHandle<()>>,
    prefix: String,
    bus: Arc<dyn ParamBus>,
}

impl WorkerHandle {
    /// Request a cooperative stop and block until the worker thread exits.
    /// `stop ∘ stop` is idempotent: calling this twice is harmless.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Snapshot of the published rate, for tests/diagnostics.
    pub fn rate(&self) -> f64 {
        self.shared.lock().unwrap().rate.rate()
    }

    /// Snapshot of the running total-counts value.
    pub fn total_counts(&self) -> u64 {
        self.shared.lock().unwrap().total_counts.value()
    }

    /// Whether the socket is currently connected.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().connected
    }

    /// Resize the rolling window mid-run: trims the buffer from the head
    /// and republishes the window sum immediately, without restarting the
    /// worker (spec.md §4.4's `frames_to_sum`-lowered-mid-run tie-break).
    pub fn set_frames_to_sum(&self, n: usize) {
        let mut guard = self.shared.lock().unwrap();
        guard.processor.set_frames_to_sum(n, &self.prefix, self.bus.as_ref());
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a worker thread that connects to `host:port`, decodes frames with
/// `processor`, and publishes under `{prefix}:*` names on `bus` until
/// stopped. `accumulation_enabled` is fixed for the worker's lifetime;
/// callers that need to change it restart the worker.
pub fn spawn(
    host: String,
    port: u16,
    processor: ChannelProcessor,
    accumulation_enabled: bool,
    prefix: String,
    bus: Arc<dyn ParamBus>,
) -> WorkerHandle {
    let cancel = CancelToken::new();
    let shared = Arc::new(Mutex::new(SharedState {
        processor,
        rate: RateEstimator::new(),
        proc_time: ProcTimeEstimator::new(),
        total_counts: TotalCounts::new(),
        memory: MemoryEstimator::new(),
        connected: false,
    }));

    let thread_cancel = cancel.clone();
    let thread_shared = shared.clone();
    let thread_name = format!("tpx3-worker-{prefix}");
    let handle_prefix = prefix.clone();
    let handle_bus = bus.clone();
    let join = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || run(thread_cancel, thread_shared, host, port, accumulation_enabled, prefix, bus))
        .expect("spawning worker thread");

    WorkerHandle {
        cancel,
        shared,
        join: Some(join),
        prefix: handle_prefix,
        bus: handle_bus,
    }
}

fn run(
    cancel: CancelToken,
    shared: Arc<Mutex<SharedState>>,
    host: String,
    port: u16,
    accumulation_enabled: bool,
    prefix: String,
    bus: Arc<dyn ParamBus>,
) {
    let mut reader: Option<FrameReader> = None;
    while !cancel.is_canceled() {
        if reader.is_none() {
            match FrameReader::connect(&host, port, CONNECT_TIMEOUT) {
                Ok(r) => {
                    reader = Some(r);
                    shared.lock().unwrap().connected = true;
                    info!("{prefix}: connected to {host}:{port}");
                }
                Err(e) => {
                    warn!("{prefix}: connect to {host}:{port} failed: {e}");
                    sleep_cancelable(RECONNECT_BACKOFF, &cancel);
                    continue;
                }
            }
        }
        if cancel.is_canceled() {
            break;
        }
        let frame = reader.as_mut().expect("just ensured Some").read_frame();
        match frame {
            Ok(frame) => handle_frame(&shared, &prefix, &bus, accumulation_enabled, frame),
            // Peer close, a short payload on early close, and any other
            // socket-level read error (surfaced as `Transient` via
            // `From<std::io::Error>`) all mean this connection is no
            // longer usable — disconnect and reconnect with the same
            // backoff, per spec.md §4.2: "any other error transitions to
            // stopped." `BadHeader` is the one frame-level exception
            // (spec.md §4.3): the connection stays up and the next
            // `read_frame` call just picks up the next frame.
            Err(e @ (DriverError::PeerClosed | DriverError::ShortPayload { .. } | DriverError::Transient(_))) => {
                warn!("{prefix}: connection error, will reconnect: {e}");
                reader = None;
                shared.lock().unwrap().connected = false;
                if !cancel.is_canceled() {
                    sleep_cancelable(RECONNECT_BACKOFF, &cancel);
                }
            }
            Err(e) => {
                warn!("{prefix}: dropping frame: {e}");
            }
        }
    }
    finish(&shared, &prefix, &bus);
}

fn handle_frame(
    shared: &Arc<Mutex<SharedState>>,
    prefix: &str,
    bus: &Arc<dyn ParamBus>,
    accumulation_enabled: bool,
    frame: Frame,
) {
    let now = Instant::now();
    let mut guard = shared.lock().unwrap();
    match guard.processor.process(frame, accumulation_enabled, prefix, bus.as_ref()) {
        Ok((frame_number, _time_at_frame, frame_total, processing_time, memory_bytes)) => {
            if let Some(loss) = guard.rate.observe(frame_number, now) {
                warn!(
                    "{prefix}: frame loss, expected {} got {}",
                    loss.expected, loss.got
                );
                bus.set_string(
                    &format!("{prefix}:Message"),
                    &format!("lost {} frames", loss.got - loss.expected),
                );
            }
            if guard.rate.should_publish(now) {
                bus.set_scalar(&format!("{prefix}:Rate"), guard.rate.rate());
            }
            guard.proc_time.observe(processing_time);
            if guard.proc_time.should_publish(now) {
                bus.set_scalar(&format!("{prefix}:ProcTimeMs"), guard.proc_time.value_ms());
            }
            guard.total_counts.add(frame_total);
            bus.set_scalar(&format!("{prefix}:TotalCounts"), guard.total_counts.value() as f64);

            let fill_ratio = guard.processor.fill_ratio();
            if guard.memory.should_recompute(now, fill_ratio) {
                guard.memory.record(now, memory_bytes);
                bus.set_scalar(&format!("{prefix}:MemoryMiB"), guard.memory.last_mib());
            }
        }
        Err(e) => {
            warn!("{prefix}: dropping frame: {e}");
        }
    }
}

fn finish(shared: &Arc<Mutex<SharedState>>, prefix: &str, bus: &Arc<dyn ParamBus>) {
    let mut guard = shared.lock().unwrap();
    guard.processor.reset();
    guard.rate.reset();
    guard.proc_time.reset();
    guard.connected = false;
    bus.set_scalar(&format!("{prefix}:Rate"), 0.0);
    info!("{prefix}: worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parambus::RecordingParamBus;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn worker_processes_frames_and_stops_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for i in 0..5u16 {
                let header = format!("{{\"width\":1,\"height\":1,\"frameNumber\":{i}}}\n");
                stream.write_all(header.as_bytes()).unwrap();
                stream.write_all(&i.to_be_bytes()).unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
            // Keep the connection open until the test cancels the worker;
            // dropping `stream` here would race the assertions below.
            std::thread::sleep(Duration::from_millis(200));
        });

        let bus: Arc<dyn ParamBus> = Arc::new(RecordingParamBus::new());
        let processor = ChannelProcessor::Image(ImageProcessor::new(10, 1));
        let mut handle = spawn(
            addr.ip().to_string(),
            addr.port(),
            processor,
            true,
            "Img".to_string(),
            bus.clone(),
        );

        std::thread::sleep(Duration::from_millis(100));
        assert!(handle.is_connected());
        assert_eq!(handle.total_counts(), 0 + 1 + 2 + 3 + 4);

        handle.stop();
        assert!(!handle.is_connected());
        server.join().unwrap();
    }

    #[test]
    fn set_frames_to_sum_resizes_window_without_restarting() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for i in 1u16..=5 {
                let header = format!("{{\"width\":1,\"height\":1,\"frameNumber\":{i}}}\n");
                stream.write_all(header.as_bytes()).unwrap();
                stream.write_all(&i.to_be_bytes()).unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
            std::thread::sleep(Duration::from_millis(200));
        });

        let bus = Arc::new(RecordingParamBus::new());
        let bus_dyn: Arc<dyn ParamBus> = bus.clone();
        let processor = ChannelProcessor::Image(ImageProcessor::new(5, 1));
        let handle = spawn(
            addr.ip().to_string(),
            addr.port(),
            processor,
            true,
            "Img".to_string(),
            bus_dyn,
        );

        std::thread::sleep(Duration::from_millis(80));
        handle.set_frames_to_sum(2);
        // Pixel-0 sum of the last 2 of [1,2,3,4,5] is 9, published
        // immediately by the resize call itself.
        assert_eq!(bus.last_array_u64("Img:WindowSum"), Some(vec![9]));
    }

    #[test]
    fn stop_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let _ = listener.accept();
            std::thread::sleep(Duration::from_millis(100));
        });
        let bus: Arc<dyn ParamBus> = Arc::new(RecordingParamBus::new());
        let processor = ChannelProcessor::Image(ImageProcessor::new(10, 1));
        let mut handle = spawn(addr.ip().to_string(), addr.port(), processor, true, "Img".into(), bus);
        handle.stop();
        handle.stop();
    }

    #[test]
    fn cancelable_sleep_returns_promptly_once_canceled() {
        let token = CancelToken::new();
        let t = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t.cancel();
        });
        let start = Instant::now();
        sleep_cancelable(Duration::from_secs(5), &token);
        assert!(start.elapsed() < Duration::from_millis(500));
        handle.join().unwrap();
    }
}

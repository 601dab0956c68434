//! Acquisition coordinator (C7): orchestrates Serval's measurement
//! lifecycle and the per-channel workers it gates.
//!
//! The sleep/ordering contract in [`AcquisitionCoordinator::start_acquisition`]/
//! [`AcquisitionCoordinator::stop_acquisition`] follows spec.md §4.7 exactly;
//! validated against `original_source/tpx3App/src/ADTimePix.cpp`'s
//! start/stop sequences (`measurement/stop` pre-clean, `measurement/start`,
//! per-channel launch with its own settle sleep). Thread lifecycle
//! management (join-all-then-report) follows `src/mtgraph.rs`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use serde_json::Value;

use crate::config::DriverConfig;
use crate::destination;
use crate::error::DriverError;
use crate::histogram_processor::HistogramProcessor;
use crate::image_processor::ImageProcessor;
use crate::parambus::ParamBus;
use crate::rest::{paths, ServalClient};
use crate::worker::{self, CancelToken, ChannelProcessor, WorkerHandle};

/// Serval measurement statuses that mean "not currently acquiring", per
/// spec.md §4.7 step 2.
const IDLE_STATUSES: [&str; 2] = ["DA_IDLE", "DA_STOPPED"];

const PRE_START_STOP_SETTLE: Duration = Duration::from_millis(100);
const PRE_CONNECT_SETTLE: Duration = Duration::from_millis(200);
const POST_STOP_SETTLE: Duration = Duration::from_millis(300);
/// Measurement-status poller interval (spec.md §5: "10ms tight polling loop").
const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn measurement_status(v: &Value) -> Option<&str> {
    v.get("Info").and_then(|i| i.get("Status")).and_then(Value::as_str)
}

/// Polls `GET /measurement` on its own thread and republishes live
/// counters while a run is active (spec.md §5's measurement-status
/// thread; the original implements this as a loop copying counters into
/// PVs, `original_source/tpx3App/src/ADTimePix.cpp`).
struct MeasurementPoller {
    cancel: CancelToken,
    join: Option<std::thread::JoinHandle<()>>,
}

impl MeasurementPoller {
    fn spawn(rest: Arc<dyn ServalClient>, bus: Arc<dyn ParamBus>) -> Self {
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        let join = std::thread::Builder::new()
            .name("tpx3-measurement-poller".to_string())
            .spawn(move || {
                while !thread_cancel.is_canceled() {
                    match rest.get_json(paths::MEASUREMENT) {
                        Ok(v) => publish_measurement_counters(&v, bus.as_ref()),
                        Err(e) => warn!("measurement poller: {e}"),
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
            .expect("spawning measurement poller thread");
        Self {
            cancel,
            join: Some(join),
        }
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for MeasurementPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn publish_measurement_counters(v: &Value, bus: &dyn ParamBus) {
    if let Some(status) = measurement_status(v) {
        bus.set_string("Measurement:Status", status);
    }
    // Tdc1/Tdc2 (spec.md §9 open question): only Tdc1 is ever populated;
    // Tdc2 stays unset when Serval doesn't report it, so a consumer can
    // distinguish "not reported" from "reported as zero".
    if let Some(rate) = v.get("Tdc1EventRate").or_else(|| v.get("TdcEventRate")).and_then(Value::as_f64) {
        bus.set_scalar("Tdc1EventRate", rate);
    }
}

/// One channel's processor template plus its TCP endpoint, resolved from
/// [`DriverConfig`] at `start_acquisition` time.
struct ResolvedChannel {
    prefix: String,
    host: String,
    port: u16,
    accumulation_enabled: bool,
    is_histogram: bool,
}

/// Orchestrates measurement lifecycle and per-channel worker threads.
pub struct AcquisitionCoordinator {
    rest: Arc<dyn ServalClient>,
    bus: Arc<dyn ParamBus>,
    config: DriverConfig,
    workers: Mutex<Vec<WorkerHandle>>,
    poller: Mutex<Option<MeasurementPoller>>,
}

impl AcquisitionCoordinator {
    /// Build a coordinator over the given REST client, parameter bus, and
    /// configuration.
    pub fn new(rest: Arc<dyn ServalClient>, bus: Arc<dyn ParamBus>, config: DriverConfig) -> Self {
        Self {
            rest,
            bus,
            config,
            workers: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
        }
    }

    fn resolved_channels(&self) -> Vec<ResolvedChannel> {
        self.config
            .channels
            .values()
            .filter(|c| c.config.enabled && c.config.port != 0)
            .map(|c| ResolvedChannel {
                prefix: c.kind.prefix().to_string(),
                host: c.config.host.clone(),
                port: c.config.port,
                accumulation_enabled: c.config.accumulation_enabled,
                is_histogram: c.kind.is_histogram(),
            })
            .collect()
    }

    fn stop_workers(&self) {
        let mut workers = self.workers.lock().unwrap();
        for mut w in workers.drain(..) {
            w.stop();
        }
    }

    /// Start an acquisition: pre-clean, `measurement/start`, then launch
    /// one worker per enabled TCP channel. Per spec.md §4.7.
    pub fn start_acquisition(&self) -> Result<(), DriverError> {
        // Step 1: ensure no stale worker.
        self.stop_workers();

        // Step 2: pre-clean if Serval isn't idle.
        match self.rest.get_json(paths::MEASUREMENT) {
            Ok(v) => {
                let idle = measurement_status(&v).map(|s| IDLE_STATUSES.contains(&s)).unwrap_or(true);
                if !idle {
                    let _ = self.rest.get_json(paths::MEASUREMENT_STOP);
                    std::thread::sleep(PRE_START_STOP_SETTLE);
                }
            }
            Err(e) => warn!("start_acquisition: pre-clean status check failed: {e}"),
        }

        // Step 2.5: configure destinations (C8) before starting, per
        // spec.md §4.8. Disabled channels contribute nothing
        // (`resolve_destination` returns an all-`None` config for them).
        let mut channel_bodies = Vec::new();
        for c in self.config.channels.values() {
            if let Some(body) = destination::build_destination_body(&c.config.resolve_destination()?)? {
                channel_bodies.push((c.kind, body));
            }
        }
        if !channel_bodies.is_empty() {
            let body = destination::assemble_destination_body(&channel_bodies);
            if let Err(e) = self.rest.put_json(paths::SERVER_DESTINATION, &body) {
                self.stop_workers();
                return Err(DriverError::StartFailed(e.to_string()));
            }
        }

        // Step 3: start.
        if let Err(e) = self.rest.get_json(paths::MEASUREMENT_START) {
            self.stop_workers();
            return Err(DriverError::StartFailed(e.to_string()));
        }

        // Step 4: launch one worker per enabled TCP channel.
        let channels = self.resolved_channels();
        let mut workers = self.workers.lock().unwrap();
        for ch in channels {
            std::thread::sleep(PRE_CONNECT_SETTLE);
            let processor = if ch.is_histogram {
                ChannelProcessor::Histogram(HistogramProcessor::new(
                    self.config.frames_to_sum,
                    self.config.sum_update_interval_frames,
                ))
            } else {
                ChannelProcessor::Image(ImageProcessor::new(
                    self.config.frames_to_sum,
                    self.config.sum_update_interval_frames,
                ))
            };
            info!("starting worker for channel {} at {}:{}", ch.prefix, ch.host, ch.port);
            let handle = worker::spawn(
                ch.host,
                ch.port,
                processor,
                ch.accumulation_enabled,
                ch.prefix,
                self.bus.clone(),
            );
            workers.push(handle);
        }
        drop(workers);

        *self.poller.lock().unwrap() = Some(MeasurementPoller::spawn(self.rest.clone(), self.bus.clone()));

        Ok(())
    }

    /// Stop the acquisition: REST stop, settle, tear down workers, and
    /// publish terminal counters. Per spec.md §4.7. `stop ∘ stop` is a
    /// no-op the second time (no workers remain to tear down).
    pub fn stop_acquisition(&self) -> Result<(), DriverError> {
        if let Err(e) = self.rest.get_json(paths::MEASUREMENT_STOP) {
            warn!("stop_acquisition: measurement/stop failed: {e}");
        }
        std::thread::sleep(POST_STOP_SETTLE);

        self.stop_workers();
        if let Some(mut poller) = self.poller.lock().unwrap().take() {
            poller.stop();
        }

        match self.rest.get_json(paths::MEASUREMENT) {
            Ok(v) => publish_measurement_counters(&v, self.bus.as_ref()),
            Err(e) => warn!("stop_acquisition: final status poll failed: {e}"),
        }
        Ok(())
    }

    /// Number of currently active channel workers, for tests/diagnostics.
    pub fn active_worker_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Resize the rolling window on every active channel worker, without
    /// restarting them (spec.md §4.4: "`frames_to_sum` lowered mid-run:
    /// trim the buffer from the head; immediately recompute and publish
    /// the window sum"). A parameter-bus write that changes `frames_to_sum`
    /// is expected to reach the control thread and call this.
    pub fn set_frames_to_sum(&self, n: usize) {
        for w in self.workers.lock().unwrap().iter() {
            w.set_frames_to_sum(n);
        }
    }
}

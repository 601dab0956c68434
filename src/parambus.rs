//! The parameter-bus boundary (spec.md §6): a named, typed keyspace the
//! driver publishes into and reads configuration from. Treated as an
//! opaque, externally thread-safe collaborator — this module only defines
//! the contract and a recording double for tests, never a real EPICS
//! integration (spec.md §1's "out of scope").

use std::sync::Mutex;

/// Operations the driver performs against the parameter bus.
///
/// Implementations must be safe to call concurrently from any thread: the
/// coordinator, the control thread, and every channel worker thread all
/// hold a handle to the same bus.
pub trait ParamBus: Send + Sync {
    /// Publish a scalar floating-point value under `name`.
    fn set_scalar(&self, name: &str, value: f64);
    /// Publish a string value under `name`.
    fn set_string(&self, name: &str, value: &str);
    /// Publish a 1D 32-bit integer array under `name`.
    fn publish_array_u32(&self, name: &str, data: &[u32]);
    /// Publish a 1D 64-bit integer array under `name`.
    fn publish_array_u64(&self, name: &str, data: &[u64]);
    /// Publish a 1D 64-bit float array under `name` (used for bin edges and
    /// bin centres, which are not integral).
    fn publish_array_f64(&self, name: &str, data: &[f64]);
    /// Notify the bus that callbacks for this cycle have fired. Called once
    /// per control-thread pass per spec.md §6.
    fn callbacks(&self);
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Scalar(String, f64),
    Str(String, String),
    ArrayU32(String, Vec<u32>),
    ArrayU64(String, Vec<u64>),
    ArrayF64(String, Vec<f64>),
    Callbacks,
}

/// A `ParamBus` that records every call instead of publishing anywhere,
/// for asserting on driver behavior without a real EPICS process.
#[derive(Default)]
pub struct RecordingParamBus {
    events: Mutex<Vec<Event>>,
}

impl RecordingParamBus {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently published scalar under `name`, if any.
    pub fn last_scalar(&self, name: &str) -> Option<f64> {
        self.events.lock().unwrap().iter().rev().find_map(|e| match e {
            Event::Scalar(n, v) if n == name => Some(*v),
            _ => None,
        })
    }

    /// The most recently published string under `name`, if any.
    pub fn last_string(&self, name: &str) -> Option<String> {
        self.events.lock().unwrap().iter().rev().find_map(|e| match e {
            Event::Str(n, v) if n == name => Some(v.clone()),
            _ => None,
        })
    }

    /// The most recently published u64 array under `name`, if any.
    pub fn last_array_u64(&self, name: &str) -> Option<Vec<u64>> {
        self.events.lock().unwrap().iter().rev().find_map(|e| match e {
            Event::ArrayU64(n, v) if n == name => Some(v.clone()),
            _ => None,
        })
    }

    /// The most recently published f64 array under `name`, if any.
    pub fn last_array_f64(&self, name: &str) -> Option<Vec<f64>> {
        self.events.lock().unwrap().iter().rev().find_map(|e| match e {
            Event::ArrayF64(n, v) if n == name => Some(v.clone()),
            _ => None,
        })
    }

    /// Total number of `callbacks()` notifications observed.
    pub fn callback_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::Callbacks))
            .count()
    }

    /// Number of recorded events of any kind, for idle/no-op assertions.
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl ParamBus for RecordingParamBus {
    fn set_scalar(&self, name: &str, value: f64) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Scalar(name.to_string(), value));
    }

    fn set_string(&self, name: &str, value: &str) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Str(name.to_string(), value.to_string()));
    }

    fn publish_array_u32(&self, name: &str, data: &[u32]) {
        self.events
            .lock()
            .unwrap()
            .push(Event::ArrayU32(name.to_string(), data.to_vec()));
    }

    fn publish_array_u64(&self, name: &str, data: &[u64]) {
        self.events
            .lock()
            .unwrap()
            .push(Event::ArrayU64(name.to_string(), data.to_vec()));
    }

    fn publish_array_f64(&self, name: &str, data: &[f64]) {
        self.events
            .lock()
            .unwrap()
            .push(Event::ArrayF64(name.to_string(), data.to_vec()));
    }

    fn callbacks(&self) {
        self.events.lock().unwrap().push(Event::Callbacks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_last_value_per_name() {
        let bus = RecordingParamBus::new();
        bus.set_scalar("Rate", 1.0);
        bus.set_scalar("Rate", 2.0);
        assert_eq!(bus.last_scalar("Rate"), Some(2.0));
        assert_eq!(bus.last_scalar("NoSuchName"), None);
    }

    #[test]
    fn records_arrays_and_callbacks() {
        let bus = RecordingParamBus::new();
        bus.publish_array_u64("CurrentFrame", &[1, 2, 3]);
        bus.callbacks();
        bus.callbacks();
        assert_eq!(bus.last_array_u64("CurrentFrame"), Some(vec![1, 2, 3]));
        assert_eq!(bus.callback_count(), 2);
        assert_eq!(bus.event_count(), 3);
    }
}

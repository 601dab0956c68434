//! REST client surface consumed from Serval (spec.md §1, §6).
//!
//! The core only ever needs `get_json`, `put_json`, `get_text` against a
//! configured base URL with HTTP Basic auth and a bounded timeout — the
//! rest of Serval's REST surface (dashboard, detector health, DAC upload,
//! layout) is the host's concern, named here only as path constants so
//! call sites don't hand-format URLs.
//!
//! No teacher analogue (`rustradio` has no HTTP client); the dependency and
//! blocking-client pattern come from
//! `examples/supermarsx-sortOfRemoteNG/src-tauri/crates/sorng-protocols`,
//! which already pulls in `reqwest` with the `blocking` feature.

use std::time::Duration;

use serde_json::Value;

use crate::error::DriverError;

/// Named REST paths for the endpoints spec.md §6's table enumerates,
/// centralizing what the original driver built ad hoc as
/// `this->serverURL + "/measurement/stop"`-style string concatenation.
pub mod paths {
    pub const ROOT: &str = "/";
    pub const DASHBOARD: &str = "/dashboard";
    pub const DETECTOR: &str = "/detector";
    pub const DETECTOR_HEALTH: &str = "/detector/health";
    pub const SERVER_DESTINATION: &str = "/server/destination";
    pub const MEASUREMENT: &str = "/measurement";
    pub const MEASUREMENT_START: &str = "/measurement/start";
    pub const MEASUREMENT_STOP: &str = "/measurement/stop";

    /// `/detector/chips/{chip}/dacs`.
    pub fn chip_dacs(chip: u32) -> String {
        format!("/detector/chips/{chip}/dacs")
    }
}

/// The minimal REST surface the core consumes (spec.md §1).
///
/// A trait so tests can substitute a canned client without a running
/// Serval instance.
pub trait ServalClient: Send + Sync {
    /// `GET path`, parsed as JSON. Non-200 responses return `Transient`
    /// carrying the response body as a message (spec.md §6: "any other
    /// code publishes the response body... and returns an error").
    fn get_json(&self, path: &str) -> Result<Value, DriverError>;
    /// `PUT path` with a JSON body, discarding any response body.
    fn put_json(&self, path: &str, body: &Value) -> Result<(), DriverError>;
    /// `GET path`, returning the raw response text.
    fn get_text(&self, path: &str) -> Result<String, DriverError>;
}

/// A blocking `reqwest`-backed [`ServalClient`].
pub struct HttpServalClient {
    base_url: String,
    basic_auth: Option<(String, String)>,
    client: reqwest::blocking::Client,
}

impl HttpServalClient {
    /// Build a client against `base_url`, with optional HTTP Basic auth
    /// and the given request timeout (spec.md §5: "REST calls to Serval
    /// with a 10s timeout").
    pub fn new(
        base_url: impl Into<String>,
        basic_auth: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            basic_auth,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn with_auth(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.basic_auth {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }
}

impl ServalClient for HttpServalClient {
    fn get_json(&self, path: &str) -> Result<Value, DriverError> {
        let resp = self.with_auth(self.client.get(self.url(path))).send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(DriverError::Transient(format!("{path}: HTTP {status}: {body}")));
        }
        Ok(resp.json()?)
    }

    fn put_json(&self, path: &str, body: &Value) -> Result<(), DriverError> {
        let resp = self.with_auth(self.client.put(self.url(path))).json(body).send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(DriverError::Transient(format!("{path}: HTTP {status}: {text}")));
        }
        Ok(())
    }

    fn get_text(&self, path: &str) -> Result<String, DriverError> {
        let resp = self.with_auth(self.client.get(self.url(path))).send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(DriverError::Transient(format!("{path}: HTTP {status}: {body}")));
        }
        Ok(resp.text()?)
    }
}

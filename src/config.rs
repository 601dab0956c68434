//! Driver configuration (spec.md §B.3): a TOML file describing the Serval
//! connection, REST timeout, rolling-window sizing, and per-channel
//! streaming endpoints.
//!
//! No teacher analogue — `rustradio`'s own examples configure blocks via
//! constructor arguments or CLI flags, not a file. Grounded on
//! `freddiehaddad-oxidized`'s `toml`-backed configuration loading.

use std::path::Path;

use serde::Deserialize;

use crate::error::DriverError;

/// Which streaming channel a [`ChannelConfig`] entry describes
/// (spec.md §3's `ChannelConfig.kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Raw detector events, file-destined only in practice.
    Raw,
    /// A second raw channel Serval exposes alongside `Raw`.
    Raw1,
    /// Full-frame image channel.
    Img,
    /// Preview image channel (lower rate than `Img`).
    PrvImg,
    /// Preview histogram (ToF) channel.
    PrvHst,
}

impl ChannelKind {
    /// Whether this channel kind carries histogram (C5) rather than image
    /// (C4) frames.
    pub fn is_histogram(self) -> bool {
        matches!(self, ChannelKind::PrvHst)
    }

    /// Parameter-bus/REST prefix used for this channel's publications.
    pub fn prefix(self) -> &'static str {
        match self {
            ChannelKind::Raw => "Raw",
            ChannelKind::Raw1 => "Raw1",
            ChannelKind::Img => "Img",
            ChannelKind::PrvImg => "PrvImg",
            ChannelKind::PrvHst => "PrvHst",
        }
    }
}

/// One channel's streaming endpoint and enable flag.
///
/// A channel entirely absent from the `[channels]` table in the TOML file
/// deserializes as `enabled: false` via `#[serde(default)]`, matching
/// spec.md §4.8's "missing parameter is treated as channel disabled, not
/// fatal."
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Whether this channel should be started by `start_acquisition`.
    #[serde(default)]
    pub enabled: bool,
    /// Hostname or literal IP of the TCP data-channel endpoint.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port of the data-channel endpoint.
    #[serde(default)]
    pub port: u16,
    /// Whether accumulation (running sum + window sum) is enabled for this
    /// channel, or only current-frame publication (spec.md §4.4 edge case).
    #[serde(default = "default_true")]
    pub accumulation_enabled: bool,
    /// `/server/destination` queue size (spec.md §4.8), default `16`.
    #[serde(default = "default_queue_size")]
    pub queue_size: u32,
    /// Destination string, e.g. `tcp://host:port`, `file:/data/run1`,
    /// `http://host:port/path`. Defaults to `tcp://{host}:{port}` when this
    /// channel is enabled and no override is given.
    #[serde(default)]
    pub destination: Option<String>,
    /// `Format` enum index (spec.md §4.8), required for `file:` destinations.
    #[serde(default)]
    pub format: Option<i64>,
    /// `Mode` enum index (spec.md §4.8), required for `file:` destinations.
    #[serde(default)]
    pub mode: Option<i64>,
    /// `IntegrationSize` (spec.md §4.8: `∈ [-1, 32]`).
    #[serde(default)]
    pub integration_size: Option<i64>,
    /// `IntegrationMode` enum index (spec.md §4.8).
    #[serde(default)]
    pub integration_mode: Option<i64>,
    /// `SplitStrategy` enum index (spec.md §4.8).
    #[serde(default)]
    pub split_strategy: Option<i64>,
    /// Whether Serval should stop the measurement when its disk limit is
    /// reached (spec.md §4.8), default `false`.
    #[serde(default)]
    pub stop_measurement_on_disk_limit: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: 0,
            accumulation_enabled: true,
            queue_size: default_queue_size(),
            destination: None,
            format: None,
            mode: None,
            integration_size: None,
            integration_mode: None,
            split_strategy: None,
            stop_measurement_on_disk_limit: false,
        }
    }
}

impl ChannelConfig {
    /// Resolve this channel's `/server/destination` configuration
    /// (spec.md §4.8). A disabled channel resolves to an all-`None`
    /// [`crate::destination::DestinationConfig`], matching "missing
    /// parameter is treated as disabled, not fatal" rather than erroring
    /// on whatever stale fields the TOML happens to carry.
    pub fn resolve_destination(&self) -> Result<crate::destination::DestinationConfig, DriverError> {
        use crate::destination::{
            validate_integration_size, Destination, DestinationConfig, Format, IntegrationMode, Mode,
            SplitStrategy,
        };

        if !self.enabled {
            return Ok(DestinationConfig {
                destination: None,
                queue_size: self.queue_size,
                format: None,
                mode: None,
                integration_size: None,
                integration_mode: None,
                stop_measurement_on_disk_limit: self.stop_measurement_on_disk_limit,
                split_strategy: None,
            });
        }
        let destination = match &self.destination {
            Some(s) => Some(Destination::parse(s)?),
            None => Some(Destination::Tcp {
                host: self.host.clone(),
                port: self.port,
            }),
        };
        Ok(DestinationConfig {
            destination,
            queue_size: self.queue_size,
            format: self.format.map(Format::try_from).transpose()?,
            mode: self.mode.map(Mode::try_from).transpose()?,
            integration_size: self.integration_size.map(validate_integration_size).transpose()?,
            integration_mode: self.integration_mode.map(IntegrationMode::try_from).transpose()?,
            stop_measurement_on_disk_limit: self.stop_measurement_on_disk_limit,
            split_strategy: self.split_strategy.map(SplitStrategy::try_from).transpose()?,
        })
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_frames_to_sum() -> usize {
    10
}

fn default_sum_update_interval_frames() -> usize {
    1
}

fn default_rest_timeout_ms() -> u64 {
    10_000
}

fn default_queue_size() -> u32 {
    16
}

/// HTTP Basic auth credentials for the Serval REST surface.
#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Top-level driver configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Base URL of the Serval REST server, e.g. `http://localhost:8080`.
    pub server_url: String,
    /// Optional HTTP Basic auth credentials for the REST surface.
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
    /// REST request timeout, in milliseconds (spec.md §5: 10s default).
    #[serde(default = "default_rest_timeout_ms")]
    pub rest_timeout_ms: u64,
    /// Rolling-window size, `frames_to_sum` (spec.md §3: 1..=100000).
    #[serde(default = "default_frames_to_sum")]
    pub frames_to_sum: usize,
    /// How many accepted frames between window-sum recomputes
    /// (spec.md §4.4: 1..=10000).
    #[serde(default = "default_sum_update_interval_frames")]
    pub sum_update_interval_frames: usize,
    /// Per-channel configuration, keyed by channel name (e.g. `"img"`,
    /// `"prv_hst"`). Channels not present here are disabled.
    #[serde(default)]
    pub channels: std::collections::BTreeMap<String, ChannelConfigWithKind>,
}

/// A [`ChannelConfig`] plus the kind it applies to, as read from one entry
/// of the `[channels.*]` TOML table.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfigWithKind {
    pub kind: ChannelKind,
    #[serde(flatten)]
    pub config: ChannelConfig,
}

impl DriverConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DriverError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| DriverError::Fatal(format!("invalid config: {e}")))
    }

    /// REST timeout as a [`std::time::Duration`].
    pub fn rest_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rest_timeout_ms)
    }
}

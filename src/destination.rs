//! Destination configurator (C8): closed enumerations for the parameter-bus
//! indices Serval's `/server/destination` body depends on, and the parser
//! for the destination strings themselves.
//!
//! Grounded on `original_source/tpx3App/src/ADTimePix.cpp`'s
//! `SPLIT_STRATEGIES[intNum]`-style array-indexed enum lookups, replaced
//! here with `TryFrom<i32>` on closed enums per spec.md §9's redesign note
//! ("Global static JSON enum arrays. Specify as closed enumerations").

use serde_json::{json, Value};

use crate::config::ChannelKind;
use crate::error::DriverError;

macro_rules! closed_enum {
    ($name:ident, $field:literal, { $($variant:ident = $idx:literal => $json:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $(#[doc = concat!("Wire value `", $json, "`.")] $variant),+
        }

        impl $name {
            /// The JSON string Serval expects for this variant.
            pub fn as_json_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $json),+
                }
            }
        }

        impl TryFrom<i64> for $name {
            type Error = DriverError;
            fn try_from(v: i64) -> Result<Self, DriverError> {
                match v {
                    $($idx => Ok(Self::$variant),)+
                    _ => Err(DriverError::BadEnum { field: $field, value: v }),
                }
            }
        }
    };
}

closed_enum!(Format, "format", {
    Tiff = 0 => "tiff",
    Pgm = 1 => "pgm",
    Png = 2 => "png",
    JsonImage = 3 => "jsonimage",
    JsonHisto = 4 => "jsonhisto",
});

closed_enum!(Mode, "mode", {
    Count = 0 => "count",
    Tot = 1 => "tot",
    Toa = 2 => "toa",
    Tof = 3 => "tof",
    CountFb = 4 => "count_fb",
});

closed_enum!(IntegrationMode, "integration_mode", {
    Sum = 0 => "sum",
    Average = 1 => "average",
    Last = 2 => "last",
});

closed_enum!(SplitStrategy, "split_strategy", {
    SingleFile = 0 => "single_file",
    Frame = 1 => "frame",
});

closed_enum!(SamplingMode, "sampling_mode", {
    SkipOnFrame = 0 => "skipOnFrame",
    SkipOnPeriod = 1 => "skipOnPeriod",
});

/// Validate an `integration_size` index, which is a plain bounded integer
/// rather than an enum (spec.md §4.8: `∈ [-1, 32]`).
pub fn validate_integration_size(v: i64) -> Result<i64, DriverError> {
    if (-1..=32).contains(&v) {
        Ok(v)
    } else {
        Err(DriverError::BadEnum {
            field: "integration_size",
            value: v,
        })
    }
}

/// A parsed destination string, distinguishing the three base schemes
/// spec.md §4.8 names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// `file:/…` — Serval writes to a local path; the driver never opens it.
    File(String),
    /// `http://…` — streamed to an HTTP consumer.
    Http(String),
    /// `tcp://host:port` (optionally written `tcp://listen@host:port`,
    /// with the `listen@` marker stripped).
    Tcp { host: String, port: u16 },
}

impl Destination {
    /// Parse a destination string per spec.md §4.8's case-sensitive rules.
    pub fn parse(s: &str) -> Result<Self, DriverError> {
        if let Some(rest) = s.strip_prefix("file:") {
            return Self::parse_file(rest, s);
        }
        if let Some(rest) = s.strip_prefix("http://") {
            return Ok(Destination::Http(format!("http://{rest}")));
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let rest = rest.strip_prefix("listen@").unwrap_or(rest);
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| DriverError::InvalidPath(s.to_string()))?;
            let port: u16 = port
                .parse()
                .map_err(|_| DriverError::InvalidPath(s.to_string()))?;
            return Ok(Destination::Tcp {
                host: host.to_string(),
                port,
            });
        }
        Err(DriverError::InvalidPath(s.to_string()))
    }

    fn parse_file(rest: &str, original: &str) -> Result<Self, DriverError> {
        // "file:" must be followed by exactly one '/', then a path.
        if !rest.starts_with('/') || rest.starts_with("//") {
            return Err(DriverError::InvalidPath(original.to_string()));
        }
        Ok(Destination::File(format!("file:{rest}")))
    }
}

/// One channel's destination configuration, as read from the parameter bus
/// (spec.md §4.8). `None` fields mean "channel disabled", not an error.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub destination: Option<Destination>,
    pub queue_size: u32,
    pub format: Option<Format>,
    pub mode: Option<Mode>,
    pub integration_size: Option<i64>,
    pub integration_mode: Option<IntegrationMode>,
    pub stop_measurement_on_disk_limit: bool,
    pub split_strategy: Option<SplitStrategy>,
}

/// Build the `PUT /server/destination` JSON body for one channel, per
/// spec.md §4.8. Returns `Ok(None)` when the channel has no destination
/// configured ("missing parameter is treated as disabled, not fatal").
pub fn build_destination_body(cfg: &DestinationConfig) -> Result<Option<Value>, DriverError> {
    let Some(dest) = &cfg.destination else {
        return Ok(None);
    };
    let body = match dest {
        Destination::Tcp { host, port } => json!({
            "Base": format!("tcp://{host}:{port}"),
            "QueueSize": cfg.queue_size,
        }),
        Destination::Http(url) => json!({
            "Base": url,
            "QueueSize": cfg.queue_size,
        }),
        Destination::File(path) => {
            let format = cfg.format.ok_or_else(|| DriverError::InvalidPath(path.clone()))?;
            let mode = cfg.mode.ok_or_else(|| DriverError::InvalidPath(path.clone()))?;
            let mut obj = json!({
                "Base": path,
                "FilePattern": format!("{path}/frame_%05d"),
                "Format": format.as_json_str(),
                "Mode": mode.as_json_str(),
                "IntegrationSize": cfg.integration_size.unwrap_or(1),
                "StopMeasurementOnDiskLimit": cfg.stop_measurement_on_disk_limit,
                "QueueSize": cfg.queue_size,
            });
            if let Some(im) = cfg.integration_mode {
                obj["IntegrationMode"] = json!(im.as_json_str());
            }
            if let Some(ss) = cfg.split_strategy {
                obj["SplitStrategy"] = json!(ss.as_json_str());
            }
            obj
        }
    };
    Ok(Some(body))
}

/// Nest each channel's `/server/destination` body into the shape Serval
/// expects for the whole-detector PUT, grounded on
/// `original_source/tpx3App/src/ADTimePix.cpp`'s `server_j["Raw"][idx]`,
/// `server_j["Image"][idx]`, `server_j["Preview"]["ImageChannels"][idx]`,
/// and `server_j["Preview"]["HistogramChannels"][idx]` construction.
/// `Raw`/`Raw1` share the `"Raw"` array; `Img` goes in `"Image"`; `PrvImg`
/// and `PrvHst` nest under `"Preview"`. Groups with no channels are omitted
/// entirely rather than sent as empty arrays.
pub fn assemble_destination_body(channels: &[(ChannelKind, Value)]) -> Value {
    let mut raw = Vec::new();
    let mut image = Vec::new();
    let mut preview_image = Vec::new();
    let mut preview_histogram = Vec::new();
    for (kind, body) in channels {
        match kind {
            ChannelKind::Raw | ChannelKind::Raw1 => raw.push(body.clone()),
            ChannelKind::Img => image.push(body.clone()),
            ChannelKind::PrvImg => preview_image.push(body.clone()),
            ChannelKind::PrvHst => preview_histogram.push(body.clone()),
        }
    }

    let mut root = json!({});
    if !raw.is_empty() {
        root["Raw"] = json!(raw);
    }
    if !image.is_empty() {
        root["Image"] = json!(image);
    }
    if !preview_image.is_empty() || !preview_histogram.is_empty() {
        let mut preview = json!({});
        if !preview_image.is_empty() {
            preview["ImageChannels"] = json!(preview_image);
        }
        if !preview_histogram.is_empty() {
            preview["HistogramChannels"] = json!(preview_histogram);
        }
        root["Preview"] = preview;
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips_valid_indices() {
        assert_eq!(Format::try_from(3).unwrap(), Format::JsonImage);
        assert_eq!(Format::JsonImage.as_json_str(), "jsonimage");
    }

    #[test]
    fn enum_rejects_out_of_range() {
        let err = Format::try_from(99).unwrap_err();
        assert!(matches!(err, DriverError::BadEnum { field: "format", value: 99 }));
    }

    #[test]
    fn integration_size_bounds() {
        assert!(validate_integration_size(-1).is_ok());
        assert!(validate_integration_size(32).is_ok());
        assert!(validate_integration_size(33).is_err());
        assert!(validate_integration_size(-2).is_err());
    }

    #[test]
    fn parses_tcp_destination_with_listen_marker() {
        let d = Destination::parse("tcp://listen@127.0.0.1:8451").unwrap();
        assert_eq!(
            d,
            Destination::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8451
            }
        );
    }

    #[test]
    fn parses_plain_tcp_destination() {
        let d = Destination::parse("tcp://127.0.0.1:8451").unwrap();
        assert_eq!(
            d,
            Destination::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8451
            }
        );
    }

    #[test]
    fn parses_http_destination() {
        let d = Destination::parse("http://example.com:8080/sink").unwrap();
        assert_eq!(d, Destination::Http("http://example.com:8080/sink".to_string()));
    }

    #[test]
    fn file_destination_requires_single_leading_slash() {
        let d = Destination::parse("file:/data/run1").unwrap();
        assert_eq!(d, Destination::File("file:/data/run1".to_string()));
        assert!(Destination::parse("file://data/run1").is_err());
        assert!(Destination::parse("file:data/run1").is_err());
    }

    #[test]
    fn unknown_scheme_is_invalid_path() {
        assert!(Destination::parse("ftp://nope").is_err());
    }

    #[test]
    fn missing_destination_builds_no_body() {
        let cfg = DestinationConfig {
            destination: None,
            queue_size: 16,
            format: None,
            mode: None,
            integration_size: None,
            integration_mode: None,
            stop_measurement_on_disk_limit: false,
            split_strategy: None,
        };
        assert_eq!(build_destination_body(&cfg).unwrap(), None);
    }

    #[test]
    fn tcp_destination_builds_minimal_body() {
        let cfg = DestinationConfig {
            destination: Some(Destination::Tcp {
                host: "127.0.0.1".into(),
                port: 8451,
            }),
            queue_size: 16,
            format: None,
            mode: None,
            integration_size: None,
            integration_mode: None,
            stop_measurement_on_disk_limit: false,
            split_strategy: None,
        };
        let body = build_destination_body(&cfg).unwrap().unwrap();
        assert_eq!(body["Base"], "tcp://127.0.0.1:8451");
        assert_eq!(body["QueueSize"], 16);
    }

    #[test]
    fn assembles_raw_and_preview_channels_into_nested_shape() {
        let body = assemble_destination_body(&[
            (ChannelKind::Raw, json!({"Base": "tcp://a:1"})),
            (ChannelKind::PrvImg, json!({"Base": "tcp://b:2"})),
            (ChannelKind::PrvHst, json!({"Base": "tcp://c:3"})),
        ]);
        assert_eq!(body["Raw"].as_array().unwrap().len(), 1);
        assert!(body.get("Image").is_none());
        assert_eq!(body["Preview"]["ImageChannels"].as_array().unwrap().len(), 1);
        assert_eq!(body["Preview"]["HistogramChannels"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn empty_channel_list_assembles_to_empty_object() {
        let body = assemble_destination_body(&[]);
        assert_eq!(body, json!({}));
    }
}

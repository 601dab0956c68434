//! Header decoding (C3): turns a validated JSON object into typed header
//! fields. Failures here are non-fatal to the connection — the reader drops
//! the offending frame and continues (spec.md §4.3).

use serde_json::Value;

use crate::error::DriverError;
use crate::pixel::PixelFormat;

/// Maximum width/height accepted for an image frame, per spec.md §4.3.
pub const MAX_DIMENSION: i64 = 100_000;

/// Decoded image-channel frame header.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    /// Frame width in pixels.
    pub width: usize,
    /// Frame height in pixels.
    pub height: usize,
    /// Pixel element format.
    pub pixel_format: PixelFormat,
    /// Monotonic frame counter assigned by Serval.
    pub frame_number: i64,
    /// Detector-side timestamp for this frame, seconds.
    pub time_at_frame: f64,
}

/// Decoded histogram-channel frame header.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramHeader {
    /// Number of histogram bins in this frame's payload.
    pub bin_size: usize,
    /// Bin width, in TDC clock ticks.
    pub bin_width: i64,
    /// Bin offset, in TDC clock ticks.
    pub bin_offset: i64,
    /// Monotonic frame counter assigned by Serval.
    pub frame_number: i64,
    /// Detector-side timestamp for this frame, seconds.
    pub time_at_frame: f64,
}

fn get_i64(v: &Value, field: &str) -> Option<i64> {
    v.get(field).and_then(Value::as_i64)
}

fn get_f64(v: &Value, field: &str) -> Option<f64> {
    v.get(field).and_then(Value::as_f64)
}

impl FrameHeader {
    /// Decode an image-channel header from an already-accepted JSON object.
    pub fn decode(v: &Value) -> Result<Self, DriverError> {
        let width = get_i64(v, "width").ok_or_else(|| DriverError::BadHeader("missing width".into()))?;
        let height =
            get_i64(v, "height").ok_or_else(|| DriverError::BadHeader("missing height".into()))?;
        if width < 1 || width > MAX_DIMENSION || height < 1 || height > MAX_DIMENSION {
            return Err(DriverError::BadHeader(format!(
                "dimensions out of range: width={width}, height={height}"
            )));
        }
        let pixel_format = v
            .get("pixelFormat")
            .and_then(Value::as_str)
            .map(PixelFormat::parse)
            .unwrap_or(PixelFormat::U16);
        let frame_number = get_i64(v, "frameNumber").unwrap_or(0);
        if frame_number < 0 {
            return Err(DriverError::BadHeader(format!(
                "negative frameNumber: {frame_number}"
            )));
        }
        let time_at_frame = get_f64(v, "timeAtFrame").unwrap_or(0.0);
        Ok(Self {
            width: width as usize,
            height: height as usize,
            pixel_format,
            frame_number,
            time_at_frame,
        })
    }
}

impl HistogramHeader {
    /// Decode a histogram-channel header from an already-accepted JSON object.
    pub fn decode(v: &Value) -> Result<Self, DriverError> {
        let bin_size =
            get_i64(v, "binSize").ok_or_else(|| DriverError::BadHeader("missing binSize".into()))?;
        if bin_size < 1 || bin_size > 1_000_000 {
            return Err(DriverError::BadHeader(format!(
                "binSize out of range: {bin_size}"
            )));
        }
        let bin_width =
            get_i64(v, "binWidth").ok_or_else(|| DriverError::BadHeader("missing binWidth".into()))?;
        if bin_width < 1 {
            return Err(DriverError::BadHeader(format!(
                "binWidth out of range: {bin_width}"
            )));
        }
        let bin_offset = get_i64(v, "binOffset").unwrap_or(0);
        if bin_offset < 0 {
            return Err(DriverError::BadHeader(format!(
                "binOffset out of range: {bin_offset}"
            )));
        }
        let frame_number = get_i64(v, "frameNumber").unwrap_or(0);
        let time_at_frame = get_f64(v, "timeAtFrame").unwrap_or(0.0);
        Ok(Self {
            bin_size: bin_size as usize,
            bin_width,
            bin_offset,
            frame_number,
            time_at_frame,
        })
    }
}

/// True if `v` contains at least one of the keys that mark it as an image
/// header, per spec.md §4.2 step 2.
pub fn looks_like_image_header(v: &Value) -> bool {
    for k in ["width", "height", "frameNumber", "timeAtFrame"] {
        if v.get(k).is_some() {
            return true;
        }
    }
    false
}

/// True if `v` contains at least one of the keys that mark it as a
/// histogram header.
pub fn looks_like_histogram_header(v: &Value) -> bool {
    for k in ["binSize", "binWidth", "frameNumber", "timeAtFrame"] {
        if v.get(k).is_some() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_defaults() {
        let v = json!({"width": 4, "height": 2});
        let h = FrameHeader::decode(&v).unwrap();
        assert_eq!(h.width, 4);
        assert_eq!(h.height, 2);
        assert_eq!(h.pixel_format, PixelFormat::U16);
        assert_eq!(h.frame_number, 0);
        assert_eq!(h.time_at_frame, 0.0);
    }

    #[test]
    fn decodes_full_header() {
        let v = json!({"width":4,"height":2,"pixelFormat":"uint16","frameNumber":7,"timeAtFrame":1.0});
        let h = FrameHeader::decode(&v).unwrap();
        assert_eq!(h.frame_number, 7);
        assert_eq!(h.time_at_frame, 1.0);
    }

    #[test]
    fn pixel_format_case_insensitive() {
        let v = json!({"width":1,"height":1,"pixelFormat":"UINT32"});
        let h = FrameHeader::decode(&v).unwrap();
        assert_eq!(h.pixel_format, PixelFormat::U32);
    }

    #[test]
    fn rejects_oversized_dimensions() {
        let v = json!({"width": 200000, "height": 1});
        assert!(FrameHeader::decode(&v).is_err());
    }

    #[test]
    fn rejects_missing_width() {
        let v = json!({"height": 1});
        assert!(matches!(
            FrameHeader::decode(&v),
            Err(DriverError::BadHeader(_))
        ));
    }

    #[test]
    fn histogram_header_defaults_offset() {
        let v = json!({"binSize":3,"binWidth":6,"frameNumber":1});
        let h = HistogramHeader::decode(&v).unwrap();
        assert_eq!(h.bin_offset, 0);
        assert_eq!(h.bin_size, 3);
    }

    #[test]
    fn histogram_header_rejects_oversized_bin_size() {
        let v = json!({"binSize": 2_000_000, "binWidth": 1});
        assert!(HistogramHeader::decode(&v).is_err());
    }
}

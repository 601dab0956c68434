//! Byte-stream framing (C2, spec.md §4.2): recovers `<JSON header>\n<binary
//! payload>` frames from a byte stream that may also carry stray noise.
//!
//! Kept free of any socket I/O so the recovery rule can be exercised with
//! plain byte slices, the way `tcp_source.rs`'s partial-read tests exercise
//! its buffering without a real network round trip.

use serde_json::Value;

use crate::header::{looks_like_histogram_header, looks_like_image_header};

/// Largest a line buffer is allowed to grow before being presumed corrupt
/// and reset (spec.md §4.2 step 5).
pub const MAX_BUFFER: usize = 32 * 1024;

/// Outcome of scanning a buffer for the next frame.
#[derive(Debug)]
pub enum FrameEvent {
    /// No newline yet; the caller should `recv` more bytes and retry.
    Incomplete,
    /// The buffer filled without finding a newline; the caller should reset
    /// it (the in-flight frame is presumed corrupt).
    Overflow,
    /// A line was present but didn't contain an acceptable JSON header.
    /// `consumed` bytes (the line plus its newline) should be dropped.
    Rejected {
        /// Bytes to drop from the front of the buffer.
        consumed: usize,
    },
    /// A line was accepted as a frame header.
    Accepted {
        /// The decoded JSON header object.
        header: Value,
        /// Bytes to drop from the front of the buffer to reach the
        /// payload tail (the header line plus its newline).
        consumed: usize,
    },
}

/// Locate a candidate JSON start within `line`, per spec.md §4.2 step 1.
///
/// Prefers the literal two-byte sequence `{"`. Falls back to any `{` whose
/// next <=100 bytes contain a structural JSON byte, or at least 6
/// alphanumeric/`_-. ` characters without an intervening control byte
/// outside `\t\r\n`.
fn find_candidate_start(line: &[u8]) -> Option<usize> {
    for i in 0..line.len().saturating_sub(1) {
        if line[i] == b'{' && line[i + 1] == b'"' {
            return Some(i);
        }
    }
    for (i, &b) in line.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        let end = (i + 1 + 100).min(line.len());
        let mut structural = false;
        let mut alnum_run = 0usize;
        for &c in &line[i + 1..end] {
            match c {
                b'"' | b':' | b',' | b'}' | b'[' | b']' => {
                    structural = true;
                    break;
                }
                b'\t' | b'\r' | b'\n' => {}
                0..=31 => break,
                c if c.is_ascii_alphanumeric() || c == b' ' || c == b'_' || c == b'-' || c == b'.' => {
                    alnum_run += 1;
                }
                _ => break,
            }
        }
        if structural || alnum_run >= 6 {
            return Some(i);
        }
    }
    None
}

/// Does the decoded object carry one of the keys that marks it as a frame
/// header (image or histogram), per spec.md §4.2 step 2?
fn is_acceptable_header(v: &Value) -> bool {
    looks_like_image_header(v) || looks_like_histogram_header(v)
}

/// Scan `buf` for the next frame event.
///
/// Never mutates `buf`; the caller drops `consumed` bytes from the front on
/// `Rejected`/`Accepted`, and clears the whole buffer on `Overflow`.
pub fn next_frame_event(buf: &[u8]) -> FrameEvent {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return if buf.len() >= MAX_BUFFER {
            FrameEvent::Overflow
        } else {
            FrameEvent::Incomplete
        };
    };
    let line = &buf[..nl];
    let consumed = nl + 1;

    let Some(start) = find_candidate_start(line) else {
        return FrameEvent::Rejected { consumed };
    };
    let Ok(text) = std::str::from_utf8(&line[start..]) else {
        return FrameEvent::Rejected { consumed };
    };
    match serde_json::from_str::<Value>(text) {
        Ok(v) if is_acceptable_header(&v) => FrameEvent::Accepted { header: v, consumed },
        _ => FrameEvent::Rejected { consumed },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_without_newline() {
        let buf = b"{\"width\":1";
        assert!(matches!(next_frame_event(buf), FrameEvent::Incomplete));
    }

    #[test]
    fn overflow_when_buffer_fills_without_newline() {
        let buf = vec![b'x'; MAX_BUFFER];
        assert!(matches!(next_frame_event(&buf), FrameEvent::Overflow));
    }

    #[test]
    fn accepts_clean_header() {
        let buf = b"{\"width\":4,\"height\":2,\"pixelFormat\":\"uint16\",\"frameNumber\":7}\n\x00\x01";
        match next_frame_event(buf) {
            FrameEvent::Accepted { header, consumed } => {
                assert_eq!(header["width"], 4);
                assert_eq!(consumed, buf.len() - 2);
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn rejects_line_with_no_candidate() {
        let buf = b"not json at all\n";
        assert!(matches!(
            next_frame_event(buf),
            FrameEvent::Rejected { .. }
        ));
    }

    #[test]
    fn rejects_unparseable_candidate() {
        let buf = b"{\"width\": not-a-number}\n";
        assert!(matches!(
            next_frame_event(buf),
            FrameEvent::Rejected { .. }
        ));
    }

    #[test]
    fn noise_recovery_scenario() {
        // spec.md §8 scenario 4.
        let buf = b"\x00\x00\x01GARBAGE\n{\"width\":1,\"height\":1,\"pixelFormat\":\"uint16\",\"frameNumber\":0}\n\x00\x2A";
        // First line is garbage with no JSON candidate -> rejected.
        let FrameEvent::Rejected { consumed } = next_frame_event(buf) else {
            panic!("expected first line rejected");
        };
        let rest = &buf[consumed..];
        // Second line is the real header.
        match next_frame_event(rest) {
            FrameEvent::Accepted { header, consumed } => {
                assert_eq!(header["frameNumber"], 0);
                let payload = &rest[consumed..];
                assert_eq!(payload, &[0x2A]);
            }
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn garbage_prefixed_frames_all_recovered_in_order() {
        // Build a stream of N frames, each preceded by noise that contains
        // no '{' at all, and check every frame is recovered, in order.
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for i in 0..20u32 {
            stream.extend_from_slice(b"GARBAGE-NO-BRACE-HERE-AT-ALL");
            let header = format!("{{\"width\":1,\"height\":1,\"frameNumber\":{i}}}\n");
            stream.extend_from_slice(header.as_bytes());
            stream.push(i as u8);
            expected.push(i);
        }

        let mut buf: &[u8] = &stream;
        let mut got = Vec::new();
        loop {
            match next_frame_event(buf) {
                FrameEvent::Incomplete | FrameEvent::Overflow => break,
                FrameEvent::Rejected { consumed } => buf = &buf[consumed..],
                FrameEvent::Accepted { header, consumed } => {
                    got.push(header["frameNumber"].as_u64().unwrap() as u32);
                    buf = &buf[consumed + 1..]; // + 1 byte payload
                }
            }
        }
        assert_eq!(got, expected);
    }
}

//! TCP frame reader (C2): owns one data-channel connection to Serval and
//! turns its byte stream into decoded [`Frame`]s, using [`framing`] for the
//! header-recovery rule.
//!
//! Modeled on `tcp_source.rs`'s partial-read buffering (bytes that don't yet
//! form a complete unit are held across `read_frame` calls), generalized
//! from a fixed-size sample to a variable-length JSON-header-plus-payload
//! frame, and with `socket2` added for the keepalive/linger/recv-buffer
//! tuning spec.md §4.2 calls for.

use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, warn};
use socket2::{Socket, TcpKeepalive};

use crate::error::DriverError;
use crate::framing::{self, FrameEvent};
use crate::header::{FrameHeader, HistogramHeader};
use crate::pixel::PixelFormat;

/// How large the read-into buffer is per `recv` call.
const RECV_CHUNK: usize = 64 * 1024;

/// How long the connection sits idle before the first keepalive probe, the
/// interval between probes, and the probe count before the peer is
/// considered dead — `idle=60s, interval=10s, count=3` per spec.md §4.2.
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 3;

/// Socket receive buffer size requested at connect time, `64 KiB` per
/// spec.md §4.2.
const RECV_BUFFER_BYTES: usize = 64 * 1024;

/// Linger duration on close, `5s` per spec.md §4.2/§5, so the kernel has
/// time to drain rather than aborting the connection with an RST.
const LINGER: Duration = Duration::from_secs(5);

/// A fully decoded frame, ready for its processor.
#[derive(Debug)]
pub enum Frame {
    /// An image-channel frame: header plus big-endian pixel payload.
    Image {
        /// Decoded header fields.
        header: FrameHeader,
        /// Raw big-endian payload, `width * height * bytes_per_pixel`.
        payload: Vec<u8>,
    },
    /// A histogram-channel frame: header plus big-endian u32 bin counts.
    Histogram {
        /// Decoded header fields.
        header: HistogramHeader,
        /// Raw big-endian payload, `bin_size * 4`.
        payload: Vec<u8>,
    },
}

/// Resolve `host:port`, preferring a literal IPv4 address over DNS
/// resolution, per spec.md §4.2's address-handling note.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, DriverError> {
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        return Ok(SocketAddr::new(ip.into(), port));
    }
    if let Ok(ip) = host.parse::<std::net::Ipv6Addr>() {
        return Ok(SocketAddr::new(ip.into(), port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| DriverError::BadAddress(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| DriverError::BadAddress(format!("{host}:{port}: no addresses")))
}

/// Owns a TCP stream to a Serval data channel and yields decoded frames.
pub struct FrameReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl FrameReader {
    /// Connect to `host:port` with the keepalive/linger/recv-buffer options
    /// spec.md §4.2 specifies, and a bounded connect timeout.
    pub fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, DriverError> {
        if port == 0 {
            return Err(DriverError::BadAddress(format!("invalid port: {port}")));
        }
        let addr = resolve(host, port)?;
        let socket = Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_nodelay(true)?;
        socket.connect_timeout(&addr.into(), connect_timeout)?;
        socket.set_keepalive(true)?;
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        socket.set_tcp_keepalive(&keepalive)?;
        socket.set_linger(Some(LINGER))?;
        socket.set_recv_buffer_size(RECV_BUFFER_BYTES)?;
        let stream: TcpStream = socket.into();
        stream.set_nonblocking(false)?;
        Ok(Self {
            stream,
            buf: Vec::new(),
        })
    }

    /// Wrap an already-connected stream, e.g. for tests against a local
    /// `TcpListener`. Skips the keepalive/linger/recv-buffer tuning.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn fill(&mut self) -> Result<(), DriverError> {
        let mut chunk = [0u8; RECV_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(DriverError::PeerClosed);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    /// Read exactly `needed` more bytes into `self.buf` beyond what it
    /// already holds, returning `ShortPayload` if the peer closes first.
    fn fill_until(&mut self, needed: usize) -> Result<(), DriverError> {
        while self.buf.len() < needed {
            let before = self.buf.len();
            let mut chunk = [0u8; RECV_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(DriverError::ShortPayload {
                    needed,
                    got: before,
                });
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Block until the next frame is decoded, silently skipping any number
    /// of rejected lines and buffer overflows along the way (spec.md §4.2
    /// steps 4-5). Returns `PeerClosed`/`ShortPayload` if the connection
    /// ends mid-frame.
    pub fn read_frame(&mut self) -> Result<Frame, DriverError> {
        loop {
            match framing::next_frame_event(&self.buf) {
                FrameEvent::Incomplete => self.fill()?,
                FrameEvent::Overflow => {
                    warn!(
                        "frame buffer exceeded {} bytes without a newline, resetting",
                        framing::MAX_BUFFER
                    );
                    self.buf.clear();
                }
                FrameEvent::Rejected { consumed } => {
                    debug!("dropping {consumed} bytes of unrecognized line");
                    self.buf.drain(..consumed);
                }
                FrameEvent::Accepted { header, consumed } => {
                    self.buf.drain(..consumed);
                    return self.finish_frame(header);
                }
            }
        }
    }

    fn finish_frame(&mut self, header: serde_json::Value) -> Result<Frame, DriverError> {
        if crate::header::looks_like_image_header(&header)
            && header.get("binSize").is_none()
            && header.get("binWidth").is_none()
        {
            let h = FrameHeader::decode(&header)?;
            let format = h.pixel_format;
            let needed = h.width * h.height * format_bytes(format);
            self.fill_until(needed)?;
            let payload = self.buf.drain(..needed).collect();
            Ok(Frame::Image { header: h, payload })
        } else {
            let h = HistogramHeader::decode(&header)?;
            let needed = h.bin_size * 4;
            self.fill_until(needed)?;
            let payload = self.buf.drain(..needed).collect();
            Ok(Frame::Histogram { header: h, payload })
        }
    }
}

fn format_bytes(format: PixelFormat) -> usize {
    format.bytes_per_pixel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn reads_one_image_frame_across_partial_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let header = b"{\"width\":2,\"height\":1,\"pixelFormat\":\"uint16\",\"frameNumber\":3}\n";
            stream.write_all(&header[..10]).unwrap();
            std::thread::sleep(Duration::from_millis(5));
            stream.write_all(&header[10..]).unwrap();
            std::thread::sleep(Duration::from_millis(5));
            stream.write_all(&[0, 1]).unwrap();
            std::thread::sleep(Duration::from_millis(5));
            stream.write_all(&[0, 2]).unwrap();
        });

        let client = TcpStream::connect(addr).unwrap();
        let mut reader = FrameReader::from_stream(client);
        let frame = reader.read_frame().unwrap();
        match frame {
            Frame::Image { header, payload } => {
                assert_eq!(header.width, 2);
                assert_eq!(header.frame_number, 3);
                assert_eq!(payload, vec![0, 1, 0, 2]);
            }
            Frame::Histogram { .. } => panic!("expected image frame"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn skips_noise_line_before_a_valid_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"\x00\x00garbage line\n").unwrap();
            stream
                .write_all(b"{\"width\":1,\"height\":1,\"frameNumber\":0}\n")
                .unwrap();
            stream.write_all(&[7, 7]).unwrap();
        });

        let client = TcpStream::connect(addr).unwrap();
        let mut reader = FrameReader::from_stream(client);
        let frame = reader.read_frame().unwrap();
        match frame {
            Frame::Image { header, payload } => {
                assert_eq!(header.frame_number, 0);
                assert_eq!(payload, vec![7, 7]);
            }
            Frame::Histogram { .. } => panic!("expected image frame"),
        }
        handle.join().unwrap();
    }

    #[test]
    fn short_payload_on_early_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(b"{\"width\":4,\"height\":4,\"frameNumber\":0}\n")
                .unwrap();
            stream.write_all(&[1, 2, 3]).unwrap();
        });

        let client = TcpStream::connect(addr).unwrap();
        let mut reader = FrameReader::from_stream(client);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, DriverError::ShortPayload { .. }));
        handle.join().unwrap();
    }

    #[test]
    fn resolve_prefers_literal_ipv4() {
        let addr = resolve("127.0.0.1", 80).unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }

    #[test]
    fn resolve_rejects_zero_port() {
        assert!(FrameReader::connect("127.0.0.1", 0, Duration::from_millis(10)).is_err());
    }
}

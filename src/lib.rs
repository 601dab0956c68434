#![warn(missing_docs)]
/*! A driver for Amsterdam Scientific Instruments' Serval server, the
control and streaming backend for Timepix3-based pixel detectors.

This crate owns the three concerns that sit between a running Serval
instance and a control system: framing and decoding Serval's TCP data
streams (image and histogram channels), accumulating and windowing
frame data for live display, and sequencing Serval's REST measurement
lifecycle (`start`/`stop`) together with the per-channel workers that
lifecycle gates.

# Architecture overview

```text
   DriverConfig (TOML)
         |
         v
AcquisitionCoordinator -- REST (ServalClient) --> Serval
         |
         | start_acquisition() spawns one worker per enabled channel
         v
   worker::spawn  -- TCP (FrameReader/framing) --> Serval data port
         |
         v
ChannelProcessor (Image | Histogram)
         |
         v
     ParamBus (published arrays, scalars, strings)
```

Each channel worker runs on its own thread, decodes frames with
[`image_processor::ImageProcessor`] or [`histogram_processor::HistogramProcessor`],
and publishes results onto a [`parambus::ParamBus`] implementation
supplied by the host application (this crate never talks to a real
control system directly).

## Links

* Upstream Serval: <https://github.com/asi-cern/serval>
*/

pub mod config;
pub mod coordinator;
pub mod destination;
pub mod error;
pub mod framing;
pub mod header;
pub mod histogram_processor;
pub mod image_processor;
pub mod metrics;
pub mod parambus;
pub mod pixel;
pub mod reader;
pub mod rest;
pub mod worker;

pub use error::{DriverError, Result};

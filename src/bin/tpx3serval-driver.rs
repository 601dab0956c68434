/*! Standalone driver binary: loads a [`tpx3serval::config::DriverConfig`],
starts an acquisition, and runs until interrupted.

This binary is a thin demonstration wiring the library's pieces
together; a real control-system integration supplies its own
[`tpx3serval::parambus::ParamBus`] implementation and likely never uses
this binary at all.
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use tpx3serval::config::DriverConfig;
use tpx3serval::coordinator::AcquisitionCoordinator;
use tpx3serval::parambus::ParamBus;
use tpx3serval::rest::HttpServalClient;

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Path to a TOML configuration file (see `DriverConfig`).
    #[arg(short, long)]
    config: std::path::PathBuf,

    #[arg(short, default_value = "0")]
    verbose: usize,
}

/// A [`ParamBus`] that logs every publication at info level, for running
/// this binary without a real control-system backend.
struct LoggingParamBus;

impl ParamBus for LoggingParamBus {
    fn set_scalar(&self, name: &str, value: f64) {
        info!("{name} = {value}");
    }
    fn set_string(&self, name: &str, value: &str) {
        info!("{name} = {value:?}");
    }
    fn publish_array_u32(&self, name: &str, data: &[u32]) {
        info!("{name}: {} values", data.len());
    }
    fn publish_array_u64(&self, name: &str, data: &[u64]) {
        info!("{name}: {} values", data.len());
    }
    fn publish_array_f64(&self, name: &str, data: &[f64]) {
        info!("{name}: {} values", data.len());
    }
    fn callbacks(&self) {}
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("tpx3serval")
        .quiet(false)
        .verbosity(opt.verbose + 2)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let config = DriverConfig::load(&opt.config).context("loading configuration")?;
    let rest = Arc::new(
        HttpServalClient::new(
            config.server_url.clone(),
            config
                .basic_auth
                .as_ref()
                .map(|a| (a.username.clone(), a.password.clone())),
            config.rest_timeout(),
        )
        .context("building Serval REST client")?,
    );
    let bus: Arc<dyn ParamBus> = Arc::new(LoggingParamBus);
    let coordinator = AcquisitionCoordinator::new(rest, bus, config);

    let stopping = Arc::new(AtomicBool::new(false));
    let ctrlc_flag = stopping.clone();
    ctrlc::set_handler(move || ctrlc_flag.store(true, Ordering::SeqCst))
        .context("installing Ctrl-C handler")?;

    info!("starting acquisition");
    coordinator.start_acquisition().context("starting acquisition")?;

    while !stopping.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    info!("stopping acquisition");
    coordinator.stop_acquisition().context("stopping acquisition")?;
    Ok(())
}

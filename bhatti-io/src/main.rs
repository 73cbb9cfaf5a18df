//! BhattiIO daemon - polls one roaster device and logs every reading
//!
//! Exits with status 0 on Ctrl-C and 1 when the device fails three reads in
//! a row.

use bhatti_io::config::AppConfig;
use bhatti_io::devices::ChannelRegistry;
use bhatti_io::error::{Error, Result};
use bhatti_io::sampler::Sampler;
use bhatti_io::{DeviceError, Sample, shared};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long the main loop waits for events before re-checking shutdown
const EVENT_WAIT: Duration = Duration::from_millis(200);

/// Parse config path from command line arguments.
///
/// Supports:
/// - `bhatti-io <path>` (positional)
/// - `bhatti-io --config <path>` (flag-based)
/// - `bhatti-io -c <path>` (short flag)
///
/// Defaults to `/etc/bhatti-io.toml` if not specified.
fn parse_config_path() -> String {
    let args: Vec<String> = env::args().collect();

    for pair in args.windows(2).skip(1) {
        if pair[0] == "--config" || pair[0] == "-c" {
            return pair[1].clone();
        }
    }
    if let Some(first) = args.get(1) {
        if !first.starts_with('-') {
            return first.clone();
        }
    }
    "/etc/bhatti-io.toml".to_string()
}

fn main() -> ExitCode {
    let config_path = parse_config_path();
    let config = match AppConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
            log::error!("Cannot load {}: {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    log::info!("BhattiIO v{} starting...", env!("CARGO_PKG_VERSION"));
    log::info!("Using config: {}", config_path);

    match run(&config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Sample until Ctrl-C (`Ok(true)`) or escalation (`Ok(false)`)
fn run(config: &AppConfig) -> Result<bool> {
    let registry = ChannelRegistry::with_defaults();
    log::info!(
        "Device: {} (known types: {})",
        config.device.device_type(),
        registry.device_types().join(", ")
    );
    let channel = shared(registry.create(&config.device)?);

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    let escalated = Arc::new(AtomicBool::new(false));
    let sampler = Sampler::new();
    sampler.set_channel(channel);
    sampler.set_on_sample(|sample: Sample| {
        log::info!("BT {:>6.1}  ET {:>6.1}", sample.bt, sample.et);
    });
    let failed = Arc::clone(&escalated);
    sampler.set_on_error(move |e: &DeviceError| {
        log::error!("Device failed: {}", e);
        failed.store(true, Ordering::Relaxed);
    });

    sampler.start(config.sampling.interval()?)?;

    while running.load(Ordering::Relaxed) && sampler.is_running() {
        sampler.dispatch_timeout(EVENT_WAIT);
    }
    // Escalation events posted just before the loop noticed
    sampler.dispatch_pending();
    sampler.stop();

    log::info!("Sampled for {:.1} s", sampler.elapsed_ms() as f64 / 1000.0);
    Ok(!escalated.load(Ordering::Relaxed))
}

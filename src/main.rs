//! Read the Infinity meter from the command line.
//!
//! ```bash
//! infinity_meter --serial /dev/ttyS0 --address 01 --reads 3
//! infinity_meter --config meter.toml --log-level debug
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use infinity_meter::adapters::NoProxies;
use infinity_meter::{logging, InfinityMeter, MeterConfig, StatusNotifier};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "infinity_meter", about = "Newport INFS/Omega meter test reader")]
struct Args {
    /// Serial line path (e.g. /dev/ttyS0) or proxy device name
    #[arg(short, long)]
    serial: Option<String>,

    /// Two digit bus address of the meter
    #[arg(short, long)]
    address: Option<String>,

    /// Wait time in seconds between write and read operations
    #[arg(short = 't', long)]
    sleep: Option<f64>,

    /// Logging level (error, warning, info, debug)
    #[arg(long)]
    log_level: Option<String>,

    /// Number of consecutive sets of readings
    #[arg(short, long, default_value_t = 1)]
    reads: u32,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<MeterConfig> {
        let mut config = match (&self.config, &self.serial) {
            (Some(path), _) => MeterConfig::load_from(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            (None, Some(serial)) => MeterConfig::for_channel(serial.clone(), ""),
            (None, None) => bail!("Either --serial or --config is required"),
        };

        if let Some(serial) = self.serial {
            config.channel = serial;
        }
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(sleep) = self.sleep {
            config.timing.answer_sleep_ms = (sleep * 1000.0).round() as u64;
        }
        if let Some(level) = self.log_level {
            config.logging.level = match level.to_lowercase().as_str() {
                "warning" => "warn".to_string(),
                other => other.to_string(),
            };
        }

        config.validate()?;
        config.clamp_timing();
        Ok(config)
    }
}

async fn read_all(meter: &InfinityMeter, reads: u32) -> Result<()> {
    for i in 1..=reads {
        if !meter.open().await {
            bail!("Cannot open {}", meter);
        }

        let unfiltered = meter.get_unfiltered_value().await;
        let peak = meter.get_peak_value().await;
        let valley = meter.get_valley_value().await;
        let filtered = meter.get_filtered_value().await;
        meter.close().await;

        println!("read: {}/{}", i, reads);
        println!("Unfiltered: {}", unfiltered?);
        println!("Filtered:   {}", filtered?);
        println!("Peak:       {}", peak?);
        println!("Valley:     {}", valley?);
        println!();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let reads = args.reads;
    let config = args.into_config()?;
    logging::init_tracing(&config.logging.level)?;

    let meter = InfinityMeter::connect(config, &NoProxies, StatusNotifier::silent())
        .await
        .context("Error testing the Infinity Meter")?;
    read_all(&meter, reads)
        .await
        .context("Error testing the Infinity Meter")
}

//! CLI Entry Point for vicp_scope
//!
//! Provides a command-line interface for:
//! - Identifying an instrument and listing its channels and options
//! - Reading the built-in voltmeter
//! - Capturing one triggered acquisition and summarising it
//!
//! # Usage
//!
//! ```bash
//! vicp_scope --host 192.168.1.40 identify
//! vicp_scope --config config/vicp.toml meter --channel 1
//! vicp_scope --simulate acquire --timeout-ms 2000
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use vicp_scope::capabilities::{Acquisition, ChannelControl, Metering, TriggerState};
use vicp_scope::config::VicpConfig;
use vicp_scope::instrument::{Acquired, ChannelKind, SimulatedScope, VicpOscilloscope};
use vicp_scope::logging;

#[derive(Parser)]
#[command(name = "vicp_scope")]
#[command(about = "Talk to a VICP oscilloscope", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = "config/vicp.toml")]
    config: PathBuf,

    /// Instrument host, overrides the configuration file
    #[arg(long)]
    host: Option<String>,

    /// Instrument port, overrides the configuration file
    #[arg(long)]
    port: Option<u16>,

    /// Use the built-in simulated instrument instead of the network
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print identity, options and channels
    Identify,

    /// Read the voltmeter
    Meter {
        /// Input to measure (0-based analog channel)
        #[arg(long, default_value = "0")]
        channel: usize,
    },

    /// Arm a single capture, wait for the trigger and download it
    Acquire {
        /// Give up waiting for a trigger after this long
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = VicpConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.connection.host = host;
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let simulator = cli
        .simulate
        .then(|| SimulatedScope::new("WS3024").with_options(&["DVM", "AFG"]));
    let scope = match &simulator {
        Some(sim) => VicpOscilloscope::from_transport(Box::new(sim.clone()), &config)?,
        None => {
            info!(host = %config.connection.host, port = config.connection.port, "Connecting");
            VicpOscilloscope::connect(&config)?
        }
    };

    let result = match cli.command {
        Commands::Identify => identify(&scope),
        Commands::Meter { channel } => meter(&scope, channel),
        Commands::Acquire { timeout_ms } => {
            acquire(&scope, simulator.as_ref(), Duration::from_millis(timeout_ms))
        }
    };

    if let Err(e) = scope.close() {
        warn!(error = %e, "Closing the connection failed");
    }
    result
}

fn identify(scope: &VicpOscilloscope) -> Result<()> {
    let identity = scope.identity();
    println!("{}", identity);
    println!("  roles:   {:?}", scope.instrument_types());
    println!("  options: {:?}", identity.options);
    for channel in scope.roster().iter() {
        if channel.is_analog() {
            println!(
                "  {:<4} enabled={} range={:.3} V",
                channel.hw_name,
                scope.is_channel_enabled(channel.index)?,
                scope.voltage_range(channel.index)?
            );
        } else if channel.kind == ChannelKind::Digital {
            println!(
                "  {:<4} enabled={}",
                channel.hw_name,
                scope.is_channel_enabled(channel.index)?
            );
        } else {
            println!("  {:<4} {:?}", channel.hw_name, channel.kind);
        }
    }
    Ok(())
}

fn meter(scope: &VicpOscilloscope, channel: usize) -> Result<()> {
    scope.set_current_meter_channel(channel)?;
    scope.start_meter()?;
    let name = scope.meter_channel_name(channel)?;
    let mode = scope.meter_mode()?;
    println!("{} ({:?})", name, mode);
    println!("  voltage:      {:.6} V", scope.voltage()?);
    println!("  peak-to-peak: {:.6} V", scope.peak_to_peak()?);
    println!("  frequency:    {:.3} Hz", scope.frequency()?);
    scope.stop_meter()?;
    Ok(())
}

fn acquire(
    scope: &VicpOscilloscope,
    simulator: Option<&SimulatedScope>,
    timeout: Duration,
) -> Result<()> {
    scope.start_single_trigger()?;
    if let Some(sim) = simulator {
        sim.fire_trigger();
    }

    let deadline = Instant::now() + timeout;
    while scope.poll_trigger()? != TriggerState::Triggered {
        if Instant::now() >= deadline {
            scope.stop()?;
            bail!("no trigger within {} ms", timeout.as_millis());
        }
        thread::sleep(Duration::from_millis(20));
    }

    match scope.acquire_data(false)? {
        Acquired::Returned(set) => {
            for waveform in set.iter() {
                println!(
                    "  channel {} segment {}: {} samples, {:e} s/sample",
                    waveform.channel,
                    waveform.segment,
                    waveform.len(),
                    waveform.descriptor.horizontal_interval
                );
            }
            for line in set.digital_iter() {
                println!(
                    "  digital line {}: {} samples, {:e} s/sample",
                    line.line,
                    line.len(),
                    line.interval
                );
            }
            let queued = scope.pending_waveform_count();
            if queued > 0 {
                println!("  {} more segments queued", queued);
            }
        }
        Acquired::Queued { sets } => println!("  {} sets queued", sets),
        Acquired::NoEnabledChannels => println!("  no channels enabled"),
    }
    Ok(())
}

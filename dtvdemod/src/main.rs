//! dtvdemod: drive the demodulator control plane from the command line.
//!
//! Without hardware, `tune` runs against an in-memory register bus whose
//! registers are preset from the `[sim]` section of the config file.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Deserialize;

use dtvdemod::clock::{self, ClockRequest, PllLimits};
use dtvdemod::config::DemodConfig;
use dtvdemod::logging;
use dtvdemod::regs::{Hal, MemoryBus};
use dtvdemod::standard::snr::convert_snr;
use dtvdemod::tuner::FixedTuner;
use dtvdemod::types::{AddressSpace, ChipVariant, DeliverySystem, FrontendParams, Modulation};
use dtvdemod::Frontend;

/// dtvdemod - multi-standard DTV demodulator control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long, global = true)]
    config: Option<PathBuf>,

    /// Chip variant (overrides the config file)
    #[arg(long, global = true)]
    chip: Option<ChipVariant>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, global = true, default_value = "7")]
    log_retention_days: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search the ADC PLL for a clock pair
    Plan {
        #[arg(long)]
        adc_khz: u32,
        #[arg(long)]
        sys_khz: u32,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Convert a raw DTMB channel-estimator SNR reading to dB
    Snr { raw: u32 },
    /// Tune a simulated device and poll its lock status
    Tune {
        /// Delivery system (dvbc, j83b, dvbt, isdbt, atsc, dtmb, ...)
        #[arg(long)]
        system: DeliverySystem,
        #[arg(long)]
        frequency_khz: u32,
        /// Symbols per second
        #[arg(long, default_value = "6875000")]
        symbol_rate: u32,
        #[arg(long, default_value = "qam64")]
        modulation: Modulation,
        #[arg(long, default_value = "8000000")]
        bandwidth_hz: u32,
        /// Poll cycles after the initial tune
        #[arg(long, default_value = "3")]
        polls: u32,
    },
    /// Print the capability table for the chip
    Capabilities,
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    demod: DemodConfig,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    sim: SimSection,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimSection {
    strength_dbm: i32,
    #[serde(rename = "preset")]
    presets: Vec<RegisterPreset>,
}

impl Default for SimSection {
    fn default() -> Self {
        Self {
            strength_dbm: -50,
            presets: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterPreset {
    space: String,
    offset: u32,
    value: u32,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // explicit path > auto-detect > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("dtvdemod.toml");
        default_path.exists().then_some(default_path)
    });
    let mut file_config = match &config_path {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    // command line takes precedence over the file
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    if let Some(chip) = args.chip {
        file_config.demod.device.chip = chip;
    }
    let chip = file_config.demod.device.chip;

    match args.command {
        Command::Plan {
            adc_khz,
            sys_khz,
            json,
        } => print_plan(chip, adc_khz, sys_khz, json)?,
        Command::Snr { raw } => println!("{} dB", convert_snr(raw)),
        Command::Capabilities => print_capabilities(chip),
        Command::Tune {
            system,
            frequency_khz,
            symbol_rate,
            modulation,
            bandwidth_hz,
            polls,
        } => {
            let params = FrontendParams {
                delivery_system: system,
                frequency_hz: frequency_khz.saturating_mul(1000),
                symbol_rate,
                modulation,
                bandwidth_hz,
            };
            if let Err(e) = run_tune(file_config, params, polls).await {
                error!("tune failed: {}", e);
                return Err(e);
            }
        }
    }
    Ok(())
}

fn print_plan(
    chip: ChipVariant,
    adc_khz: u32,
    sys_khz: u32,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let limits = PllLimits::for_variant(chip);
    let plan = clock::synthesize(&limits, &ClockRequest::demod(adc_khz, sys_khz))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    println!("chip          {} ({:?} PLL)", chip, limits.family);
    println!("m / n         {} / {}", plan.m, plan.n);
    println!("vco           {} Hz (div2 {})", plan.vco_hz, plan.div2);
    println!(
        "fixed output  {} Hz (od {}, xd {})",
        plan.realized_a_hz, plan.od_a, plan.xd_a
    );
    println!(
        "adc clock     {} Hz (od {}, xd {})",
        plan.realized_b_hz, plan.od_b, plan.xd_b
    );
    if let (Some(div), Some(hz)) = (plan.system_divider, plan.realized_system_hz) {
        println!("system clock  {} Hz (divider {})", hz, div);
    }
    println!("error         {} Hz", plan.error_hz);
    Ok(())
}

fn print_capabilities(chip: ChipVariant) {
    let caps = chip.capabilities();
    println!("chip     {}", chip);
    println!("offsets  {:?}", caps.offsets);
    println!(
        "engines  dvbc {:?}, dvbt {:?}, atsc {:?}, dtmb {:?}",
        caps.dvbc, caps.dvbt, caps.atsc, caps.dtmb
    );
    let systems: Vec<String> = chip
        .supported_systems()
        .iter()
        .map(|s| format!("{} ({})", s, s.id()))
        .collect();
    println!("systems  {}", systems.join(", "));
}

async fn run_tune(
    config: ConfigFile,
    params: FrontendParams,
    polls: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let chip = config.demod.device.chip;
    let bus = Arc::new(MemoryBus::new());
    for preset in &config.sim.presets {
        let space: AddressSpace = preset.space.parse()?;
        bus.preset(space, preset.offset, preset.value);
    }
    let tuner = Arc::new(FixedTuner::new(config.sim.strength_dbm));
    let hal = Arc::new(Hal::new(bus, Some(tuner), chip));
    let frontend = Frontend::new(hal, config.demod);

    info!("simulated {} at {} dBm", chip, config.sim.strength_dbm);
    frontend.set_delivery_system(params.delivery_system.id()).await?;
    frontend.set_channel_parameters(params).await;

    for cycle in 0..=polls {
        let outcome = frontend.tune_with_flags(cycle == 0, 0).await?;
        let metrics = (
            frontend.read_snr().await?,
            frontend.read_signal_strength().await?,
            frontend.read_ber().await?,
        );
        println!(
            "[{}] {}: snr {} dB, strength {}%, ber {}, next poll in {} ms",
            cycle,
            outcome.status,
            metrics.0,
            metrics.1,
            metrics.2,
            outcome.delay.as_millis()
        );
        if cycle < polls {
            tokio::time::sleep(outcome.delay).await;
        }
    }

    frontend.release().await?;
    Ok(())
}

//! diskbroker CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use diskbroker::broker::{Broker, DiskInfo};
use diskbroker::config::cli::{Cli, Command, GlobalArgs};
use diskbroker::config::toml::load_config;
use diskbroker::config::validator::validate_config;
use diskbroker::config::BrokerConfig;
use diskbroker::exercise::{run_exercise, ExerciseOptions, ExerciseReport};
use diskbroker::target::label::{clear_label, read_label, write_label};
use diskbroker::target::DiskLabel;
use diskbroker::util::time::{format_bytes, format_duration};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global)?;

    let config = load_config(&cli.global)?;
    validate_config(&config).context("Configuration validation failed")?;
    tracing::debug!(?config, "configuration loaded");

    let json = cli.global.json;
    match cli.command {
        Command::Label { device, name, force } => {
            let name = write_label(&device, &name, force, &config.device)?;
            emit(json, &LabelReport::new(&device, DiskLabel::Labeled(name)))
        }
        Command::Query { device } => {
            let label = read_label(&device, &config.device)?;
            emit(json, &LabelReport::new(&device, label))
        }
        Command::Clear { device } => {
            clear_label(&device, &config.device)?;
            emit(json, &LabelReport::new(&device, DiskLabel::Cleared))
        }
        Command::Probe { device } => probe(&device, config, json),
        Command::Exercise {
            device,
            writes,
            blocks,
            start_block,
            seed,
        } => {
            let options = ExerciseOptions {
                writes,
                blocks,
                start_block,
                seed: seed.unwrap_or_else(rand::random),
            };
            let broker = Broker::start(config)?;
            let report = run_exercise(&broker, &device, &options)?;
            broker.stop()?;
            if json {
                print_json(&report)
            } else {
                print_exercise(&report);
                Ok(())
            }
        }
    }
}

fn init_logging(args: &GlobalArgs) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&args.log_level)
            .with_context(|| format!("Invalid log level: {}", args.log_level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

#[derive(Serialize)]
struct LabelReport {
    device: String,
    label: DiskLabel,
}

impl LabelReport {
    fn new(device: &Path, label: DiskLabel) -> Self {
        Self {
            device: device.display().to_string(),
            label,
        }
    }
}

impl std::fmt::Display for LabelReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.device, self.label)
    }
}

#[derive(Serialize)]
struct ProbeReport {
    disk: DiskInfo,
    label: DiskLabel,
}

impl std::fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let disk = &self.disk;
        writeln!(f, "Device:       {}", disk.path.display())?;
        writeln!(f, "  Identity:   {}", disk.identity)?;
        writeln!(f, "  Size:       {} ({} blocks)", format_bytes(disk.size_bytes), disk.sectors)?;
        writeln!(f, "  Block size: {}", disk.block_size)?;
        writeln!(f, "  Max xfer:   {}", format_bytes(disk.max_transfer_bytes))?;
        write!(f, "  Label:      {}", self.label)
    }
}

fn probe(device: &Path, config: BrokerConfig, json: bool) -> Result<()> {
    let label = read_label(device, &config.device)?;

    let broker = Broker::start(config)?;
    let ctx = broker.attach()?;
    let disk = ctx
        .open(device)
        .with_context(|| format!("Failed to open {}", device.display()))?;
    let info = ctx.disk_info(disk)?;
    ctx.close(disk)?;
    ctx.detach();
    broker.stop()?;

    emit(json, &ProbeReport { disk: info, label })
}

fn emit<T: Serialize + std::fmt::Display>(json: bool, report: &T) -> Result<()> {
    if json {
        print_json(report)
    } else {
        println!("{}", report);
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

fn print_exercise(report: &ExerciseReport) {
    let write = Duration::from_micros(report.write_us);
    let read = Duration::from_micros(report.read_us);
    let rate = |elapsed: Duration| {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            format!("{}/s", format_bytes((report.bytes as f64 / secs) as u64))
        } else {
            "-".to_string()
        }
    };

    println!("═══════════════════════════════════════════════════════════");
    println!("                    EXERCISE RESULTS");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Device: {} ({})", report.device.display(), report.disk.identity);
    println!("Seed:   {}", report.seed);
    println!();
    println!("Transfers:");
    println!("  Count:    {} x {}", report.transfers, format_bytes(report.bytes / report.transfers.max(1)));
    println!("  Write:    {} in {} ({})", format_bytes(report.bytes), format_duration(write), rate(write));
    println!("  Read:     {} in {} ({})", format_bytes(report.bytes), format_duration(read), rate(read));
    println!("  Verified: {}", report.verified);
    if report.busy_retries > 0 {
        println!("  Busy retries: {}", report.busy_retries);
    }
    println!();

    let stats = &report.stats;
    println!("Latency:");
    let show = |name: &str, us: Option<u64>| match us {
        Some(us) => println!("  {:<5} {}", name, format_duration(Duration::from_micros(us))),
        None => println!("  {:<5} -", name),
    };
    show("Min:", stats.latency_min_us);
    show("Mean:", stats.latency_mean_us);
    show("p50:", stats.latency_p50_us);
    show("p99:", stats.latency_p99_us);
    show("Max:", stats.latency_max_us);
}

//! Wafer flow simulation application.
#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::default_trait_access)]

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;

use toolsim::{Driver, RunSummary, SimulationConfig};

/// Runs a wafer flow simulation.
#[derive(Parser)]
#[clap(version, author)]
struct Opt {
    /// Path to the simulation configuration in JSON format.
    #[clap(long, short)]
    config: PathBuf,

    /// Write per-wafer processing records to this CSV file.
    #[clap(long, short)]
    output: Option<PathBuf>,

    /// Override the simulated horizon from the configuration, e.g. `2h 30m`.
    #[clap(long)]
    horizon: Option<humantime::Duration>,

    /// Override the RNG seed from the configuration.
    #[clap(long)]
    seed: Option<u64>,

    /// Verbosity.
    #[clap(short, long, parse(from_occurrences))]
    verbose: i32,

    /// Store the logs in this file.
    #[clap(long)]
    log_output: Option<PathBuf>,

    /// Do not log to the stderr.
    #[clap(long)]
    no_stderr: bool,
}

/// Set up a logger based on the given user options.
fn set_up_logger(opt: &Opt) -> Result<(), fern::InitError> {
    let log_level = match opt.verbose {
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        3 => log::LevelFilter::Trace,
        _ => log::LevelFilter::Warn,
    };
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)))
        .level(log_level);
    let dispatch = if let Some(path) = &opt.log_output {
        let _ = std::fs::remove_file(path);
        dispatch.chain(
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .append(false)
                .open(path)?,
        )
    } else {
        dispatch
    };
    let dispatch = if opt.no_stderr {
        dispatch
    } else {
        dispatch.chain(std::io::stderr())
    };
    dispatch.apply()?;
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("simulated time: {:?}", summary.elapsed);
    println!(
        "wafers: started={} completed={} dropped={} active={}",
        summary.started, summary.completed, summary.dropped, summary.active
    );
    println!("throughput: {:.2}/h", summary.throughput_per_hour);
    let ct = &summary.cycle_time;
    println!(
        "cycle time: mean={:.1}s min={:.1}s max={:.1}s (n={})",
        ct.mean.as_secs_f64(),
        ct.min.as_secs_f64(),
        ct.max.as_secs_f64(),
        ct.count
    );
    println!("nodes:");
    for node in &summary.nodes {
        println!(
            "  {:<24} in={:<6} out={:<6} rejected={:<4} dropped={:<4} held={:<4} util={:.0}%",
            node.label,
            node.stats.entered,
            node.stats.exited,
            node.stats.rejected,
            node.stats.dropped,
            node.stats.held,
            node.utilization * 100.0
        );
    }
    println!("instances:");
    for instance in &summary.instances {
        println!(
            "  {:<24} granted={:<6} in_use={}",
            instance.name, instance.granted, instance.in_use
        );
    }
}

fn run(opt: &Opt) -> eyre::Result<()> {
    let config_file = File::open(&opt.config)
        .wrap_err_with(|| format!("unable to open config file: {}", opt.config.display()))?;
    let mut config = SimulationConfig::from_json(config_file)
        .wrap_err_with(|| format!("unable to parse config file: {}", opt.config.display()))?;
    if let Some(horizon) = opt.horizon {
        config.run.horizon = horizon.as_secs_f64();
    }
    if let Some(seed) = opt.seed {
        config.run.seed = seed;
    }

    let mut driver = Driver::new(&config).wrap_err("invalid simulation configuration")?;
    driver.run();
    if let Some(path) = &opt.output {
        let file = File::create(path)
            .wrap_err_with(|| format!("unable to create output file: {}", path.display()))?;
        driver
            .write_records(BufWriter::new(file))
            .wrap_err("unable to write processing records")?;
    }
    print_summary(&driver.summary());
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();
    set_up_logger(&opt)?;
    run(&opt)
}

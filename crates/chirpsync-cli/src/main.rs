//! # chirpsync
//!
//! Runs sensing/attack experiments against a simulated FMCW victim.
//!
//! ```bash
//! chirpsync --print-example-config > chirpsync.yaml
//! chirpsync --config chirpsync.yaml --runs 5 --output-dir results/
//! chirpsync --slope 0.8 --frame-period-ms 12 --speed 1.0 -v
//! chirpsync --attack-signal attack.sc16 --signal-format sc16
//! ```

mod logging;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use chirpsync_core::config::ExperimentConfig;
use chirpsync_core::experiment::{Experiment, ExperimentReport};
use chirpsync_core::io::IqFormat;
use chirpsync_sim::{SimConfig, SimTestbed, VictimRadar};

/// FMCW radar sensing and predictive attack synchronization
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Experiment configuration (YAML); searched for when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulation settings (YAML)
    #[arg(long)]
    sim_config: Option<PathBuf>,

    /// Number of experiment runs
    #[arg(short, long, default_value = "1")]
    runs: usize,

    /// Directory for per-run estimate files
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Victim chirp slope (MHz/µs)
    #[arg(long)]
    slope: Option<f64>,

    /// Victim frame period (ms)
    #[arg(long)]
    frame_period_ms: Option<f64>,

    /// Victim distance (m), applied to the simulation and its correction
    #[arg(long)]
    distance_m: Option<f64>,

    /// Follow wall time scaled by this factor instead of virtual time
    #[arg(long)]
    speed: Option<f64>,

    /// Noise seed
    #[arg(long)]
    seed: Option<u64>,

    /// Disable the attack and only sense
    #[arg(long)]
    no_attack: bool,

    /// Attack waveform file, replacing the synthesized chirp
    #[arg(long)]
    attack_signal: Option<PathBuf>,

    /// Encoding of the attack waveform file (cf64, cf32/ettus, ci16/sc16)
    #[arg(long, value_parser = parse_signal_format)]
    signal_format: Option<IqFormat>,

    /// Print the reports as YAML after the summaries
    #[arg(long)]
    yaml: bool,

    /// Print an example experiment configuration and exit
    #[arg(long)]
    print_example_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_example_config {
        print!("{}", ExperimentConfig::example_yaml());
        return Ok(());
    }

    let mut config = load_config(args.config.as_deref())?;
    logging::init_logging(&config.logging, args.verbose);

    let mut sim = load_sim_config(args.sim_config.as_deref())?;
    apply_overrides(&args, &mut config, &mut sim);
    config.validate().context("invalid configuration")?;

    if let Some(dir) = &config.sensing.output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
    }

    let testbed =
        SimTestbed::new(&sim, config.radio.sample_rate).context("building simulated testbed")?;
    let victim = testbed.victim().clone();
    let (receiver, transmitter, clock) = testbed.into_radios();

    let mut experiment =
        Experiment::new(config, receiver, transmitter, clock).context("setting up experiment")?;
    info!(noise_db = experiment.noise_floor_db(), runs = args.runs, "starting");

    let reports = experiment
        .run_repeated(args.runs)
        .context("running experiment")?;

    for report in &reports {
        print_summary(report, &victim);
    }

    if args.yaml {
        let yaml = serde_yaml::to_string(&reports).context("serializing reports")?;
        println!("{}", yaml);
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => ExperimentConfig::load()
            .context("no configuration found (pass --config or see --print-example-config)"),
    }
}

fn load_sim_config(path: Option<&Path>) -> Result<SimConfig> {
    let path = match path {
        Some(path) => path,
        None => return Ok(SimConfig::default()),
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading simulation settings from {}", path.display()))?;
    serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing simulation settings from {}", path.display()))
}

fn parse_signal_format(name: &str) -> Result<IqFormat, String> {
    IqFormat::from_name(name).ok_or_else(|| format!("unknown sample format '{}'", name))
}

fn apply_overrides(args: &Args, config: &mut ExperimentConfig, sim: &mut SimConfig) {
    if let Some(dir) = &args.output_dir {
        config.sensing.output_dir = Some(dir.clone());
    }
    if args.no_attack {
        config.attack.enabled = false;
    }
    if let Some(path) = &args.attack_signal {
        config.attack.signal_file = Some(path.clone());
    }
    if let Some(format) = args.signal_format {
        config.attack.signal_format = format;
    }
    if let Some(slope) = args.slope {
        sim.victim.slope_mhz_per_us = slope;
    }
    if let Some(period) = args.frame_period_ms {
        sim.victim.frame_period_ms = period;
    }
    if let Some(distance) = args.distance_m {
        sim.victim.distance_m = distance;
        config.sensing.victim_distance_m = distance;
    }
    if args.speed.is_some() {
        sim.speed = args.speed;
    }
    if args.seed.is_some() {
        sim.seed = args.seed;
    }
}

fn print_summary(report: &ExperimentReport, victim: &VictimRadar) {
    let sensing = &report.sensing;
    let estimates = &sensing.estimates;
    let truth = victim.config();

    match report.run_number {
        Some(run) => println!("\n=== Run {} ===", run),
        None => println!("\n=== Experiment ==="),
    }
    println!(
        "  Cycles: {} (captured {}, rejected {}, no chirp {}, dropped {})",
        sensing.cycles, sensing.frames_captured, sensing.frames_rejected, sensing.no_chirp, sensing.dropped
    );

    if let Some(slope) = estimates.avg_slope_mhz_per_us {
        println!("  Slope:        {:.4} MHz/µs (victim {:.4})", slope, truth.slope_mhz_per_us);
    }
    if let Some(period) = estimates.avg_chirp_period_us {
        println!(
            "  Chirp period: {:.3} µs (victim {:.3})",
            period,
            victim.chirp_period_s() * 1e6
        );
    }
    if let Some(frame) = estimates.avg_frame_duration_us {
        println!(
            "  Frame period: {:.3} ms (victim {:.3})",
            frame * 1e-3,
            truth.frame_period_ms
        );
    }
    if let Some(next) = estimates.predicted_next_start_us {
        println!("  Next frame:   {:.6} s", next * 1e-6);
    }

    println!(
        "  Predictions:  {} published, {} discarded",
        sensing.predictions_published, sensing.predictions_discarded
    );

    if let Some(attack) = &report.attack {
        let errors_us: Vec<f64> = attack
            .transmit_times_s
            .iter()
            .map(|&t| (t - victim.frame_start_s(victim.nearest_frame(t))) * 1e6)
            .collect();
        println!(
            "  Attack:       {} frames ({} late, {} failed)",
            attack.frames_transmitted, attack.late_frames, attack.failed_frames
        );
        if !errors_us.is_empty() {
            let mean = errors_us.iter().sum::<f64>() / errors_us.len() as f64;
            let worst = errors_us.iter().fold(0.0_f64, |acc, e| acc.max(e.abs()));
            println!("  Alignment:    mean {:+.3} µs, worst {:.3} µs", mean, worst);
        }
    }

    if let Some(path) = &sensing.results_file {
        println!("  Results:      {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> ExperimentConfig {
        ExperimentConfig::parse(ExperimentConfig::example_yaml()).unwrap()
    }

    #[test]
    fn test_overrides_reach_config_and_simulation() {
        let args = Args::try_parse_from([
            "chirpsync",
            "--slope",
            "0.8",
            "--distance-m",
            "150",
            "--speed",
            "2",
            "--no-attack",
            "-o",
            "out",
        ])
        .unwrap();
        let mut config = example();
        let mut sim = SimConfig::default();
        apply_overrides(&args, &mut config, &mut sim);

        assert_eq!(sim.victim.slope_mhz_per_us, 0.8);
        assert_eq!(sim.victim.distance_m, 150.0);
        assert_eq!(config.sensing.victim_distance_m, 150.0);
        assert_eq!(sim.speed, Some(2.0));
        assert_eq!(sim.seed, SimConfig::default().seed);
        assert!(!config.attack.enabled);
        assert_eq!(config.sensing.output_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn test_signal_format_aliases() {
        let args = Args::try_parse_from([
            "chirpsync",
            "--attack-signal",
            "attack.sc16",
            "--signal-format",
            "SC16",
        ])
        .unwrap();
        let mut config = example();
        apply_overrides(&args, &mut config, &mut SimConfig::default());

        assert_eq!(config.attack.signal_format, IqFormat::Ci16);
        assert_eq!(config.attack.signal_file, Some(PathBuf::from("attack.sc16")));

        assert!(Args::try_parse_from(["chirpsync", "--signal-format", "cu8"]).is_err());
    }

    #[test]
    fn test_sim_config_yaml_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.yaml");
        std::fs::write(&path, "victim:\n  frame_period_ms: 12.5\nspeed: 1.0\n").unwrap();

        let sim = load_sim_config(Some(path.as_path())).unwrap();
        assert_eq!(sim.victim.frame_period_ms, 12.5);
        assert_eq!(sim.victim.slope_mhz_per_us, 0.5);
        assert_eq!(sim.speed, Some(1.0));
        assert_eq!(sim.noise_power_db, Some(-40.0));
    }

    #[test]
    fn test_missing_config_file_has_context() {
        let err = load_config(Some(Path::new("/nonexistent/chirpsync.yaml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/chirpsync.yaml"));
    }
}

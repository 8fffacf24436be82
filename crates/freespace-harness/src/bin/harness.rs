//! CLI entrypoint for the freespace workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use freespace_core::{LockingRegime, SpaceConfig};
use freespace_harness::{EpochConfig, HarnessReport, StormConfig, StormKind, run_epochs, run_storm};

/// Workload drivers for freespace-core.
#[derive(Debug, Parser)]
#[command(name = "freespace-harness")]
#[command(about = "Storm and parallel-epoch drivers for the free-list space")]
struct Cli {
    /// Space config JSON; missing fields take defaults. Without it, the
    /// environment overrides apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Force a locking regime (`serial` or `parallel`).
    #[arg(long, global = true)]
    locking: Option<String>,
    /// Write the report as markdown here, and as JSON next to it.
    #[arg(long, global = true)]
    report: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one storm, or every storm kind.
    Storm {
        /// Storm kind; omit to run all of them.
        #[arg(long, value_enum)]
        kind: Option<StormKind>,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        #[arg(long, default_value_t = 20_000)]
        ops: usize,
        /// Space size in words.
        #[arg(long, default_value_t = 1 << 16)]
        capacity: usize,
        #[arg(long, default_value_t = 512)]
        slots: usize,
    },
    /// Run parallel collector epochs.
    Epoch {
        #[arg(long, default_value_t = 3)]
        epochs: usize,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, default_value_t = 500)]
        blocks_per_worker: usize,
        #[arg(long, default_value_t = 32)]
        max_size: usize,
        /// Space size in words.
        #[arg(long, default_value_t = 1 << 20)]
        capacity: usize,
        #[arg(long, default_value = "0x5EED")]
        seed: String,
    },
    /// Print the effective space config as JSON.
    DumpConfig,
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid seed '{raw}': {err}"))
}

fn load_space_config(cli: &Cli) -> Result<SpaceConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => SpaceConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => SpaceConfig::from_env(),
    };
    if let Some(raw) = &cli.locking {
        config.locking = LockingRegime::from_str_loose(raw);
    }
    config.validate()?;
    Ok(config)
}

fn write_report(report: &HarnessReport, path: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            std::fs::write(path, report.to_markdown())?;
            let json_path = path.with_extension("json");
            std::fs::write(&json_path, report.to_json())?;
            eprintln!("Wrote {} and {}", path.display(), json_path.display());
        }
        None => println!("{}", report.to_json()),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let space_config = load_space_config(&cli)?;

    match &cli.command {
        Command::Storm {
            kind,
            seed,
            ops,
            capacity,
            slots,
        } => {
            let seed = parse_seed(seed)?;
            let kinds: Vec<StormKind> = match kind {
                Some(kind) => vec![*kind],
                None => StormKind::all().to_vec(),
            };
            let mut report = HarnessReport::new("freespace storms", space_config.clone());
            for kind in kinds {
                let storm = StormConfig {
                    kind,
                    seed,
                    ops: *ops,
                    capacity: *capacity,
                    slots: *slots,
                    ..StormConfig::default()
                };
                eprintln!("Running {} storm ({} ops)", kind.as_str(), ops);
                report.storms.push(run_storm(&space_config, &storm)?);
            }
            write_report(&report, cli.report.as_ref())?;
            if !report.all_passed() {
                return Err("storm verification failed".into());
            }
        }
        Command::Epoch {
            epochs,
            workers,
            blocks_per_worker,
            max_size,
            capacity,
            seed,
        } => {
            let config = EpochConfig {
                epochs: *epochs,
                workers: *workers,
                blocks_per_worker: *blocks_per_worker,
                max_size: *max_size,
                capacity: *capacity,
                seed: parse_seed(seed)?,
                ..EpochConfig::default()
            };
            eprintln!(
                "Running {epochs} epochs with {workers} workers under {:?} locking",
                space_config.locking
            );
            let mut report = HarnessReport::new("freespace epochs", space_config.clone());
            report.epochs = Some(run_epochs(&space_config, &config)?);
            write_report(&report, cli.report.as_ref())?;
            if !report.all_passed() {
                return Err("epoch verification failed".into());
            }
        }
        Command::DumpConfig => {
            println!("{}", serde_json::to_string_pretty(&space_config)?);
        }
    }
    Ok(())
}

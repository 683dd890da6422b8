//! Run a workload once and save checkpoints at region starts or simpoints
use anyhow::Context;
use clap::{Parser, Subcommand};
use log::warn;
use regionpoint::{
    CheckpointStore, ExitEvent, RegionCatalog, RegionCheckpoints, RegionTracker, RunArgs,
    RunDriver, SimPointCheckpoints, SimPointResult, SimPointSchedule, TraceMachine,
};
use std::path::PathBuf;

// checkpoint folder structure
// checkpoint_outputs/
// |- region-1-checkpoint
// |  |- machine.state.zst
// |  \- metadata.json
// |- simpoint-0
// \- simpoints.json

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One checkpoint per region of a pinpoints catalog
    #[clap(name = "looppoint")]
    LoopPoint {
        /// Where the catalog with resolved relative targets goes
        #[arg(long, default_value = "looppoint.json")]
        output: PathBuf,
    },
    /// One checkpoint per simpoint, ahead of it by the warmup interval
    #[clap(name = "simpoint")]
    SimPoint {
        /// SimPoint analysis result, as written by the simpoint tool
        #[arg(long, conflicts_with_all = ["interval", "simpoints", "weights"])]
        result: Option<PathBuf>,

        /// Interval length in instructions
        #[arg(long, required_unless_present = "result")]
        interval: Option<u64>,

        /// Interval numbers of the simpoints
        #[arg(long, value_delimiter = ',')]
        simpoints: Vec<u64>,

        /// Weight of each simpoint
        #[arg(long, value_delimiter = ',')]
        weights: Vec<f64>,

        /// Warmup length in instructions
        #[arg(long, default_value_t = 0)]
        warmup: u64,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();
    let config = args.run.resolve()?;

    let machine = TraceMachine::open(
        &config.workload.trace,
        config.machine.cores,
        config.machine.memory_size,
    )
    .with_context(|| format!("Failed to read trace {}", config.workload.trace.display()))?;
    println!(
        "Loaded {} instructions from {} on {}",
        machine.trace_len(),
        config.workload.trace.display(),
        config.machine.describe()
    );

    std::fs::create_dir_all(&config.checkpoint_dir)?;
    let store = CheckpointStore::new(&config.checkpoint_dir);

    match args.command {
        Commands::LoopPoint { output } => {
            let catalog_path = config
                .catalog
                .as_ref()
                .context("A region catalog is required, use --catalog")?;
            let catalog = RegionCatalog::load(catalog_path)?;
            let tracker = RegionTracker::new(&catalog, config.tracker_options());
            let mut driver = RunDriver::new(machine, tracker, store)
                .max_instructions(config.max_instructions)
                .on(ExitEvent::RegionBegin, RegionCheckpoints);
            let summary = driver.run()?;
            println!(
                "Took {} checkpoints of {} regions",
                summary.regions_completed,
                driver.tracker().regions().len()
            );

            driver.tracker().resolved_catalog()?.write_json(&output)?;
            println!("Region catalog written to {}", output.display());
        }
        Commands::SimPoint {
            result,
            interval,
            simpoints,
            weights,
            warmup,
        } => {
            let schedule = match (result, interval) {
                (Some(path), _) => {
                    let result: SimPointResult = serde_json::from_slice(&std::fs::read(&path)?)
                        .with_context(|| format!("Failed to parse {}", path.display()))?;
                    result.to_schedule(warmup)?
                }
                (None, Some(interval)) => {
                    SimPointSchedule::new(interval, &simpoints, &weights, warmup)?
                }
                (None, None) => anyhow::bail!("Either --result or --interval is required"),
            };
            if config.max_instructions.is_some() {
                warn!("max_instructions is ignored when taking simpoint checkpoints");
            }

            let tracker = RegionTracker::new(&RegionCatalog::empty(), config.tracker_options());
            let mut driver = RunDriver::new(machine, tracker, store)
                .on(ExitEvent::MaxInstructions, SimPointCheckpoints::new(&schedule.simpoints));
            driver.run()?;

            let schedule_path = config.checkpoint_dir.join("simpoints.json");
            schedule.save(&schedule_path)?;
            println!(
                "Took checkpoints for {} simpoints, schedule written to {}",
                schedule.simpoints.len(),
                schedule_path.display()
            );
        }
    }

    Ok(())
}

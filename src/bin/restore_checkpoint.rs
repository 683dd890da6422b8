//! Restore a checkpoint and measure the region or simpoint behind it
use anyhow::Context;
use clap::{Parser, Subcommand};
use regionpoint::{
    CheckpointStore, ExitEvent, RegionCatalog, RegionTracker, ResetAndDump, RunArgs, RunConfig,
    RunDriver, SimPointSchedule, SimPointWarmup, StatsController, TableSink, Target, TextSink,
    TraceMachine,
};

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
    /// Restore `region-<id>-checkpoint`, warm up and measure that region
    Region {
        /// The checkpoint region to restore from
        #[arg(long)]
        region: Option<String>,
    },
    /// Restore `simpoint-<i>`, warm up and measure one interval
    #[clap(name = "simpoint")]
    SimPoint {
        /// Position of the simpoint in simpoints.json
        #[arg(long)]
        simpoint: usize,
    },
    /// No checkpoint: fast-forward to a start marker and measure until an end marker
    Elfie {
        /// Start marker as location,count
        #[arg(long)]
        start: Target,

        /// End marker as location,count
        #[arg(long)]
        end: Target,
    },
}

fn stats_controller(config: &RunConfig) -> StatsController {
    match &config.stats_path {
        Some(path) => StatsController::new().with_sink(TextSink::new(path)),
        None => StatsController::new().with_sink(TableSink),
    }
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
    let store = CheckpointStore::new(&config.checkpoint_dir);

    let summary = match args.command {
        Commands::Region { region } => {
            let region = region
                .or_else(|| config.region.clone())
                .unwrap_or_else(|| "1".to_string());
            let catalog_path = config
                .catalog
                .as_ref()
                .context("A region catalog is required, use --catalog")?;
            let catalog = RegionCatalog::load(catalog_path)?.select(&region)?;
            let tracker = RegionTracker::new(&catalog, config.tracker_options());
            let mut driver = RunDriver::new(machine, tracker, store)
                .with_stats(stats_controller(&config))
                .restore_from(format!("region-{}-checkpoint", region))
                .max_instructions(config.max_instructions)
                .on(ExitEvent::RegionBegin, ResetAndDump);
            driver.run()?
        }
        Commands::SimPoint { simpoint } => {
            let schedule = SimPointSchedule::load(config.checkpoint_dir.join("simpoints.json"))?;
            let Some(point) = schedule.simpoints.get(simpoint) else {
                anyhow::bail!(
                    "No simpoint {}, the schedule has {}",
                    simpoint,
                    schedule.simpoints.len()
                );
            };
            println!(
                "Simpoint {} covers instructions {}..{} with weight {:.4}, warmup {}",
                simpoint,
                point.start,
                point.start + schedule.interval,
                point.weight,
                point.warmup
            );
            let tracker = RegionTracker::new(&RegionCatalog::empty(), config.tracker_options());
            let mut driver = RunDriver::new(machine, tracker, store)
                .with_stats(stats_controller(&config))
                .restore_from(format!("simpoint-{}", simpoint))
                .on(
                    ExitEvent::MaxInstructions,
                    SimPointWarmup::new(point, schedule.interval),
                );
            driver.run()?
        }
        Commands::Elfie { start, end } => {
            println!("Region starts at {} and ends at {}", start, end);
            let tracker = RegionTracker::elfie(start, end, config.tracker_options());
            let mut driver = RunDriver::new(machine, tracker, store)
                .with_stats(stats_controller(&config))
                .max_instructions(config.max_instructions)
                .on(ExitEvent::RegionBegin, ResetAndDump);
            driver.run()?
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

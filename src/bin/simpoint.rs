//! Use SimPoint methodology to find representative intervals of a trace
use clap::Parser;
use regionpoint::{analyze, read_trace};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to trace file
    #[arg(short, long)]
    trace_path: PathBuf,

    /// SimPoint slice size in instructions
    #[arg(short, long)]
    size: u64,

    /// Largest number of clusters to try
    #[arg(short, long, default_value_t = 20)]
    max_clusters: usize,

    /// Warmup length in instructions for the printed schedule
    #[arg(short, long, default_value_t = 0)]
    warmup: u64,

    /// Output prefix, json goes to: {output_prefix}.json
    #[arg(short, long)]
    output_prefix: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let (records, num_cores) = read_trace(&args.trace_path)?;
    println!("Got {} instructions on {} cores", records.len(), num_cores);

    let result = analyze(&args.trace_path, &records, args.size, args.max_clusters)?;

    let schedule = result.to_schedule(args.warmup)?;
    for simpoint in &schedule.simpoints {
        println!(
            "- interval {} (instructions {}..{}), weight {:.4}, checkpoint at {}",
            simpoint.index,
            simpoint.start,
            simpoint.start + schedule.interval,
            simpoint.weight,
            simpoint.checkpoint_point()
        );
    }

    let json_path = format!("{}.json", args.output_prefix);
    std::fs::write(&json_path, serde_json::to_vec_pretty(&result)?)?;
    println!("SimPoint configuration written to {}", json_path);

    Ok(())
}

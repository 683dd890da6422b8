use clap::{Parser, Subcommand};
use cli_table::{Cell, Table, print_stdout};
use regionpoint::{TraceFileDecoder, get_tqdm_style, parse_text_trace, write_trace};
use size::Size;
use std::{collections::HashMap, path::PathBuf};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a trace
    Info {
        /// Path to trace file
        trace: PathBuf,

        /// How many of the hottest addresses to list
        #[arg(short, long, default_value_t = 10)]
        top: usize,
    },
    /// Convert a text trace (`pc [core]` per line) to a trace file
    Convert {
        /// Path to text input
        input: PathBuf,

        /// Path to trace file
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();
    match args.command {
        Commands::Info { trace, top } => {
            let content = std::fs::read(&trace)?;
            let file = TraceFileDecoder::open(&content)?;
            println!(
                "Got {} instructions on {} cores in {}",
                file.num_records,
                file.num_cores,
                Size::from_bytes(content.len() as u64)
            );

            let pbar = indicatif::ProgressBar::new(file.num_records as u64);
            pbar.set_style(get_tqdm_style()?);
            let mut core_counts = vec![0usize; file.num_cores.max(1)];
            let mut pc_counts: HashMap<u64, usize> = HashMap::new();
            for records in file.records()? {
                let records = records?;
                for record in &records {
                    if let Some(count) = core_counts.get_mut(record.core as usize) {
                        *count += 1;
                    }
                    *pc_counts.entry(record.pc).or_default() += 1;
                }
                pbar.inc(records.len() as u64);
            }
            pbar.finish();

            println!("Instructions per core:");
            for (core, count) in core_counts.iter().enumerate() {
                println!("- core {}: {}", core, count);
            }

            println!("Top addresses by execution count:");
            let mut items: Vec<(&u64, &usize)> = pc_counts.iter().collect();
            items.sort_by_key(|(pc, count)| (std::cmp::Reverse(**count), **pc));
            let mut table = vec![];
            for (pc, count) in items.iter().take(top) {
                table.push(vec![
                    format!("0x{:08x}", pc).cell(),
                    count.cell(),
                    format!("{:.2}", **count as f64 * 100.0 / file.num_records.max(1) as f64)
                        .cell(),
                ]);
            }
            let table = table.table().title(vec![
                "PC".cell(),
                "Execution Count".cell(),
                "Share (%)".cell(),
            ]);
            print_stdout(table)?;
        }
        Commands::Convert { input, output } => {
            let records = parse_text_trace(&std::fs::read_to_string(&input)?)?;
            write_trace(&output, &records)?;
            println!(
                "Wrote {} instructions to {}",
                records.len(),
                output.display()
            );
        }
    }

    Ok(())
}

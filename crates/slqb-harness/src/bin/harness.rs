//! CLI entrypoint for the SLQB stress harness.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use slqb_core::{CheckMode, GfpFlags, SimulatedPageSource, SlqbConfig, Slqb};
use slqb_harness::{StormConfig, StormType, run_storm};

/// Stress tooling for the SLQB slab allocator.
#[derive(Debug, Parser)]
#[command(name = "slqb-harness")]
#[command(about = "Allocation storms and slabinfo reports for SLQB")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run allocation storms and emit a JSON report per storm.
    Storm {
        /// Storm to run (sawtooth, random_churn, cross_cpu, size_class_thrash, or all).
        #[arg(long, default_value = "all")]
        storm: String,
        /// Worker threads, each bound to its own CPU.
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Operations per thread.
        #[arg(long, default_value_t = 20_000)]
        ops: usize,
        /// RNG seed (decimal or 0x-prefixed hex).
        #[arg(long, default_value = "0x5EED")]
        seed: String,
        /// Simulated NUMA nodes.
        #[arg(long, default_value_t = 2)]
        nodes: u32,
        /// Page budget per node.
        #[arg(long, default_value_t = 1 << 18)]
        pages_per_node: usize,
        /// Free-path checking (checked or fast).
        #[arg(long, default_value = "checked")]
        check: String,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Allocate `count` objects of `size` bytes and print the resulting slabinfo.
    Slabinfo {
        /// Request size in bytes.
        #[arg(long, default_value_t = 256)]
        size: usize,
        /// Objects to allocate before sampling.
        #[arg(long, default_value_t = 1000)]
        count: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Storm {
            storm,
            threads,
            ops,
            seed,
            nodes,
            pages_per_node,
            check,
            output,
        } => {
            let storms = StormType::parse_list(&storm)?;
            let seed = parse_seed(&seed)?;
            let check_mode = CheckMode::from_str_loose(&check);
            let mut reports = Vec::with_capacity(storms.len());
            let mut failed = Vec::new();
            for storm in storms {
                eprintln!("Running {} storm: {threads} threads x {ops} ops", storm.as_str());
                let report = run_storm(&StormConfig {
                    storm,
                    threads,
                    ops_per_thread: ops,
                    seed,
                    nodes,
                    pages_per_node,
                    check_mode,
                })?;
                if !report.integrity_ok {
                    failed.push(storm.as_str());
                }
                eprintln!(
                    "  {} allocs, {} frees, peak live {}, {} ms",
                    report.allocations, report.frees, report.peak_live, report.elapsed_ms
                );
                reports.push(report);
            }
            let body = serde_json::to_string_pretty(&reports)?;
            if let Some(path) = output {
                std::fs::write(&path, body)?;
                eprintln!("Wrote storm report to {}", path.display());
            } else {
                println!("{body}");
            }
            if !failed.is_empty() {
                return Err(format!("integrity check failed for: {}", failed.join(", ")).into());
            }
        }
        Command::Slabinfo { size, count } => {
            let slqb = Slqb::new(
                SlqbConfig::from_env(),
                Arc::new(SimulatedPageSource::unbounded()),
            )?;
            let mut held = Vec::with_capacity(count);
            for _ in 0..count {
                match slqb.kmalloc(size, GfpFlags::NOWARN) {
                    Some(addr) => held.push(addr),
                    None => {
                        eprintln!("Allocation of {size} bytes failed after {} objects", held.len());
                        break;
                    }
                }
            }
            let rows: Vec<_> = slqb
                .slabinfo()
                .into_iter()
                .filter(|row| row.num_slabs > 0)
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            for addr in held {
                slqb.kfree(addr)?;
            }
        }
    }

    Ok(())
}

fn parse_seed(raw: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = raw.trim();
    let seed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let hex = hex.replace('_', "");
        u64::from_str_radix(&hex, 16)?
    } else {
        let dec = s.replace('_', "");
        dec.parse::<u64>()?
    };
    Ok(seed)
}

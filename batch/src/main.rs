mod child;
mod outcome;
mod queries;
mod resume;
mod run;
mod summary;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::run::{BatchOptions, default_rca_bin, run_batch, summary_line};

#[derive(Parser)]
#[command(name = "rca-batch", version, about = "Parallel batch driver for rca")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Diagnose every unfinished query of a query.csv.
    Run {
        #[arg(long)]
        queries: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        domain: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 12)]
        procs: usize,
        /// Wall-clock limit per problem, in seconds.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
        /// Path to the `rca` binary; defaults to the one next to this executable.
        #[arg(long)]
        rca_bin: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    rca::logging::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            queries,
            out,
            domain,
            config,
            procs,
            timeout,
            rca_bin,
        } => {
            let opts = BatchOptions {
                queries_path: queries,
                out_dir: out,
                domain_dir: domain,
                config_path: config,
                procs,
                timeout: Duration::from_secs(timeout),
                rca_bin: rca_bin.unwrap_or_else(default_rca_bin),
            };
            let summary = run_batch(&opts)?;
            println!("{}", summary_line(&summary, &opts.out_dir));
            Ok(())
        }
    }
}

//! Root-cause diagnosis CLI.
//!
//! `rca run` drives one diagnostic session and writes its artifacts;
//! `rca check-answer` validates a saved prediction against the answer
//! contract; `rca init-config` writes a default config file.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rca::exit_codes;
use rca::run::{RunOptions, check_answer_file, init_config, run_from_options};

#[derive(Parser)]
#[command(
    name = "rca",
    version,
    about = "Diagnostic control loop for root-cause analysis"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Diagnose one problem and write trajectory, prompt and prediction files.
    Run {
        /// Problem id; used for artifact file names.
        #[arg(long)]
        id: String,
        /// Issue to diagnose.
        #[arg(long)]
        objective: String,
        /// Directory with rules.md, schema.md and candidates.md.
        #[arg(long, default_value = "domains/microservice")]
        domain: PathBuf,
        #[arg(long, default_value = "rca.toml")]
        config: PathBuf,
        /// Output directory for artifacts.
        #[arg(long, default_value = "output")]
        out: PathBuf,
        /// Override `max_step` from config.
        #[arg(long)]
        max_step: Option<u32>,
        /// Override `temperature` from config.
        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Validate a saved prediction against the final-answer contract.
    CheckAnswer {
        #[arg(long, default_value = "domains/microservice")]
        domain: PathBuf,
        file: PathBuf,
    },
    /// Write a default `rca.toml`.
    InitConfig {
        #[arg(long, default_value = "rca.toml")]
        config: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    rca::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            id,
            objective,
            domain,
            config,
            out,
            max_step,
            temperature,
        } => {
            let report = run_from_options(&RunOptions {
                id,
                objective,
                domain_dir: domain,
                config_path: config,
                out_dir: out,
                max_step,
                temperature,
            })?;
            println!("{}", report.outcome.answer);
            Ok(report.exit_code())
        }
        Command::CheckAnswer { domain, file } => match check_answer_file(&domain, &file)? {
            Ok(answer) => {
                println!("valid: component={}", answer.component);
                for warning in answer.warnings() {
                    eprintln!("warning: {}", warning);
                }
                Ok(exit_codes::OK)
            }
            Err(err) => {
                eprintln!("invalid: {}", err);
                Ok(exit_codes::INVALID)
            }
        },
        Command::InitConfig { config, force } => {
            init_config(&config, force)?;
            println!("wrote {}", config.display());
            Ok(exit_codes::OK)
        }
    }
}

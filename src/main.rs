use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use finetuning_scheduler::{
    infer_schedule,
    model::param_names,
    schedule::{RawSchedule, Validator},
    NamedParams, ParamTree,
};

#[derive(Debug, Parser)]
#[command(name = "fts", about = "Generate and validate fine-tuning schedules")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Infer a schedule for a model and write it to `<log-dir>/<model>_ft_schedule.yaml`.
    Gen {
        /// JSON model description: {"name": "...", "parameters": [...]}.
        params: PathBuf,
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,
    },
    /// Validate a schedule against a model.
    Validate {
        schedule: PathBuf,
        params: PathBuf,
        /// Where a corrected schedule is written, defaults to the schedule's directory.
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Also require a max_transition_epoch on every phase but the last.
        #[arg(long)]
        epoch_transitions_only: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Cmd::Gen { params, log_dir } => {
            let model = load_model(&params)?;
            let schedule = infer_schedule(&model)?;
            let path = log_dir.join(format!("{}_ft_schedule.yaml", model.name()));
            schedule
                .to_document()
                .write(&path)
                .with_context(|| format!("writing {}", path.display()))?;

            info!("inferred {} phase(s)", schedule.len());
            println!("{}", path.display());
        }
        Cmd::Validate {
            schedule,
            params,
            log_dir,
            epoch_transitions_only,
        } => {
            let model = load_model(&params)?;
            let names = param_names(&model);
            let raw = RawSchedule::load(&schedule)?;
            let validator = Validator::new(&names);

            let validated = match validator.validate(&raw) {
                Ok(validated) => validated,
                Err(err) => {
                    if err.is_auto_correctable() {
                        if let Some(corrected) = validator.correct(&raw) {
                            let dir = log_dir
                                .or_else(|| schedule.parent().map(PathBuf::from))
                                .unwrap_or_else(|| PathBuf::from("."));
                            let path =
                                dir.join(format!("{}_ft_schedule_valid.yaml", model.name()));
                            corrected.write(&path)?;
                            eprintln!("a corrected schedule was written to {}", path.display());
                        }
                    }
                    return Err(err.into());
                }
            };

            if epoch_transitions_only {
                validated.require_ceilings()?;
            }

            let unscheduled = validated.unscheduled(&names);
            if !unscheduled.is_empty() {
                eprintln!("unscheduled (stay frozen): {}", unscheduled.join(", "));
            }
            println!("ok: {} phase(s)", validated.len());
        }
    }

    Ok(())
}

fn load_model(path: &Path) -> Result<NamedParams> {
    NamedParams::from_json_file(path)
        .with_context(|| format!("reading model description {}", path.display()))
}

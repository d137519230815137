//! Flowline - workflow runner

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowline_common::logging::{init_logging, LogConfig, LogLevel};
use flowline_common::types::{ExecutionStatus, WorkflowExecution};
use flowline_engine::{load_definition, parse_parameters, EngineConfig, WorkflowEngine};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flowline")]
#[command(author, version, about = "Flowline workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a workflow definition without running it
    Validate {
        /// Definition file (.json, .yaml or .yml)
        file: PathBuf,
    },

    /// Run a workflow definition to completion
    Run {
        /// Definition file (.json, .yaml or .yml)
        file: PathBuf,

        /// Execution parameter, repeatable
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Print the final execution as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().context("Invalid logging configuration")?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = init_logging(&log_config)?;

    let config = EngineConfig::load(cli.config.as_deref())?;
    let engine = WorkflowEngine::builder(config)
        .build()
        .await
        .context("Failed to start engine")?;

    match cli.command {
        Command::Validate { file } => {
            let definition = load_definition(&file)
                .await
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let plan = engine
                .validate(&definition)
                .with_context(|| format!("Workflow '{}' is invalid", definition.id))?;
            println!("Workflow '{}' is valid", definition.id);
            println!("Execution order: {}", plan.order().join(" -> "));
        },
        Command::Run { file, params, json } => {
            let definition = load_definition(&file)
                .await
                .with_context(|| format!("Failed to load {}", file.display()))?;
            let parameters = parse_parameters(params.iter().map(String::as_str))?;

            info!(workflow_id = %definition.id, "Running workflow");
            let execution = engine.execute_definition(&definition, parameters).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&execution)?);
            } else {
                print_summary(&execution);
            }
            if execution.status != ExecutionStatus::Completed {
                anyhow::bail!(
                    "Execution {} ended {}: {}",
                    execution.id,
                    execution.status,
                    execution.error.as_deref().unwrap_or("no error recorded")
                );
            }
        },
    }

    Ok(())
}

fn print_summary(execution: &WorkflowExecution) {
    println!("Execution {} {}", execution.id, execution.status);
    for result in execution.step_results.values() {
        let records = result.output.as_ref().map_or(0, |o| o.records_processed);
        print!(
            "  {:<24} {:<10} {:>8} records",
            result.step_id,
            format!("{:?}", result.status),
            records
        );
        if result.retry_count > 0 {
            print!(" ({} retries)", result.retry_count);
        }
        if let Some(error) = &result.error {
            print!(" - {}", error);
        }
        println!();
    }
}

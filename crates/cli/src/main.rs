use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use detflow_core::config::EngineConfig;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "detflow")]
#[command(about = "Deterministic workflow execution engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "detflow.toml", env = "DETFLOW_CONFIG")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a workflow declaration without running it
    Validate {
        /// Workflow declaration (JSON)
        file: PathBuf,
    },

    /// Run a workflow and print the run record
    Run {
        /// Workflow declaration (JSON)
        file: PathBuf,

        /// Trigger payload as a JSON object
        #[arg(long)]
        trigger: Option<String>,

        #[arg(long)]
        session_id: Option<String>,

        #[arg(long)]
        user_id: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "detflow=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = EngineConfig::load(&args.config)?;
    let executor = commands::build_executor(&config)?;

    match args.command {
        Command::Validate { file } => {
            let workflow = commands::load_workflow(&file)?;
            let report = executor.validate(&workflow)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.is_valid() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Run {
            file,
            trigger,
            session_id,
            user_id,
        } => {
            let workflow = commands::load_workflow(&file)?;
            let request = commands::run_request(trigger.as_deref(), session_id, user_id)?;
            let record = executor.execute(&workflow, request).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(if record.is_completed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vds::config::{VdsConfig, get_vds_dir};

mod cmd;

#[derive(Parser)]
#[command(name = "vds")]
#[command(version, about = "Session orchestrator for multi-step analyses with approval checkpoints")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Approve every checkpoint without prompting
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Path to a vds.toml. Defaults to .vds/vds.toml under the project dir.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the session API and live events
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides config)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a separately served frontend)
        #[arg(long)]
        dev: bool,

        /// Do not resume unfinished sessions on startup
        #[arg(long)]
        no_resume: bool,
    },
    /// Create a session and drive it to completion in the foreground
    Run {
        /// The business question to analyse
        question: String,

        #[arg(short, long)]
        domain: Option<String>,

        /// assist, semi_auto or autonomous
        #[arg(short, long)]
        autonomy: Option<String>,

        /// Data source id passed to every capability (repeatable)
        #[arg(long = "data-source")]
        data_sources: Vec<String>,
    },
    /// Approve or reject the checkpoint a session is waiting at
    Approve {
        id: String,

        #[arg(long)]
        reject: bool,

        #[arg(long)]
        note: Option<String>,
    },
    /// Show one session, or list sessions when no id is given
    Status {
        id: Option<String>,

        /// Filter the list by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Print a session's messages in order
    Messages { id: String },
    /// Show a session's audit events
    Audit {
        id: String,

        /// Write the full audit trail as JSON to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Run linear workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Create the session database and exit
    InitDb,
}

#[derive(Subcommand, Clone)]
pub enum WorkflowCommands {
    /// Execute a workflow definition (YAML or JSON)
    Run {
        file: PathBuf,

        /// Run inputs as a JSON object
        #[arg(long)]
        inputs: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default vds.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = VdsConfig::resolve(&project_dir, cli.config.as_deref())?;
    let _log_guard = vds::telemetry::init(
        &config.logging,
        &get_vds_dir(&project_dir).join("logs"),
        cli.verbose,
    )?;

    match &cli.command {
        Commands::Serve {
            port,
            db_path,
            dev,
            no_resume,
        } => {
            cmd::cmd_serve(&project_dir, config, *port, db_path.clone(), *dev, *no_resume).await?;
        }
        Commands::Run {
            question,
            domain,
            autonomy,
            data_sources,
        } => {
            cmd::cmd_run(
                &cli,
                &project_dir,
                &config,
                question,
                domain.clone(),
                autonomy.as_deref(),
                data_sources.clone(),
            )
            .await?;
        }
        Commands::Approve { id, reject, note } => {
            cmd::cmd_approve(&project_dir, &config, id, *reject, note.clone()).await?
        }
        Commands::Status { id, status } => {
            cmd::cmd_status(&project_dir, &config, id.as_deref(), status.as_deref()).await?
        }
        Commands::Messages { id } => cmd::cmd_messages(&project_dir, &config, id).await?,
        Commands::Audit { id, export } => {
            cmd::cmd_audit(&project_dir, &config, id, export.as_deref()).await?
        }
        Commands::Workflow { command } => match command {
            WorkflowCommands::Run { file, inputs } => {
                cmd::cmd_workflow_run(&project_dir, &config, file, inputs.as_deref()).await?
            }
        },
        Commands::Config { command } => {
            cmd::cmd_config(&project_dir, cli.config.as_deref(), &config, command.clone())?
        }
        Commands::InitDb => cmd::cmd_init_db(&project_dir, &config)?,
    }

    Ok(())
}

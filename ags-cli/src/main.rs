mod commands;
mod logging;
mod output;

use ags_common::{AppConfig, BackendKind, OutputFormat};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ags")]
#[command(about = "Run code in AGS/E2B sandboxes")]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.ags/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend (e2b, local)
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// Output format (text, json)
    #[arg(short, long, global = true)]
    pub output: Option<OutputFormat>,

    /// E2B API key
    #[arg(long, global = true)]
    pub e2b_api_key: Option<String>,

    /// E2B domain
    #[arg(long, global = true)]
    pub e2b_domain: Option<String>,

    /// E2B region
    #[arg(long, global = true)]
    pub e2b_region: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run code in a sandbox
    #[command(visible_alias = "r")]
    Run(RunArgs),

    /// Run a shell command in a sandbox
    #[command(visible_alias = "x")]
    Exec(ExecArgs),

    /// Manage sandbox instances
    #[command(subcommand)]
    Instance(InstanceCommands),

    /// Transfer and manage files inside a sandbox
    #[command(visible_aliases = ["f", "fs"])]
    File(FileArgs),
}

/// `KEY=VALUE` for `--env`
fn parse_env_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!(
            "invalid environment variable format: {} (expected KEY=VALUE)",
            raw
        )),
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Code to execute
    #[arg(short, long)]
    pub code: Option<String>,

    /// File(s) to execute (repeatable)
    #[arg(short, long = "file")]
    pub files: Vec<PathBuf>,

    /// Reuse an existing instance instead of creating one
    #[arg(short, long)]
    pub instance: Option<String>,

    /// Tool (template) to create the sandbox from
    #[arg(short, long, visible_alias = "tool-name")]
    pub tool: Option<String>,

    /// Language (python, javascript, typescript, r, java, bash)
    #[arg(short, long)]
    pub language: Option<String>,

    /// Keep created sandboxes running afterwards
    #[arg(long)]
    pub keep_alive: bool,

    /// Stream output as it is produced
    #[arg(short, long)]
    pub stream: bool,

    /// Show timing information
    #[arg(long)]
    pub time: bool,

    /// Run each source this many times
    #[arg(short = 'n', long, default_value_t = 1)]
    pub repeat: usize,

    /// Run each task in its own sandbox concurrently
    #[arg(short, long)]
    pub parallel: bool,

    /// Maximum concurrent tasks with --parallel (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_parallel: usize,

    /// Per-execution timeout in seconds (default: sandbox.timeout)
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Environment variable for the code (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    pub env: Vec<(String, String)>,
}

#[derive(Args, Debug, Clone)]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
pub struct ExecArgs {
    #[command(subcommand)]
    pub action: Option<ExecAction>,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Reuse an existing instance instead of creating one
    #[arg(short, long)]
    pub instance: Option<String>,

    /// Tool (template) to create the sandbox from
    #[arg(short, long, visible_alias = "tool-name")]
    pub tool: Option<String>,

    /// Keep the created sandbox running afterwards
    #[arg(long)]
    pub keep_alive: bool,

    /// Stream output as it is produced
    #[arg(short, long)]
    pub stream: bool,

    /// Show timing information
    #[arg(long)]
    pub time: bool,

    /// Working directory for the command
    #[arg(long)]
    pub cwd: Option<String>,

    /// Per-execution timeout in seconds (default: sandbox.timeout)
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Environment variable for the command (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
    pub env: Vec<(String, String)>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ExecAction {
    /// List processes running in a sandbox
    Ps(SandboxArgs),
}

/// How a single-sandbox command picks its sandbox
#[derive(Args, Debug, Clone, Default)]
pub struct SandboxArgs {
    /// Use an existing instance instead of a temporary one
    #[arg(short, long, global = true)]
    pub instance: Option<String>,

    /// Tool (template) for the temporary instance
    #[arg(short, long, visible_alias = "tool-name", global = true)]
    pub tool: Option<String>,

    /// Keep the temporary instance running afterwards
    #[arg(long, global = true)]
    pub keep_alive: bool,

    /// Show timing information
    #[arg(long, global = true)]
    pub time: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FileArgs {
    #[command(flatten)]
    pub sandbox: SandboxArgs,

    #[command(subcommand)]
    pub command: FileCommands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum FileCommands {
    /// List a directory
    #[command(visible_alias = "ls")]
    List {
        path: String,
        /// Directory depth (1 = direct children only)
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },
    /// Upload a local file
    #[command(visible_aliases = ["up", "put"])]
    Upload { local: PathBuf, remote: String },
    /// Download a file (local path defaults to the remote file name)
    #[command(visible_aliases = ["down", "get"])]
    Download {
        remote: String,
        local: Option<PathBuf>,
    },
    /// Remove files or directories
    #[command(visible_aliases = ["rm", "del"])]
    Remove {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Create a directory and its parents
    Mkdir { path: String },
    /// Show file details
    Stat { path: String },
    /// Print a file to stdout
    Cat { path: String },
}

#[derive(Subcommand)]
pub enum InstanceCommands {
    /// Create an instance and leave it running
    #[command(visible_alias = "start")]
    Create {
        /// Tool (template) to create the instance from
        #[arg(short, long, visible_alias = "tool-name")]
        tool: Option<String>,
    },
    /// List running instances
    #[command(visible_alias = "ls")]
    List,
    /// Show one instance
    Get {
        /// Instance ID
        id: String,
    },
    /// Delete instances
    #[command(visible_aliases = ["rm", "stop"])]
    Delete {
        /// Instance IDs
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

impl Cli {
    /// Layer command-line flags over the loaded configuration
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(key) = &self.e2b_api_key {
            config.e2b.api_key = Some(key.clone());
        }
        if let Some(domain) = &self.e2b_domain {
            config.e2b.domain = domain.clone();
        }
        if let Some(region) = &self.e2b_region {
            config.e2b.region = region.clone();
        }
        if let Some(file) = &self.log_file {
            config.log.file = Some(file.clone());
        }
        if self.verbose {
            config.log.level = "debug".to_string();
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply_overrides(&mut config);
    let _log_guard = logging::init(&config.log.level, config.log.file.as_deref());
    tracing::debug!(backend = %config.backend, output = %config.output, "Configuration loaded");

    match cli.command {
        Commands::Run(args) => commands::execute_run(&config, args).await,
        Commands::Exec(ExecArgs {
            action: Some(ExecAction::Ps(sandbox)),
            ..
        }) => commands::execute_exec_ps(&config, sandbox).await,
        Commands::Exec(args) => commands::execute_exec(&config, args).await,
        Commands::File(args) => commands::execute_file(&config, args).await,
        Commands::Instance(InstanceCommands::Create { tool }) => {
            commands::execute_instance_create(&config, tool).await
        }
        Commands::Instance(InstanceCommands::List) => {
            commands::execute_instance_list(&config).await
        }
        Commands::Instance(InstanceCommands::Get { id }) => {
            commands::execute_instance_get(&config, &id).await
        }
        Commands::Instance(InstanceCommands::Delete { ids }) => {
            commands::execute_instance_delete(&config, ids).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use clawfleet::{
    backup::BackupCoordinator,
    config,
    instance::orchestrator::{CreateInstance, Orchestrator},
    state::FleetState,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "clawfleet", about = "OpenClaw gateway fleet manager", version)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long, default_value = "clawfleet.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, control and inspect instances
    #[command(subcommand)]
    Instance(InstanceCommand),
    /// Fleet-wide snapshots
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Runtime reachability and fleet counts
    Status,
    /// Used ports and the next free port pairs
    Ports {
        /// How many upcoming pairs to show
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

#[derive(Subcommand)]
enum InstanceCommand {
    /// List all instances
    List,
    /// Show one instance with its live container state
    Get { id: String },
    /// Provision a new instance
    Create {
        id: String,
        /// Display name
        #[arg(long)]
        name: String,
        /// Gateway password written into the instance config
        #[arg(long)]
        password: String,
    },
    /// Remove an instance and its container
    Delete {
        id: String,
        /// Keep the instance directory on disk
        #[arg(long)]
        keep_data: bool,
    },
    /// Start the instance's container
    Start { id: String },
    /// Stop the instance's container
    Stop { id: String },
    /// Run the one-shot onboarding command
    Init { id: String },
    /// Follow the container log until Ctrl-C
    Logs { id: String },
    /// Print the raw openclaw.json
    Config { id: String },
    /// Replace openclaw.json with the contents of a file
    SetConfig {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the gateway token
    Token { id: String },
    /// Generate a new gateway token (takes effect after restart)
    RotateToken { id: String },
    /// List paired and pending devices
    Devices { id: String },
    /// Approve a pending device pairing request
    Approve { id: String, request_id: String },
}

#[derive(Subcommand)]
enum BackupCommand {
    /// List backups, newest first
    List,
    /// Snapshot the whole fleet
    Create,
    /// Restore the fleet from a backup
    Restore { id: i64 },
    /// Delete a backup archive and its record
    Delete { id: i64 },
}

// ── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging from RUST_LOG (default: info)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clawfleet=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let state = FleetState::open(cfg).context("failed to open fleet")?;
    let orchestrator = Orchestrator::new(state.clone());

    match cli.command {
        Commands::Instance(cmd) => instance(&orchestrator, cmd).await,
        Commands::Backup(cmd) => backup(&BackupCoordinator::new(state), cmd).await,
        Commands::Status => print_json(&orchestrator.fleet_status().await?),
        Commands::Ports { count } => print_json(&orchestrator.port_overview(count)?),
    }
}

// ── Instances ──────────────────────────────────────────────────────────────

async fn instance(orch: &Orchestrator, cmd: InstanceCommand) -> anyhow::Result<()> {
    match cmd {
        InstanceCommand::List => print_json(&orch.list()?),
        InstanceCommand::Get { id } => print_json(&orch.describe(&id).await?),
        InstanceCommand::Create { id, name, password } => {
            let created = orch
                .create(CreateInstance { id, name, password })
                .await?;
            print_json(&created)
        }
        InstanceCommand::Delete { id, keep_data } => {
            orch.delete(&id, keep_data).await?;
            info!("Instance {} deleted", id);
            Ok(())
        }
        InstanceCommand::Start { id } => print_json(&orch.start(&id).await?),
        InstanceCommand::Stop { id } => print_json(&orch.stop(&id).await?),
        InstanceCommand::Init { id } => {
            let output = orch.init(&id).await?;
            print!("{}", output);
            Ok(())
        }
        InstanceCommand::Logs { id } => follow_logs(orch, &id).await,
        InstanceCommand::Config { id } => {
            print!("{}", orch.read_config(&id).await?);
            Ok(())
        }
        InstanceCommand::SetConfig { id, file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            orch.write_config(&id, &text).await?;
            info!("Config for {} updated; restart the instance to apply it", id);
            Ok(())
        }
        InstanceCommand::Token { id } => {
            print_json(&serde_json::json!({ "token": orch.get_token(&id).await? }))
        }
        InstanceCommand::RotateToken { id } => print_json(&orch.regenerate_token(&id).await?),
        InstanceCommand::Devices { id } => print_json(&orch.list_devices(&id).await?),
        InstanceCommand::Approve { id, request_id } => {
            print_json(&orch.approve_device(&id, &request_id).await?)
        }
    }
}

/// Print log lines until the stream ends, Ctrl-C, or stdout goes away.
async fn follow_logs(orch: &Orchestrator, id: &str) -> anyhow::Result<()> {
    let mut stream = orch.logs(id).await?;
    let stdout = std::io::stdout();
    loop {
        tokio::select! {
            line = stream.next_line() => {
                let Some(line) = line else { break };
                let mut out = stdout.lock();
                if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping log follower");
                break;
            }
        }
    }
    Ok(())
}

// ── Backups ────────────────────────────────────────────────────────────────

async fn backup(coord: &BackupCoordinator, cmd: BackupCommand) -> anyhow::Result<()> {
    match cmd {
        BackupCommand::List => print_json(&coord.list_backups()?),
        BackupCommand::Create => print_json(&coord.snapshot().await?),
        BackupCommand::Restore { id } => {
            let report = coord.restore(id).await?;
            if !report.failed.is_empty() {
                tracing::warn!("{} instances failed to restart", report.failed.len());
            }
            print_json(&report)
        }
        BackupCommand::Delete { id } => {
            coord.delete_backup(id).await?;
            info!("Backup {} deleted", id);
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

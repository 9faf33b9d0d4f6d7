//! Metamorph CLI
//!
//! The command surface over the self-modification core: initialize the
//! store, create checkpoints, roll back, and apply change sets. Every
//! failure exits with the stable code of its taxonomy kind.

use std::fs;
use std::io::Read;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use colored::Colorize;
use dialoguer::Confirm;

use metamorph::changeset::{to_bundle, validate_change_set};
use metamorph::config::{get_config_path, load_config, resolve_path, save_config};
use metamorph::cycle::{ApprovalBroker, DEFAULT_HISTORY_CAPACITY};
use metamorph::dispatch::DispatchEngine;
use metamorph::error::{CoreError, CoreResult};
use metamorph::sandbox::SandboxRunner;
use metamorph::store::ArtifactStore;
use metamorph::types::{default_config, ChangeOp, CoreConfig, LogLevel, ToolInvocation};

const VERSION: &str = "0.1.0";

/// Metamorph -- Transactional Self-Modification Core
#[derive(Parser, Debug)]
#[command(
    name = "metamorph",
    version = VERSION,
    about = "Transactional self-modification core for autonomous agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default configuration and create the artifact store
    Init,

    /// Show the store contents, checkpoints, and configuration
    Status,

    /// Create a named checkpoint of the current artifact versions
    Checkpoint {
        /// Human-readable checkpoint label
        label: String,
    },

    /// Restore every artifact to the versions pinned by a checkpoint
    Rollback {
        /// Id of the checkpoint to restore
        checkpoint_id: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Validate and apply a change-set JSON file
    Apply {
        /// Path to the change-set file ("-" reads stdin)
        changeset: String,

        /// Apply without the interactive approval prompt
        #[arg(long)]
        yes: bool,
    },
}

// ---- Commands ---------------------------------------------------------------

fn cmd_init() -> CoreResult<()> {
    let config = match load_config() {
        Some(config) => config,
        None => {
            let config = default_config();
            save_config(&config)
                .map_err(|e| CoreError::ExecutionFailed(format!("write config: {e}")))?;
            config
        }
    };

    let store = ArtifactStore::open(&resolve_path(&config.db_path))?;
    println!(
        "{}",
        serde_json::json!({
            "configPath": get_config_path().to_string_lossy(),
            "dbPath": resolve_path(&config.db_path),
            "artifacts": store.list_paths()?.len(),
        })
    );
    Ok(())
}

fn cmd_status() -> CoreResult<()> {
    let Some(config) = load_config() else {
        println!("Metamorph is not configured. Run: metamorph init");
        return Ok(());
    };

    let store = ArtifactStore::open(&resolve_path(&config.db_path))?;
    let paths = store.list_paths()?;
    let checkpoints = store.list_checkpoints()?;
    let versions = store.history_depth()?;

    println!();
    println!("{}", "=== METAMORPH STATUS ===".cyan());
    println!("DB Path:     {}", resolve_path(&config.db_path));
    println!("Artifacts:   {}", paths.len());
    println!("Versions:    {versions}");
    println!("Checkpoints: {}", checkpoints.len());
    println!("Autonomous context: {}", config.autonomous_context);
    println!("Sandbox timeout:    {}ms", config.sandbox_timeout_ms);
    println!("Version:     {}", config.version);

    if !checkpoints.is_empty() {
        println!();
        println!("Recent checkpoints:");
        for checkpoint in checkpoints.iter().rev().take(5) {
            println!(
                "  {}  {}  {}",
                checkpoint.created_at.dimmed(),
                checkpoint.id.dimmed(),
                format!("{} ({} artifacts)", checkpoint.label, checkpoint.snapshot.len()),
            );
        }
    }
    println!("{}", "========================".cyan());
    println!();
    Ok(())
}

fn cmd_checkpoint(label: &str) -> CoreResult<()> {
    let config = require_config()?;
    let mut store = ArtifactStore::open(&resolve_path(&config.db_path))?;
    let checkpoint = store.create_checkpoint(label)?;
    println!(
        "{}",
        format!(
            "Checkpoint {} created ({} artifacts pinned)",
            checkpoint.id,
            checkpoint.snapshot.len()
        )
        .green()
    );
    Ok(())
}

fn cmd_rollback(checkpoint_id: &str, yes: bool) -> CoreResult<()> {
    let config = require_config()?;
    let mut store = ArtifactStore::open(&resolve_path(&config.db_path))?;
    let checkpoint = store.get_checkpoint(checkpoint_id)?;

    if !yes {
        let proceed = Confirm::new()
            .with_prompt(format!(
                "Roll back to {:?} ({} artifacts pinned)?",
                checkpoint.label,
                checkpoint.snapshot.len()
            ))
            .default(false)
            .interact()
            .map_err(|e| CoreError::ExecutionFailed(format!("prompt failed: {e}")))?;
        if !proceed {
            return Err(CoreError::Rejected("rollback declined".to_string()));
        }
    }

    let applied = store.rollback(checkpoint_id)?;
    println!(
        "{}",
        format!("Rolled back to {checkpoint_id}: {applied} path(s) touched").green()
    );
    Ok(())
}

async fn cmd_apply(changeset: &str, yes: bool) -> CoreResult<()> {
    let config = require_config()?;

    let raw = if changeset == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| CoreError::ExecutionFailed(format!("read stdin: {e}")))?;
        buf
    } else {
        fs::read_to_string(changeset)
            .map_err(|e| CoreError::NotFound(format!("change set {changeset}: {e}")))?
    };

    // The schema gate runs before anything is shown or touched.
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let set = validate_change_set(&value)?;

    println!("{}", format!("{} change(s) proposed:", set.changes.len()).cyan());
    for record in to_bundle(&set) {
        let op = match record.operation {
            ChangeOp::Create => "CREATE".green(),
            ChangeOp::Modify => "MODIFY".yellow(),
            ChangeOp::Delete => "DELETE".red(),
        };
        println!("  {} {}  {}", op, record.path, record.reason.dimmed());
    }

    if !yes {
        let proceed = Confirm::new()
            .with_prompt("Apply this change set?")
            .default(false)
            .interact()
            .map_err(|e| CoreError::ExecutionFailed(format!("prompt failed: {e}")))?;
        if !proceed {
            return Err(CoreError::Rejected("change set declined".to_string()));
        }
    }

    let store = Arc::new(Mutex::new(ArtifactStore::open(&resolve_path(
        &config.db_path,
    ))?));
    let sandbox = Arc::new(SandboxRunner::new(config.sandbox_timeout_ms));
    // The CLI operator already approved above; nothing in this path
    // raises a broker request, so the notification end stays idle.
    let (broker, _notifications) = ApprovalBroker::new(DEFAULT_HISTORY_CAPACITY);
    let engine = DispatchEngine::new(
        Arc::clone(&store),
        sandbox,
        broker,
        config.approval_timeout_ms,
    );

    // One checkpoint spanning the whole set, for manual rollback later.
    let set_checkpoint = {
        let mut store = store.lock().expect("artifact store lock");
        store.create_checkpoint("cli:apply")?
    };

    let total = set.changes.len();
    let mut applied: usize = 0;
    for change in &set.changes {
        let args = serde_json::to_value(change)?;
        let result = engine
            .dispatch(ToolInvocation::new("apply_change", args))
            .await;

        if result.success {
            applied += 1;
            continue;
        }

        let error = result.error.ok_or_else(|| {
            CoreError::ExecutionFailed("dispatch failed without detail".to_string())
        })?;
        eprintln!(
            "{}",
            format!(
                "{} failed after {applied} of {total} change(s): {}",
                change.path, error.message
            )
            .red()
        );
        if let Some(ref cp) = error.checkpoint_id {
            eprintln!("  change rolled back via checkpoint {cp}");
        }
        if applied > 0 {
            eprintln!(
                "  {applied} earlier change(s) remain applied; undo with: metamorph rollback {}",
                set_checkpoint.id
            );
        }
        std::process::exit(error.kind.exit_code());
    }

    println!(
        "{}",
        format!(
            "Applied {applied} change(s); checkpoint {} covers the pre-apply state",
            set_checkpoint.id
        )
        .green()
    );
    Ok(())
}

// ---- Helpers ----------------------------------------------------------------

fn require_config() -> CoreResult<CoreConfig> {
    load_config()
        .ok_or_else(|| CoreError::NotFound("configuration (run: metamorph init)".to_string()))
}

fn init_tracing(level: &LogLevel) {
    let level = match level {
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

// ---- Entry Point ------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = load_config()
        .map(|c| c.log_level)
        .unwrap_or(LogLevel::Info);
    init_tracing(&log_level);

    let result = match cli.command {
        Commands::Init => cmd_init(),
        Commands::Status => cmd_status(),
        Commands::Checkpoint { label } => cmd_checkpoint(&label),
        Commands::Rollback { checkpoint_id, yes } => cmd_rollback(&checkpoint_id, yes),
        Commands::Apply { changeset, yes } => cmd_apply(&changeset, yes).await,
    };

    if let Err(err) = result {
        eprintln!("{}", format!("Error ({}): {err}", err.kind()).red());
        std::process::exit(err.exit_code());
    }
}

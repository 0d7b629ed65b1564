//! PlotWeaver CLI - lock coordination for collaborative story projects

use std::ops::ControlFlow;

use clap::{Parser, Subcommand, ValueEnum};
use plotweaver_core::api::LockApi;
use plotweaver_core::channel::{ReconnectPolicy, ReconnectingChannel, SseConnector};
use plotweaver_core::config::Config;
use plotweaver_core::domain::locking::{
    BulkLockOperation, BulkOperationKind, ConflictCheck, ConflictDetector, ConflictResolution, ConflictResolver,
    LockConflict, LockLevel, LockOperation, LockSession, LockType, StoreChange, Submission,
};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "plotweaver")]
#[command(author, version, about = "Lock coordination for collaborative story projects", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// How to settle conflicts without prompting
#[derive(Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OnConflict {
    /// Leave conflicting components out of the operation
    Skip,
    /// Clear the existing locks, then apply the operation
    Unlock,
    /// Stop and report the conflicts
    #[default]
    Abort,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and change component locks
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },

    /// Inspect conflicts recorded by the backend
    Conflicts {
        #[command(subcommand)]
        action: ConflictAction,
    },

    /// Follow the push channel for a project or job
    Watch {
        /// Project whose lock updates to follow
        key: String,
        /// Stop after this many lock changes
        #[arg(long)]
        max_events: Option<usize>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum LockAction {
    /// List current locks
    List { project: String },
    /// Lock one component
    Lock {
        project: String,
        component: String,
        #[arg(short, long, default_value = "soft", value_parser = parse_level)]
        level: LockLevel,
        #[arg(short = 't', long = "type", default_value = "personal", value_parser = parse_lock_type)]
        lock_type: LockType,
        #[arg(short, long)]
        reason: String,
        #[arg(long, value_enum, default_value = "abort")]
        on_conflict: OnConflict,
    },
    /// Unlock components
    Unlock {
        project: String,
        #[arg(required = true)]
        components: Vec<String>,
        #[arg(short, long)]
        reason: String,
        #[arg(long, value_enum, default_value = "abort")]
        on_conflict: OnConflict,
    },
    /// Change the level of existing locks
    Level {
        project: String,
        #[arg(value_parser = parse_level)]
        level: LockLevel,
        #[arg(required = true)]
        components: Vec<String>,
        #[arg(short, long)]
        reason: String,
        #[arg(long, value_enum, default_value = "abort")]
        on_conflict: OnConflict,
    },
    /// Pre-check an operation for conflicts without applying it
    Check {
        project: String,
        #[arg(long, value_enum)]
        action: CheckKind,
        #[arg(required = true)]
        components: Vec<String>,
        #[arg(short, long, value_parser = parse_level)]
        level: Option<LockLevel>,
        #[arg(short, long, default_value = "pre-check")]
        reason: String,
    },
    /// Show the lock audit trail
    Audit { project: String },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CheckKind {
    Lock,
    Unlock,
    ChangeLevel,
}

impl From<CheckKind> for BulkOperationKind {
    fn from(kind: CheckKind) -> Self {
        match kind {
            CheckKind::Lock => Self::Lock,
            CheckKind::Unlock => Self::Unlock,
            CheckKind::ChangeLevel => Self::ChangeLevel,
        }
    }
}

#[derive(Subcommand)]
enum ConflictAction {
    /// List conflicts recorded for a project
    List { project: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

fn parse_level(value: &str) -> Result<LockLevel, String> {
    value.parse().map_err(|e: plotweaver_core::Error| e.to_string())
}

fn parse_lock_type(value: &str) -> Result<LockType, String> {
    value.parse().map_err(|e: plotweaver_core::Error| e.to_string())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "plotweaver=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        report_error(&e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Locks { action } => cmd_locks(action, cli.format, cli.quiet).await,
        Commands::Conflicts { action } => cmd_conflicts(action, cli.format).await,
        Commands::Watch { key, max_events } => cmd_watch(&key, max_events, cli.format, cli.quiet).await,
        Commands::Config { action } => cmd_config(action, cli.format, cli.quiet),
        Commands::Doctor => cmd_doctor(cli.quiet).await,
    }
}

/// Print an error with its code and suggestion when it comes from the core library
fn report_error(error: &anyhow::Error) {
    match error.downcast_ref::<plotweaver_core::Error>() {
        Some(core) => {
            eprintln!("Error [{}]: {}", core.code(), core);
            if let Some(suggestion) = core.suggestion() {
                eprintln!("  Suggestion: {}", suggestion);
            }
        }
        None => eprintln!("Error: {:#}", error),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn session_for(project: &str) -> anyhow::Result<LockSession> {
    let config = Config::load()?;
    Ok(LockSession::from_config(&config, project)?)
}

async fn cmd_locks(action: LockAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        LockAction::List { project } => {
            let session = session_for(&project)?;
            session.refresh().await?;
            let store = session.snapshot().await;
            let locks = store.sorted_locks();

            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&locks)?);
            } else if locks.is_empty() {
                if !quiet {
                    println!("No locks in project '{}'.", project);
                }
            } else {
                println!("{:<24} {:<8} {:<14} {:<16} REASON", "COMPONENT", "LEVEL", "TYPE", "LOCKED BY");
                for lock in locks {
                    println!(
                        "{:<24} {:<8} {:<14} {:<16} {}",
                        lock.component_id,
                        lock.level.as_str(),
                        lock.lock_type.as_str(),
                        lock.locked_by,
                        lock.reason
                    );
                }
            }
        }

        LockAction::Lock {
            project,
            component,
            level,
            lock_type,
            reason,
            on_conflict,
        } => {
            let session = session_for(&project)?;
            let submission = session
                .lock_component(&component, level, lock_type, &reason)
                .await?;
            finish_submission(&session, submission, on_conflict, format, quiet).await?;
        }

        LockAction::Unlock {
            project,
            components,
            reason,
            on_conflict,
        } => {
            let session = session_for(&project)?;
            let submission = session.unlock(components, &reason).await?;
            finish_submission(&session, submission, on_conflict, format, quiet).await?;
        }

        LockAction::Level {
            project,
            level,
            components,
            reason,
            on_conflict,
        } => {
            let session = session_for(&project)?;
            let submission = session.change_level(components, level, &reason).await?;
            finish_submission(&session, submission, on_conflict, format, quiet).await?;
        }

        LockAction::Check {
            project,
            action,
            components,
            level,
            reason,
        } => {
            let kind = BulkOperationKind::from(action);
            let op = BulkLockOperation::new(kind, components, level, reason);
            op.validate()?;

            let config = Config::load()?;
            let detector = ConflictDetector::new(LockApi::from_config(&config)?);
            let check = detector.check(&project, &LockOperation::from(op)).await?;
            print_check(&check, format);
        }

        LockAction::Audit { project } => {
            let session = session_for(&project)?;
            let entries = session.audit_trail().await;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                if !quiet {
                    println!("No audit entries for project '{}'.", project);
                }
            } else {
                for entry in entries {
                    println!(
                        "{}  {:<14} {:<24} {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.action,
                        entry.component_id.as_deref().unwrap_or("-"),
                        entry.user.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}

/// Settle conflicts per `--on-conflict` and report the result
async fn finish_submission(
    session: &LockSession,
    submission: Submission,
    on_conflict: OnConflict,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let mut resolver = match submission {
        Submission::Applied { component_ids } => {
            if format == OutputFormat::Json {
                println!("{}", json!({ "status": "applied", "components": component_ids }));
            } else if !quiet {
                println!("Applied to {} component(s).", component_ids.len());
            }
            return Ok(());
        }
        Submission::NeedsResolution(resolver) => resolver,
    };

    if !quiet || format == OutputFormat::Json {
        print_conflicts(resolver.conflicts(), format);
    }

    let resolution = match on_conflict {
        OnConflict::Skip => ConflictResolution::skip(),
        OnConflict::Unlock => ConflictResolution::unlock(),
        OnConflict::Abort => {
            let unresolved = resolver.unresolved_count();
            session.cancel_resolution(&mut resolver).await;
            return Err(plotweaver_core::Error::UnresolvedConflicts { unresolved }.into());
        }
    };
    resolve_and_apply(session, &mut resolver, resolution, format, quiet).await
}

async fn resolve_and_apply(
    session: &LockSession,
    resolver: &mut ConflictResolver,
    resolution: ConflictResolution,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    resolver.resolve_all(resolution)?;
    let outcome = session.apply_resolution(resolver).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else if !quiet {
        let skipped = outcome.skipped();
        if skipped.is_empty() {
            println!("Conflicts resolved; operation applied.");
        } else {
            println!(
                "Conflicts resolved; skipped {}.",
                skipped.into_iter().collect::<Vec<_>>().join(", ")
            );
        }
    }
    Ok(())
}

fn print_conflicts(conflicts: &[LockConflict], format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", json!({ "status": "conflicts", "conflicts": conflicts }));
        return;
    }
    println!("{} conflict(s):", conflicts.len());
    for conflict in conflicts {
        println!(
            "  [{:?}] {} - {}",
            conflict.priority, conflict.component_id, conflict.description
        );
    }
}

fn print_check(check: &ConflictCheck, format: OutputFormat) {
    if format == OutputFormat::Json {
        println!(
            "{}",
            json!({
                "hasConflicts": check.has_conflicts,
                "canProceed": check.can_proceed,
                "degraded": check.degraded,
                "conflicts": check.conflicts,
            })
        );
        return;
    }
    if check.degraded {
        println!("[!!] Conflict check unavailable; result assumes no conflicts.");
    }
    if check.conflicts.is_empty() {
        println!("No conflicts. Operation can proceed.");
    } else {
        print_conflicts(&check.conflicts, format);
        println!("Can proceed: {}", if check.can_proceed { "yes" } else { "no" });
    }
}

async fn cmd_conflicts(action: ConflictAction, format: OutputFormat) -> anyhow::Result<()> {
    match action {
        ConflictAction::List { project } => {
            let session = session_for(&project)?;
            let conflicts = session.server_conflicts().await;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&conflicts)?);
            } else if conflicts.is_empty() {
                println!("No conflicts in project '{}'.", project);
            } else {
                print_conflicts(&conflicts, format);
            }
        }
    }
    Ok(())
}

async fn cmd_watch(
    key: &str,
    max_events: Option<usize>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let session = LockSession::from_config(&config, key)?;
    let connector = SseConnector::from_config(&config.api)?;
    let channel = ReconnectingChannel::new(connector, ReconnectPolicy::from_config(&config.channel));

    match session.refresh().await {
        Ok(count) if !quiet => info!(project_id = %key, count, "Loaded current locks"),
        Ok(_) => {}
        Err(e) => warn!(project_id = %key, error = %e, "Initial lock fetch failed, following pushes only"),
    }

    let mut subscription = channel.subscribe(key);
    let mut received = 0usize;
    if !quiet {
        info!(project_id = %key, "Watching lock updates (Ctrl-C to stop)");
    }

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => Ok(()),
        result = session.follow(&mut subscription, |change| {
            received += 1;
            print_change(key, change, format);
            if max_events.is_some_and(|max| received >= max) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }) => result,
    };

    channel.disconnect_all();
    Ok(result?)
}

fn print_change(project_id: &str, change: &StoreChange, format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", json!({"project": project_id, "update": change}));
        return;
    }

    let text = match change {
        StoreChange::Upserted { component_id } => format!("lock set on {}", component_id),
        StoreChange::Removed { component_id } => format!("lock cleared on {}", component_id),
        StoreChange::Replaced { count } => format!("state replaced ({} locks)", count),
        StoreChange::ConflictsChanged => "conflicts changed".to_string(),
        StoreChange::NeedsRefresh { component_ids } => {
            format!("bulk change on {}", component_ids.join(", "))
        }
        StoreChange::Unchanged => "no change".to_string(),
    };
    println!("[{}] {}", project_id, text);
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            if format == OutputFormat::Json {
                let map: serde_json::Map<String, serde_json::Value> = items
                    .into_iter()
                    .map(|(key, value)| (key, serde_json::Value::String(value)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (key, value) in items {
                    println!("{} = {}", key, value);
                }
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_doctor(quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("PlotWeaver Health Check");
        println!("=======================");
        println!();
    }

    let mut all_ok = true;

    let config = match Config::load() {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
            }
            Some(config)
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
            None
        }
    };

    if !quiet {
        match Config::config_path() {
            Ok(path) if path.exists() => println!("[OK] Config file: {}", path.display()),
            Ok(path) => println!("[--] Config file: {} (using defaults)", path.display()),
            Err(e) => println!("[!!] Config file: Error - {}", e),
        }
    }

    if let Some(config) = config {
        match config.api.redacted_api_token() {
            Ok(Some(redacted)) => {
                if !quiet {
                    println!("[OK] API token: Configured ({})", redacted);
                }
            }
            Ok(None) => {
                if !quiet {
                    println!("[--] API token: Not set (PLOTWEAVER_API_TOKEN)");
                }
            }
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] API token: Error - {}", e);
                }
            }
        }

        let base_url = config.api.resolved_base_url();
        let health = match LockApi::from_config(&config) {
            Ok(api) => api.health().await,
            Err(e) => Err(e),
        };
        match health {
            Ok(health) => {
                if !quiet {
                    println!("[OK] Backend: {} ({})", health.status, base_url);
                    println!(
                        "     Locks: {}  Conflicts: {}",
                        health.total_locks, health.total_conflicts
                    );
                }
            }
            Err(e) => {
                all_ok = false;
                if !quiet {
                    println!("[!!] Backend: Unreachable at {} - {}", base_url, e);
                }
            }
        }
    }

    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }

    Ok(())
}

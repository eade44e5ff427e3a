//! Command surface for the achievements engine.
//!
//! Hosts embed the engine through [`run_cli`] for parsed CLI execution or
//! [`run_with_db`] for a single command against a database path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use achievements_core::{
    Achievement, AchievementId, AchievementKind, EngineConfig, EventPayload, HostEvent,
    ProgressFilter, ProgressKey, ProgressSignal, ProgressStatus, ProgressStore, UserId,
};
use achievements_engine::{
    EventBus, ExtensionRegistry, HeartbeatRequest, InProcessBus, NotificationChannel, SignalSink,
    Transition, UnlockEvaluator,
};
use achievements_store_sqlite::SqliteAchievementStore;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ach")]
#[command(about = "Achievements engine CLI")]
pub struct Cli {
    #[arg(long, env = "ACHIEVEMENTS_DB", default_value = "./achievements.sqlite3")]
    db: PathBuf,

    /// Log filter directive, e.g. `info` or `achievements_engine=debug`.
    #[arg(long, env = "ACHIEVEMENTS_LOG", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Achievement {
        #[command(subcommand)]
        command: Box<AchievementCommand>,
    },
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Progress {
        #[command(subcommand)]
        command: Box<ProgressCommand>,
    },
    Admin {
        #[command(subcommand)]
        command: Box<AdminCommand>,
    },
    Heartbeat {
        #[command(subcommand)]
        command: Box<HeartbeatCommand>,
    },
    Extensions {
        #[command(subcommand)]
        command: Box<ExtensionsCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    Points {
        #[command(subcommand)]
        command: Box<PointsCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AchievementCommand {
    Add(AchievementAddArgs),
    List,
}

#[derive(Debug, Args)]
pub struct AchievementAddArgs {
    #[arg(long)]
    id: AchievementId,
    #[arg(long)]
    title: String,
    #[arg(long)]
    image_url: Option<String>,
    #[arg(long, default_value_t = 0)]
    points: i64,
    #[arg(long, value_enum, default_value_t = KindArg::Event)]
    kind: KindArg,
    /// Event name that advances this achievement; repeatable.
    #[arg(long = "trigger")]
    triggers: Vec<String>,
    #[arg(long, default_value_t = 1)]
    target: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Event,
    Award,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    /// Emit a host event through the enabled extensions.
    Raise(EventRaiseArgs),
}

#[derive(Debug, Args)]
pub struct EventRaiseArgs {
    #[arg(long)]
    name: String,
    /// Tagged payload, e.g. `{"family":"user_action","user_id":1}`.
    #[arg(long)]
    payload_json: String,
}

#[derive(Debug, Subcommand)]
pub enum ProgressCommand {
    Show(PairArgs),
    List(ProgressListArgs),
}

#[derive(Debug, Args)]
pub struct PairArgs {
    #[arg(long)]
    user: UserId,
    #[arg(long)]
    achievement: AchievementId,
}

#[derive(Debug, Args)]
pub struct ProgressListArgs {
    #[arg(long)]
    user: Option<UserId>,
    #[arg(long, value_enum)]
    status: Option<StatusArg>,
    #[arg(long = "achievement")]
    achievements: Vec<AchievementId>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Locked,
    Unlocked,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    ForceUnlock(PairArgs),
    Revoke(PairArgs),
}

#[derive(Debug, Subcommand)]
pub enum HeartbeatCommand {
    Poll(HeartbeatPollArgs),
}

#[derive(Debug, Args)]
pub struct HeartbeatPollArgs {
    #[arg(long)]
    user: UserId,
    #[arg(long, default_value = r#"{"achievements":{"type":"notifications"}}"#)]
    request_json: String,
}

#[derive(Debug, Subcommand)]
pub enum ExtensionsCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    #[arg(long)]
    config_json: String,
}

#[derive(Debug, Subcommand)]
pub enum PointsCommand {
    Show(PointsShowArgs),
}

#[derive(Debug, Args)]
pub struct PointsShowArgs {
    #[arg(long)]
    user: UserId,
}

/// Installs the stderr log subscriber. Later calls are no-ops.
pub fn init_tracing(level: Option<&str>) {
    let filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Executes a parsed CLI invocation.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes one command against the `SQLite` database at `db_path`.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or the
/// requested command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let store = Arc::new(SqliteAchievementStore::open(db_path)?);
    store.migrate()?;
    debug!(db = %db_path.display(), "store ready");
    let output = run_command(command, &store)?;
    print_json(&output)
}

fn run_command(command: Command, store: &Arc<SqliteAchievementStore>) -> Result<Value> {
    match command {
        Command::Achievement { command } => match *command {
            AchievementCommand::Add(args) => {
                let achievement = Achievement {
                    id: args.id,
                    title: args.title,
                    image_url: args.image_url,
                    points: args.points,
                    kind: match args.kind {
                        KindArg::Event => AchievementKind::Event,
                        KindArg::Award => AchievementKind::Award,
                    },
                    trigger_keys: args.triggers,
                    target: args.target,
                };
                store.upsert_achievement(&achievement)?;
                to_value(&achievement)
            }
            AchievementCommand::List => to_value(&store.list_achievements()?),
        },
        Command::Event { command } => match *command {
            EventCommand::Raise(args) => raise_event(store, args),
        },
        Command::Progress { command } => match *command {
            ProgressCommand::Show(args) => {
                to_value(&store.get(ProgressKey::new(args.user, args.achievement))?)
            }
            ProgressCommand::List(args) => {
                let filter = ProgressFilter {
                    user_id: args.user,
                    status: args.status.map(|status| match status {
                        StatusArg::Locked => ProgressStatus::Locked,
                        StatusArg::Unlocked => ProgressStatus::Unlocked,
                    }),
                    achievement_ids: args.achievements,
                };
                to_value(&evaluator(store)?.list_progress(&filter)?)
            }
        },
        Command::Admin { command } => match *command {
            AdminCommand::ForceUnlock(args) => {
                let transition = evaluator(store)?.force_unlock(args.user, args.achievement)?;
                Ok(json!({
                    "user_id": args.user,
                    "achievement_id": args.achievement,
                    "result": transition,
                }))
            }
            AdminCommand::Revoke(args) => {
                let revoked = evaluator(store)?.revoke(args.user, args.achievement)?;
                Ok(json!({
                    "user_id": args.user,
                    "achievement_id": args.achievement,
                    "revoked": revoked,
                }))
            }
        },
        Command::Heartbeat { command } => match *command {
            HeartbeatCommand::Poll(args) => {
                let request: HeartbeatRequest = serde_json::from_str(&args.request_json)
                    .context("--request-json must be a heartbeat request object")?;
                let channel = NotificationChannel::new(store.clone(), store.clone());
                to_value(&channel.handle_heartbeat(args.user, &request)?)
            }
        },
        Command::Extensions { command } => match *command {
            ExtensionsCommand::List => {
                let registry = ExtensionRegistry::from_config(
                    &store.get_config()?,
                    Arc::new(InProcessBus::new()),
                    Arc::new(evaluator(store)?),
                )?;
                to_value(&registry.descriptors().collect::<Vec<_>>())
            }
        },
        Command::Config { command } => match *command {
            ConfigCommand::Show => to_value(&store.get_config()?),
            ConfigCommand::Set(args) => {
                let raw: Value = serde_json::from_str(&args.config_json)
                    .context("--config-json must be valid JSON")?;
                let config = EngineConfig::from_json(&raw)?;
                store.set_config(&config)?;
                info!(config_version = config.config_version, "engine config updated");
                to_value(&config)
            }
        },
        Command::Points { command } => match *command {
            PointsCommand::Show(args) => Ok(json!({
                "user_id": args.user,
                "points": store.user_points(args.user)?,
            })),
        },
    }
}

fn evaluator(store: &Arc<SqliteAchievementStore>) -> Result<UnlockEvaluator> {
    let config = store.get_config()?;
    Ok(
        UnlockEvaluator::new(store.clone(), store.clone(), store.clone())
            .with_ledger(store.clone())
            .with_config(&config),
    )
}

#[derive(Debug, Serialize)]
struct SignalReport {
    user_id: UserId,
    trigger_key: String,
    achievement_id: AchievementId,
    result: Transition,
}

/// Forwards signals to the evaluator and keeps what each one did.
struct ReportingSink {
    evaluator: UnlockEvaluator,
    reports: Mutex<Vec<SignalReport>>,
}

impl ReportingSink {
    fn new(evaluator: UnlockEvaluator) -> Self {
        Self {
            evaluator,
            reports: Mutex::new(Vec::new()),
        }
    }

    fn lock_reports(&self) -> MutexGuard<'_, Vec<SignalReport>> {
        // Reports are append-only, so a poisoned lock still holds usable data.
        self.reports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_reports(&self) -> Vec<SignalReport> {
        std::mem::take(&mut *self.lock_reports())
    }
}

impl SignalSink for ReportingSink {
    fn signal(&self, signal: ProgressSignal) {
        let outcomes = self.evaluator.handle_signal(&signal);
        self.lock_reports().extend(
            outcomes
                .into_iter()
                .map(|(achievement_id, result)| SignalReport {
                    user_id: signal.user_id,
                    trigger_key: signal.trigger_key.clone(),
                    achievement_id,
                    result,
                }),
        );
    }
}

fn raise_event(store: &Arc<SqliteAchievementStore>, args: EventRaiseArgs) -> Result<Value> {
    let payload: EventPayload = serde_json::from_str(&args.payload_json)
        .context("--payload-json must be a tagged event payload")?;
    let config = store.get_config()?;

    let sink = Arc::new(ReportingSink::new(evaluator(store)?));
    let bus = Arc::new(InProcessBus::new());
    let _registry = ExtensionRegistry::from_config(&config, bus.clone(), sink.clone())?;

    let handlers = bus.emit(&HostEvent::new(args.name.clone(), payload));
    let reports = sink.take_reports();

    Ok(json!({
        "event": args.name,
        "handlers": handlers,
        "signals": to_value(&reports)?,
    }))
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to serialize command output")
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render command output")?
    );
    Ok(())
}

//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use usage_beacon::core::config::Config;
use usage_beacon::core::errors::BeaconError;
use usage_beacon::daemon::loop_main::{DaemonArgs as LoopArgs, ServiceLoop};
use usage_beacon::daemon::service::{BeaconService, DeliveryMode, ServiceOptions};
use usage_beacon::daemon::signals::SignalHandler;
use usage_beacon::logger::sqlite::SqliteLogger;
use usage_beacon::metrics::inspector::DiagnosticsSnapshot;
use usage_beacon::store::counter_store::CounterSet;
use usage_beacon::upload::scheduler::{DeviceConditions, NetworkState, ScheduleDecision};
use usage_beacon::upload::target::TargetSummary;

/// On-device usage counters with consent gating and batched upload.
#[derive(Debug, Parser)]
#[command(
    name = "beacon",
    author,
    version,
    about = "Usage beacon - consented usage counters and batched upload",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Record one usage event.
    Record {
        #[command(subcommand)]
        event: RecordEvent,
    },
    /// Show or change the collection consent.
    Consent {
        #[command(subcommand)]
        action: ConsentAction,
    },
    /// Show or change the upload endpoint and API key.
    Endpoint {
        #[command(subcommand)]
        action: EndpointAction,
    },
    /// Run one upload check now, delivering on this thread.
    Flush(FlushArgs),
    /// Show persisted counters, pending batch, and upload state.
    Status,
    /// Show recent activity log entries.
    Activity(ActivityArgs),
    /// Run the periodic upload service until signalled.
    Daemon,
}

#[derive(Debug, Clone, Subcommand)]
enum RecordEvent {
    /// Count an app open.
    Open,
    /// Count an app open at most once per day.
    DailyOpen,
    /// Count one use of a tool.
    Tool { id: String },
    /// Count one ad impression.
    Ad {
        #[arg(value_name = "TYPE")]
        ad_type: String,
    },
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum ConsentAction {
    Show,
    Grant,
    Deny,
}

#[derive(Debug, Clone, Subcommand)]
enum EndpointAction {
    Show,
    /// Persist a new endpoint URL.
    Set { url: String },
    /// Persist a new API key.
    SetKey { key: String },
    /// Disable uploads by storing a blank endpoint.
    Clear,
    /// Forget runtime overrides and use the configured endpoint.
    Reset,
}

#[derive(Debug, Clone, Copy, Args, Default)]
struct FlushArgs {
    /// Treat the network as metered.
    #[arg(long, conflicts_with = "offline")]
    metered: bool,
    /// Treat the battery as low and not charging.
    #[arg(long)]
    low_battery: bool,
    /// Treat the network as unavailable.
    #[arg(long)]
    offline: bool,
}

impl FlushArgs {
    fn conditions(self) -> DeviceConditions {
        let network = if self.offline {
            NetworkState::Offline
        } else if self.metered {
            NetworkState::Metered
        } else {
            NetworkState::Unmetered
        };
        DeviceConditions {
            network,
            battery_low: self.low_battery,
            charging: !self.low_battery,
        }
    }
}

#[derive(Debug, Clone, Copy, Args)]
struct ActivityArgs {
    /// Number of most recent entries to show.
    #[arg(long, default_value_t = 20, value_name = "N")]
    limit: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

impl From<BeaconError> for CliError {
    fn from(err: BeaconError) -> Self {
        match err {
            BeaconError::InvalidConfig { .. }
            | BeaconError::MissingConfig { .. }
            | BeaconError::ConfigParse { .. } => Self::User(err.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }
}

pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }
    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Command::Record { event } => run_record(cli, config, event),
        Command::Consent { action } => run_consent(cli, config, *action),
        Command::Endpoint { action } => run_endpoint(cli, config, action),
        Command::Flush(args) => run_flush(cli, config, *args),
        Command::Status => run_status(cli, config),
        Command::Activity(args) => run_activity(cli, &config, *args),
        Command::Daemon => run_daemon(cli, config),
    }
}

fn open_service(config: Config, delivery: DeliveryMode) -> Result<BeaconService, CliError> {
    Ok(BeaconService::open_with(
        config,
        ServiceOptions {
            delivery,
            ..ServiceOptions::default()
        },
    )?)
}

// ──────────────────── record ────────────────────

fn run_record(cli: &Cli, config: Config, event: &RecordEvent) -> Result<(), CliError> {
    let service = open_service(config, DeliveryMode::Inline)?;
    let granted = service.get_consent()?;
    let (label, queued) = match event {
        RecordEvent::Open => ("app_open".to_string(), service.record_app_open()),
        RecordEvent::DailyOpen => ("daily_open".to_string(), service.record_daily_open_once()),
        RecordEvent::Tool { id } => (format!("tool:{id}"), service.record_tool_use(id)),
        RecordEvent::Ad { ad_type } => {
            (format!("ad:{ad_type}"), service.record_ad_impression(ad_type))
        }
    };
    service.flush_recordings();
    service.shutdown("cli record");

    match output_mode(cli) {
        OutputMode::Human => {
            if !granted {
                println!("{} consent not granted; nothing recorded", "skip".yellow());
            } else if queued {
                println!("{} {label}", "recorded".green());
            } else {
                println!("{} {label} (queue full)", "dropped".red());
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "record",
            "event": label,
            "consent_granted": granted,
            "queued": queued,
        }))?,
    }
    Ok(())
}

// ──────────────────── consent ────────────────────

fn run_consent(cli: &Cli, config: Config, action: ConsentAction) -> Result<(), CliError> {
    let service = open_service(config, DeliveryMode::Inline)?;
    match action {
        ConsentAction::Show => {}
        ConsentAction::Grant => service.set_consent(true)?,
        ConsentAction::Deny => service.set_consent(false)?,
    }
    let state = service.consent_state()?;
    let decided = service.has_decided_consent()?;
    service.shutdown("cli consent");

    match output_mode(cli) {
        OutputMode::Human => {
            let label = match state.as_str() {
                "granted" => state.as_str().green(),
                "denied" => state.as_str().red(),
                other => other.yellow(),
            };
            println!("consent: {label} (decided: {decided})");
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "consent",
            "state": state,
            "decided": decided,
        }))?,
    }
    Ok(())
}

// ──────────────────── endpoint ────────────────────

fn run_endpoint(cli: &Cli, config: Config, action: &EndpointAction) -> Result<(), CliError> {
    let service = open_service(config, DeliveryMode::Inline)?;
    match action {
        EndpointAction::Show => {}
        EndpointAction::Set { url } => service.set_endpoint(url)?,
        EndpointAction::SetKey { key } => service.set_api_key(key)?,
        EndpointAction::Clear => service.disable_uploads()?,
        EndpointAction::Reset => service.reset_upload_target()?,
    }
    let summary = TargetSummary::of(service.upload_target()?.as_ref());
    service.shutdown("cli endpoint");

    match output_mode(cli) {
        OutputMode::Human => print_target(&summary),
        OutputMode::Json => {
            let mut payload = serde_json::to_value(&summary)?;
            payload["command"] = json!("endpoint");
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_target(summary: &TargetSummary) {
    match &summary.endpoint {
        Some(endpoint) => {
            println!("endpoint: {endpoint}");
            println!(
                "api key:  {}",
                summary.api_key.as_deref().unwrap_or("(none)")
            );
        }
        None => println!("endpoint: {}", "uploads disabled".yellow()),
    }
}

// ──────────────────── flush ────────────────────

fn run_flush(cli: &Cli, config: Config, args: FlushArgs) -> Result<(), CliError> {
    let service = open_service(config, DeliveryMode::Inline)?;
    let decision = service.check_now(args.conditions());
    let outcome = service.take_delivery_outcome();
    service.shutdown("cli flush");
    let decision = decision?;

    match output_mode(cli) {
        OutputMode::Human => {
            match &decision {
                ScheduleDecision::Skipped { reason } => {
                    println!("{} {reason:?}", "skipped".yellow());
                }
                ScheduleDecision::Resumed { batch_id } => {
                    println!("resumed pending batch {batch_id}");
                }
                ScheduleDecision::Enqueued { batch_id } => {
                    println!("cut batch {batch_id}");
                }
            }
            if let Some(outcome) = &outcome {
                let line = format!("{outcome:?}");
                if outcome.is_settled() {
                    println!("{} {line}", "delivered".green());
                } else {
                    println!("{} {line}", "deferred".yellow());
                }
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "flush",
            "decision": decision,
            "delivery": outcome,
        }))?,
    }
    Ok(())
}

// ──────────────────── status ────────────────────

fn run_status(cli: &Cli, config: Config) -> Result<(), CliError> {
    let service = open_service(config, DeliveryMode::Inline)?;
    let snapshot = service.snapshot()?;
    service.shutdown("cli status");

    match output_mode(cli) {
        OutputMode::Human => print_status(&snapshot),
        OutputMode::Json => write_json_line(&serde_json::to_value(&snapshot)?)?,
    }
    Ok(())
}

fn print_status(snapshot: &DiagnosticsSnapshot) {
    println!("{}", "usage beacon".bold());
    println!(
        "consent:   {} (decided: {})",
        snapshot.consent, snapshot.consent_decided
    );
    println!("backend:   {}", snapshot.backend);
    print_target(&snapshot.target);
    println!("recorded:  {}", total(&snapshot.raw));
    println!("sent:      {}", total(&snapshot.sent));
    println!("unsent:    {}", total(&snapshot.unsent));
    match &snapshot.pending {
        Some(pending) => println!(
            "pending:   {} ({} cells, cut {})",
            pending.batch_id, pending.cells, pending.created_at
        ),
        None if snapshot.pending_malformed => {
            println!("pending:   {}", "unreadable record".red());
        }
        None => println!("pending:   none"),
    }
    println!("dirty:     {}", snapshot.dirty);
    if let Some(at) = snapshot.last_enqueue_at {
        println!("last send: {at}");
    }
    if let Some(batch_id) = &snapshot.last_acknowledged_batch {
        println!("last ack:  {batch_id}");
    }
}

fn total(set: &CounterSet) -> u64 {
    let scalar: u64 = set.app_opens.values().sum();
    let nested: u64 = set
        .tool_use
        .values()
        .chain(set.ad_impressions.values())
        .flat_map(|cells| cells.values())
        .sum();
    scalar + nested
}

// ──────────────────── activity ────────────────────

fn run_activity(cli: &Cli, config: &Config, args: ActivityArgs) -> Result<(), CliError> {
    let db = SqliteLogger::open(&config.paths.activity_db)?;
    let rows = db.recent_activity(args.limit)?;

    match output_mode(cli) {
        OutputMode::Human => {
            if rows.is_empty() {
                println!("no activity recorded");
            }
            for row in &rows {
                let severity = match row.severity.as_str() {
                    "critical" => row.severity.red(),
                    "warning" => row.severity.yellow(),
                    other => other.normal(),
                };
                let subject = row
                    .batch_id
                    .as_deref()
                    .or(row.details.as_deref())
                    .or(row.error_message.as_deref())
                    .unwrap_or("");
                println!(
                    "{}  {:<8} {:<18} {subject}",
                    row.timestamp, severity, row.event_type
                );
            }
        }
        OutputMode::Json => write_json_line(&json!({
            "command": "activity",
            "entries": rows,
        }))?,
    }
    Ok(())
}

// ──────────────────── daemon ────────────────────

fn run_daemon(cli: &Cli, config: Config) -> Result<(), CliError> {
    let service = open_service(config, DeliveryMode::Background)?;
    let signals = SignalHandler::new();
    let result = ServiceLoop::new(
        &service,
        signals,
        LoopArgs {
            config_path: cli.config.clone(),
            conditions: DeviceConditions::default(),
        },
    )
    .run();
    service.shutdown("signal");
    result.map_err(CliError::from)
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("UMB_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}

//! Embeddable lead tracker command surface.
//!
//! Hosts can drive the tool through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteTrackerStore`].
//!
//! Every read takes an explicit `--as <username>`; the scope is resolved from
//! the directory at the moment the command runs.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lead_tracker_core::{
    classify, now_utc, since_days, AgentInput, AttributionRules, Caller, LeadInput, LeadStatus,
    LoginEventInput, Role,
};
use lead_tracker_store_sqlite::{
    AgentPerformance, DashboardSummary, LeadFilter, LoginLogEntry, MisRecordFilter,
    SqliteTrackerStore, TeamMemberSummary, DEFAULT_RECORD_LIMIT,
};
use serde::Serialize;

pub mod sheet;

#[derive(Debug, Parser)]
#[command(name = "ltk")]
#[command(about = "Lead Tracker CLI")]
pub struct Cli {
    #[arg(long, env = "LEAD_TRACKER_DB", default_value = "./lead_tracker.sqlite3")]
    db: PathBuf,

    /// JSON attribution rule set; the built-in v1 rules apply when omitted.
    #[arg(long, env = "LEAD_TRACKER_RULES")]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Classify one campaign-id without touching the database.
    Classify(ClassifyArgs),
    Agent {
        #[command(subcommand)]
        command: Box<AgentCommand>,
    },
    Mis {
        #[command(subcommand)]
        command: Box<MisCommand>,
    },
    Lead {
        #[command(subcommand)]
        command: Box<LeadCommand>,
    },
    Login {
        #[command(subcommand)]
        command: Box<LoginCommand>,
    },
    Dashboard(WindowArgs),
}

#[derive(Debug, Args)]
pub struct ClassifyArgs {
    #[arg(long)]
    campaign_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CallerArgs {
    /// Username the command runs on behalf of.
    #[arg(long = "as", value_name = "USERNAME")]
    caller: String,
}

#[derive(Debug, Args)]
pub struct ScopedListArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long, default_value_t = 30)]
    days: u32,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    Add(AgentAddArgs),
    List(ScopedListArgs),
    Deactivate(AgentTargetArgs),
    Activate(AgentTargetArgs),
    Assign(AgentAssignArgs),
    /// Per-member activity for everyone the caller can see.
    Team(WindowArgs),
}

#[derive(Debug, Args)]
pub struct AgentAddArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    username: String,
    #[arg(long)]
    email: String,
    #[arg(long, value_enum, default_value_t = RoleArg::User)]
    role: RoleArg,
    /// Username of the supervising team leader.
    #[arg(long)]
    supervisor: Option<String>,
}

#[derive(Debug, Args)]
pub struct AgentTargetArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    username: String,
}

#[derive(Debug, Args)]
pub struct AgentAssignArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    username: String,
    /// New supervisor; omit to detach the agent from any team.
    #[arg(long)]
    supervisor: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum MisCommand {
    Ingest(MisIngestArgs),
    List(MisListArgs),
    Stats(WindowArgs),
    Analytics(WindowArgs),
    Breakdown(WindowArgs),
    Uploads(ScopedListArgs),
    /// Recompute owner tags for every stored row with the active rules.
    Reattribute(CallerArgs),
}

#[derive(Debug, Args)]
pub struct MisIngestArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    file: PathBuf,
    #[arg(long)]
    sheet: Option<String>,
}

#[derive(Debug, Args)]
pub struct MisListArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    campaign_id: Option<String>,
    #[arg(long)]
    owner_tag: Option<String>,
    #[arg(long)]
    distributor_only: bool,
    #[arg(long, default_value_t = DEFAULT_RECORD_LIMIT)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum LeadCommand {
    Create(LeadCreateArgs),
    List(LeadListArgs),
    Show(LeadShowArgs),
    Update(LeadUpdateArgs),
    Stats(WindowArgs),
    Campaign(LeadCampaignArgs),
    Performance(WindowArgs),
}

#[derive(Debug, Args)]
pub struct LeadCreateArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    customer_name: String,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    card_type: Option<String>,
    /// YYYY-MM-DD
    #[arg(long)]
    application_date: Option<String>,
    /// Username of the agent working the lead.
    #[arg(long)]
    assign_to: Option<String>,
    #[arg(long)]
    campaign_tag: Option<String>,
    #[arg(long)]
    bank: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct LeadListArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long, value_enum)]
    status: Option<LeadStatusArg>,
    /// Only leads created by this username.
    #[arg(long)]
    member: Option<String>,
    #[arg(long)]
    campaign_tag: Option<String>,
    #[arg(long, default_value_t = DEFAULT_RECORD_LIMIT)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LeadShowArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct LeadUpdateArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    id: i64,
    #[arg(long, value_enum)]
    status: LeadStatusArg,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
pub struct LeadCampaignArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long)]
    tag: String,
}

#[derive(Debug, Subcommand)]
pub enum LoginCommand {
    Record(LoginRecordArgs),
    Logout(LoginLogoutArgs),
    List(LoginListArgs),
    Stats(WindowArgs),
}

#[derive(Debug, Args)]
pub struct LoginRecordArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    user_agent: Option<String>,
}

#[derive(Debug, Args)]
pub struct LoginLogoutArgs {
    #[arg(long)]
    username: String,
}

#[derive(Debug, Args)]
pub struct LoginListArgs {
    #[command(flatten)]
    caller: CallerArgs,
    #[arg(long, default_value_t = 30)]
    days: u32,
    #[arg(long, default_value_t = DEFAULT_RECORD_LIMIT)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    User,
    TeamLeader,
    Admin,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LeadStatusArg {
    New,
    InProgress,
    Closed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClassifyJsonPayload {
    pub contract_version: String,
    pub rules_version: u32,
    pub campaign_id: String,
    pub owner_tag: Option<String>,
    pub distributor_sourced: bool,
    pub reason: String,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when rule loading, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.rules.as_deref(), cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, rules_path: Option<&Path>, command: Command) -> Result<()> {
    let rules = load_rules(rules_path)?;
    match command {
        Command::Classify(args) => run_classify(&args, &rules),
        command => {
            let mut store = SqliteTrackerStore::open(db_path)?;
            store.migrate()?;
            run_command(command, &mut store, &rules)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when caller resolution, validation, persistence, or
/// retrieval fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteTrackerStore,
    rules: &AttributionRules,
) -> Result<()> {
    match command {
        Command::Classify(args) => run_classify(&args, rules),
        Command::Agent { command } => run_agent(*command, store),
        Command::Mis { command } => run_mis(*command, store, rules),
        Command::Lead { command } => run_lead(*command, store),
        Command::Login { command } => run_login(*command, store),
        Command::Dashboard(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let summary = store.dashboard(&caller, now_utc(), args.days)?;
            if args.json {
                print_json(&summary)
            } else {
                print_dashboard(&summary);
                Ok(())
            }
        }
    }
}

/// Reads and validates an attribution rule file, or returns the built-in rules.
///
/// # Errors
/// Returns an error when the file cannot be read or holds invalid rules.
pub fn load_rules(path: Option<&Path>) -> Result<AttributionRules> {
    let Some(path) = path else {
        return Ok(AttributionRules::v1());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read attribution rules {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    let rules = AttributionRules::from_json(&value)?;
    tracing::debug!(rules_version = rules.rules_version, path = %path.display(), "loaded attribution rules");
    Ok(rules)
}

fn run_classify(args: &ClassifyArgs, rules: &AttributionRules) -> Result<()> {
    let payload = build_classify_json_payload(&args.campaign_id, rules);
    if args.json {
        return print_json(&payload);
    }

    println!(
        "owner_tag={} distributor_sourced={} reason={}",
        payload.owner_tag.as_deref().unwrap_or("none"),
        if payload.distributor_sourced { "yes" } else { "no" },
        payload.reason
    );
    Ok(())
}

fn run_agent(command: AgentCommand, store: &SqliteTrackerStore) -> Result<()> {
    match command {
        AgentCommand::Add(args) => {
            let actor = resolve_caller(store, &args.caller)?;
            let supervisor_id = args
                .supervisor
                .as_deref()
                .map(|name| agent_id_for(store, name))
                .transpose()?;
            let agent = store.create_agent(
                &actor,
                &AgentInput {
                    username: args.username,
                    email: args.email,
                    role: map_role(args.role),
                    supervisor_id,
                },
            )?;
            print_json(&agent)
        }
        AgentCommand::List(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let agents = store.list_agents(&store.scope_for(&caller)?)?;
            if args.json {
                return print_json(&agents);
            }
            println!(
                "{:<8} {:<20} {:<12} {:<10} {:<6}",
                "id", "username", "role", "supervisor", "active"
            );
            for agent in agents {
                println!(
                    "{:<8} {:<20} {:<12} {:<10} {:<6}",
                    agent.agent_id,
                    agent.username,
                    agent.role.as_str(),
                    agent
                        .supervisor_id
                        .map_or_else(|| "-".to_string(), |id| id.to_string()),
                    if agent.is_active { "yes" } else { "no" }
                );
            }
            Ok(())
        }
        AgentCommand::Deactivate(args) => set_active(store, &args, false),
        AgentCommand::Activate(args) => set_active(store, &args, true),
        AgentCommand::Assign(args) => {
            let actor = resolve_caller(store, &args.caller)?;
            let agent_id = agent_id_for(store, &args.username)?;
            let supervisor_id = args
                .supervisor
                .as_deref()
                .map(|name| agent_id_for(store, name))
                .transpose()?;
            let agent = store.assign_supervisor(&actor, agent_id, supervisor_id)?;
            print_json(&agent)
        }
        AgentCommand::Team(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let scope = store.scope_for(&caller)?;
            let overview = store.team_overview(&scope, since_days(now_utc(), args.days))?;
            if args.json {
                print_json(&overview)
            } else {
                print_team_overview(&overview);
                Ok(())
            }
        }
    }
}

fn set_active(store: &SqliteTrackerStore, args: &AgentTargetArgs, active: bool) -> Result<()> {
    let actor = resolve_caller(store, &args.caller)?;
    let agent_id = agent_id_for(store, &args.username)?;
    let agent = store.set_agent_active(&actor, agent_id, active)?;
    print_json(&agent)
}

fn run_mis(command: MisCommand, store: &mut SqliteTrackerStore, rules: &AttributionRules) -> Result<()> {
    match command {
        MisCommand::Ingest(args) => {
            let uploader = resolve_caller(store, &args.caller)?;
            let rows = sheet::read_mis_file(&args.file, args.sheet.as_deref())?;
            let file_name = args
                .file
                .file_name()
                .and_then(|value| value.to_str())
                .ok_or_else(|| anyhow!("invalid MIS file path {}", args.file.display()))?
                .to_string();
            let report = store.ingest_mis_batch(&uploader, &file_name, &rows, rules)?;
            print_json(&report)
        }
        MisCommand::List(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let records = store.list_mis_records(
                &store.scope_for(&caller)?,
                &MisRecordFilter {
                    campaign_id: args.campaign_id,
                    owner_tag: args.owner_tag,
                    distributor_only: args.distributor_only,
                    limit: args.limit,
                },
            )?;
            if args.json {
                return print_json(&records);
            }
            println!(
                "{:<8} {:<32} {:<12} {:<6} {:<16} {}",
                "id", "campaign_id", "owner_tag", "dsa", "app_status", "card_type"
            );
            for record in records {
                println!(
                    "{:<8} {:<32} {:<12} {:<6} {:<16} {}",
                    record.record_id,
                    record.campaign_id.as_deref().unwrap_or("-"),
                    record.owner_tag.as_deref().unwrap_or("-"),
                    if record.distributor_sourced { "yes" } else { "no" },
                    record.application_status.as_deref().unwrap_or("-"),
                    record.card_type.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        MisCommand::Stats(args) => {
            let (scope, since) = window(store, &args)?;
            print_json(&store.mis_statistics(&scope, since)?)
        }
        MisCommand::Analytics(args) => {
            let (scope, since) = window(store, &args)?;
            print_json(&store.mis_analytics(&scope, since)?)
        }
        MisCommand::Breakdown(args) => {
            let (scope, since) = window(store, &args)?;
            print_json(&store.mis_status_breakdown(&scope, since)?)
        }
        MisCommand::Uploads(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let uploads = store.list_mis_uploads(&store.scope_for(&caller)?)?;
            if args.json {
                return print_json(&uploads);
            }
            println!(
                "{:<28} {:<28} {:<16} {:<10} {:<8} {:<8}",
                "batch_id", "file_name", "uploaded_by", "status", "rows", "failed"
            );
            for upload in uploads {
                println!(
                    "{:<28} {:<28} {:<16} {:<10} {:<8} {:<8}",
                    upload.batch_id,
                    upload.file_name,
                    upload.uploaded_by,
                    upload.status,
                    upload.total_rows,
                    upload.failed_rows
                );
            }
            Ok(())
        }
        MisCommand::Reattribute(args) => {
            let actor = resolve_caller(store, &args)?;
            let report = store.reattribute(&actor, rules)?;
            print_json(&report)
        }
    }
}

fn run_lead(command: LeadCommand, store: &mut SqliteTrackerStore) -> Result<()> {
    match command {
        LeadCommand::Create(args) => {
            let creator = resolve_caller(store, &args.caller)?;
            let assigned_to = args
                .assign_to
                .as_deref()
                .map(|name| agent_id_for(store, name))
                .transpose()?;
            let lead = store.create_lead(
                &creator,
                &LeadInput {
                    customer_name: args.customer_name,
                    phone_number: args.phone,
                    email: args.email,
                    card_type: args.card_type,
                    application_date: args.application_date,
                    assigned_to,
                    campaign_tag: args.campaign_tag,
                    bank: args.bank,
                    notes: args.notes,
                },
            )?;
            print_json(&lead)
        }
        LeadCommand::List(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let created_by = args
                .member
                .as_deref()
                .map(|name| agent_id_for(store, name))
                .transpose()?;
            let leads = store.list_leads(
                &store.scope_for(&caller)?,
                &LeadFilter {
                    status: args.status.map(map_status),
                    created_by,
                    campaign_tag: args.campaign_tag,
                    limit: args.limit,
                },
            )?;
            if args.json {
                return print_json(&leads);
            }
            println!(
                "{:<8} {:<24} {:<12} {:<16} {:<10} {}",
                "id", "customer", "status", "campaign_tag", "creator", "card_type"
            );
            for lead in leads {
                println!(
                    "{:<8} {:<24} {:<12} {:<16} {:<10} {}",
                    lead.lead_id,
                    lead.customer_name,
                    lead.status.as_str(),
                    lead.campaign_tag.as_deref().unwrap_or("-"),
                    lead.created_by,
                    lead.card_type
                );
            }
            Ok(())
        }
        LeadCommand::Show(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let scope = store.scope_for(&caller)?;
            let lead = store
                .get_lead(&scope, args.id)?
                .ok_or_else(|| anyhow!("not found: lead {}", args.id))?;
            let progress = store.lead_progress(&scope, args.id)?;
            print_json(&serde_json::json!({
                "lead": lead,
                "progress": progress,
            }))
        }
        LeadCommand::Update(args) => {
            let actor = resolve_caller(store, &args.caller)?;
            let lead = store.update_lead_status(
                &actor,
                args.id,
                map_status(args.status),
                args.notes.as_deref(),
            )?;
            print_json(&lead)
        }
        LeadCommand::Stats(args) => {
            let (scope, since) = window(store, &args)?;
            print_json(&store.lead_statistics(&scope, since)?)
        }
        LeadCommand::Campaign(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            print_json(&store.campaign_progress(&store.scope_for(&caller)?, &args.tag)?)
        }
        LeadCommand::Performance(args) => {
            let (scope, since) = window(store, &args)?;
            let performance = store.agent_performance(&scope, since)?;
            if args.json {
                print_json(&performance)
            } else {
                print_performance(&performance);
                Ok(())
            }
        }
    }
}

fn run_login(command: LoginCommand, store: &SqliteTrackerStore) -> Result<()> {
    match command {
        LoginCommand::Record(args) => {
            let agent_id = agent_id_for(store, &args.username)?;
            let event = store.record_login(
                agent_id,
                &LoginEventInput {
                    ip_address: args.ip,
                    location: args.location,
                    user_agent: args.user_agent,
                },
            )?;
            print_json(&event)
        }
        LoginCommand::Logout(args) => {
            let agent_id = agent_id_for(store, &args.username)?;
            let closed = store.record_logout(agent_id)?;
            print_json(&serde_json::json!({ "closed_sessions": closed }))
        }
        LoginCommand::List(args) => {
            let caller = resolve_caller(store, &args.caller)?;
            let logs = store.list_login_logs(
                &store.scope_for(&caller)?,
                since_days(now_utc(), args.days),
                args.limit,
            )?;
            if args.json {
                print_json(&logs)
            } else {
                print_login_logs(&logs);
                Ok(())
            }
        }
        LoginCommand::Stats(args) => {
            let (scope, since) = window(store, &args)?;
            print_json(&store.login_statistics(&scope, since)?)
        }
    }
}

fn resolve_caller(store: &SqliteTrackerStore, args: &CallerArgs) -> Result<Caller> {
    store.caller_for_username(&args.caller)
}

fn window(
    store: &SqliteTrackerStore,
    args: &WindowArgs,
) -> Result<(lead_tracker_core::VisibilityScope, time::OffsetDateTime)> {
    let caller = resolve_caller(store, &args.caller)?;
    Ok((store.scope_for(&caller)?, since_days(now_utc(), args.days)))
}

fn agent_id_for(store: &SqliteTrackerStore, username: &str) -> Result<lead_tracker_core::AgentId> {
    store
        .get_agent_by_username(username)?
        .map(|agent| agent.agent_id)
        .ok_or_else(|| anyhow!("not found: agent `{username}`"))
}

fn map_role(value: RoleArg) -> Role {
    match value {
        RoleArg::User => Role::User,
        RoleArg::TeamLeader => Role::TeamLeader,
        RoleArg::Admin => Role::Admin,
    }
}

fn map_status(value: LeadStatusArg) -> LeadStatus {
    match value {
        LeadStatusArg::New => LeadStatus::New,
        LeadStatusArg::InProgress => LeadStatus::InProgress,
        LeadStatusArg::Closed => LeadStatus::Closed,
        LeadStatusArg::Rejected => LeadStatus::Rejected,
    }
}

#[must_use]
pub fn build_classify_json_payload(campaign_id: &str, rules: &AttributionRules) -> ClassifyJsonPayload {
    let attribution = classify(Some(campaign_id), rules);
    ClassifyJsonPayload {
        contract_version: "classify.v1".to_string(),
        rules_version: rules.rules_version,
        campaign_id: campaign_id.to_string(),
        owner_tag: attribution.owner_tag,
        distributor_sourced: attribution.distributor_sourced,
        reason: attribution.reason.as_str().to_string(),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_dashboard(summary: &DashboardSummary) {
    println!(
        "caller={} role={} supervisor={} window_days={}",
        summary.caller.username,
        summary.role.as_str(),
        summary
            .supervisor
            .as_ref()
            .map_or("none", |supervisor| supervisor.username.as_str()),
        summary.window_days
    );
    println!(
        "leads total={} {}",
        summary.leads.total,
        summary
            .leads
            .by_status
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect::<Vec<_>>()
            .join(" ")
    );
    println!(
        "mis total={} distributor={} system={} campaigns={} owners={}",
        summary.mis.total_records,
        summary.mis.distributor_records,
        summary.mis.system_records,
        summary.mis.distinct_campaigns,
        summary.mis.distinct_owner_tags
    );
    println!("logins={}", summary.logins);
    print_performance(&summary.performance);
}

fn print_performance(performance: &[AgentPerformance]) {
    println!(
        "{:<20} {:<12} {:<8} {:<8} {:<12} {}",
        "agent", "role", "leads", "closed", "in_progress", "conversion"
    );
    for row in performance {
        println!(
            "{:<20} {:<12} {:<8} {:<8} {:<12} {:.3}",
            row.username,
            row.role.as_str(),
            row.total_leads,
            row.closed_leads,
            row.in_progress_leads,
            row.conversion_rate
        );
    }
}

fn print_team_overview(overview: &[TeamMemberSummary]) {
    println!(
        "{:<20} {:<12} {:<6} {:<6} {:<7} {:<6} {:<9} {:<7} {}",
        "agent", "role", "active", "leads", "closed", "mis", "approved", "logins", "last_login"
    );
    for member in overview {
        println!(
            "{:<20} {:<12} {:<6} {:<6} {:<7} {:<6} {:<9} {:<7} {}",
            member.username,
            member.role.as_str(),
            if member.is_active { "yes" } else { "no" },
            member.leads,
            member.closed_leads,
            member.mis_records,
            member.approved_applications,
            member.logins,
            member.last_login_at.as_deref().unwrap_or("never")
        );
    }
}

fn print_login_logs(logs: &[LoginLogEntry]) {
    println!(
        "{:<8} {:<20} {:<22} {:<22} {:<16} {}",
        "id", "agent", "login_at", "logout_at", "ip", "location"
    );
    for entry in logs {
        let login_at = lead_tracker_core::format_rfc3339(entry.event.login_at)
            .unwrap_or_else(|_| "-".to_string());
        let logout_at = entry
            .event
            .logout_at
            .and_then(|value| lead_tracker_core::format_rfc3339(value).ok())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<20} {:<22} {:<22} {:<16} {}",
            entry.event.login_id,
            entry.username,
            login_at,
            logout_at,
            entry.event.ip_address.as_deref().unwrap_or("-"),
            entry.event.location.as_deref().unwrap_or("-")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args.iter().copied())?;
        run_cli(cli)
    }

    fn temp_db() -> PathBuf {
        std::env::temp_dir().join(format!("lead-tracker-cli-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn classify_json_contract_is_stable_v1() {
        let payload = build_classify_json_payload("ppipl_rpm001_web", &AttributionRules::v1());
        let value = must(serde_json::to_value(payload).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "classify.v1",
                "rules_version": 1,
                "campaign_id": "ppipl_rpm001_web",
                "owner_tag": "RPM001",
                "distributor_sourced": true,
                "reason": "attributed"
            })
        );
    }

    #[test]
    fn rules_file_overrides_built_in_rules() {
        let path = std::env::temp_dir().join(format!("lead-tracker-rules-{}.json", Ulid::new()));
        must(
            std::fs::write(
                &path,
                r#"{"rules_version":3,"prefix":"DSA_","separator":"_","denylist":["TEST"],"min_agent_id_len":3}"#,
            )
            .map_err(anyhow::Error::from),
        );

        let rules = must(load_rules(Some(&path)));
        let _ = std::fs::remove_file(&path);
        assert_eq!(rules.rules_version, 3);
        assert_eq!(
            build_classify_json_payload("DSA_KM204", &rules).owner_tag.as_deref(),
            Some("KM204")
        );
        assert_eq!(must(load_rules(None)), AttributionRules::v1());
    }

    #[test]
    fn invalid_rules_file_is_reported() {
        let path = std::env::temp_dir().join(format!("lead-tracker-rules-{}.json", Ulid::new()));
        must(std::fs::write(&path, r#"{"prefix":""}"#).map_err(anyhow::Error::from));
        let result = load_rules(Some(&path));
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn caller_flag_is_required_for_scoped_reads() {
        let parsed = Cli::try_parse_from(["ltk", "lead", "list"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["ltk", "lead", "list", "--as", "rpm001", "--status", "in-progress"]);
        assert!(parsed.is_ok());
    }

    #[test]
    fn embed_api_runs_against_existing_store() {
        let db = temp_db();
        let mut store = must(SqliteTrackerStore::open(&db));
        must(store.migrate());
        let rules = AttributionRules::v1();

        let parse = |args: &[&str]| -> Command {
            match Cli::try_parse_from(args.iter().copied()) {
                Ok(cli) => cli.command,
                Err(err) => panic!("failed to parse {args:?}: {err}"),
            }
        };

        must(run_command(
            parse(&["ltk", "agent", "add", "--as", "admin", "--username", "tl010", "--email", "tl010@example.com", "--role", "team-leader"]),
            &mut store,
            &rules,
        ));
        must(run_command(
            parse(&["ltk", "agent", "add", "--as", "admin", "--username", "rpm001", "--email", "rpm001@example.com", "--supervisor", "tl010"]),
            &mut store,
            &rules,
        ));
        must(run_command(
            parse(&["ltk", "lead", "create", "--as", "rpm001", "--customer-name", "Asha Rao", "--campaign-tag", "FEB"]),
            &mut store,
            &rules,
        ));

        let leader = must(store.caller_for_username("tl010"));
        let scope = must(store.scope_for(&leader));
        assert_eq!(must(store.list_leads(&scope, &LeadFilter::default())).len(), 1);

        let denied = run_command(
            parse(&["ltk", "agent", "add", "--as", "rpm001", "--username", "rpm002", "--email", "rpm002@example.com"]),
            &mut store,
            &rules,
        );
        assert!(denied.is_err());

        drop(store);
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn cli_end_to_end_ingest_and_scoped_listing() {
        let db = temp_db();
        let csv_path = std::env::temp_dir().join(format!("lead-tracker-mis-{}.csv", Ulid::new()));
        must(
            std::fs::write(
                &csv_path,
                "FORM CAMPAIGN_ID,APPLICATION STATUS,CARD TYPE,Status,LEAD ID\n\
                 PPIPL_RPM001,Approved,Visa Platinum,Contacted,L-1\n\
                 PPIPL_RPM002,Pending,Mastercard,Contacted,L-2\n\
                 ORGANIC_WEB,Approved,Rupay,Contacted,L-3\n",
            )
            .map_err(anyhow::Error::from),
        );
        let db_arg = db.to_string_lossy().to_string();
        let csv_arg = csv_path.to_string_lossy().to_string();

        must(execute_cli(&["ltk", "--db", &db_arg, "agent", "add", "--as", "admin", "--username", "rpm001", "--email", "rpm001@example.com"]));
        must(execute_cli(&["ltk", "--db", &db_arg, "mis", "ingest", "--as", "admin", "--file", &csv_arg]));
        must(execute_cli(&["ltk", "--db", &db_arg, "mis", "list", "--as", "rpm001"]));
        must(execute_cli(&["ltk", "--db", &db_arg, "dashboard", "--as", "rpm001"]));

        let store = must(SqliteTrackerStore::open(&db));
        let user = must(store.caller_for_username("rpm001"));
        let records = must(store.list_mis_records(&must(store.scope_for(&user)), &MisRecordFilter::default()));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].owner_tag.as_deref(), Some("RPM001"));

        assert!(execute_cli(&["ltk", "--db", &db_arg, "mis", "list", "--as", "ghost"]).is_err());

        drop(store);
        let _ = std::fs::remove_file(&db);
        let _ = std::fs::remove_file(&csv_path);
    }
}

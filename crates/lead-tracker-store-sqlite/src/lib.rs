#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use lead_tracker_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, resolve_scope, Agent, AgentId, AgentIdentity,
    AgentInput, Caller, OrgDirectory, RecordFamily, Role, TrackerError, VisibilityScope,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

mod activity;
mod mis;

pub use activity::{
    AgentPerformance, CampaignProgress, DashboardSummary, LeadFilter, LeadStatistics,
    LoginLogEntry, LoginStatistics, TeamMemberSummary,
};
pub use mis::{
    rows_from_table, CountBucket, IngestReport, MisAnalytics, MisBreakdown, MisRecordFilter,
    MisStatistics, MisUpload, ReattributeReport, DEFAULT_RECORD_LIMIT,
};

const TRACKER_MIGRATION_VERSION: i64 = 1;
const DEFAULT_ADMIN_USERNAME: &str = "admin";
const DEFAULT_ADMIN_EMAIL: &str = "admin@lead-tracker.local";

const SCHEMA_TRACKER_V1: &str = r"
CREATE TABLE IF NOT EXISTS agents (
  agent_id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL UNIQUE COLLATE NOCASE,
  email TEXT NOT NULL UNIQUE COLLATE NOCASE,
  role TEXT NOT NULL DEFAULT 'user',
  supervisor_id INTEGER REFERENCES agents(agent_id),
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  created_at TEXT NOT NULL,
  last_login_at TEXT,
  last_login_location TEXT
);

CREATE INDEX IF NOT EXISTS idx_agents_supervisor_active
  ON agents(supervisor_id, is_active);

CREATE TRIGGER IF NOT EXISTS trg_agents_no_delete
BEFORE DELETE ON agents
BEGIN
  SELECT RAISE(FAIL, 'agents are deactivated, never deleted');
END;

CREATE TABLE IF NOT EXISTS mis_uploads (
  batch_id TEXT PRIMARY KEY,
  file_name TEXT NOT NULL,
  uploaded_by INTEGER NOT NULL REFERENCES agents(agent_id),
  uploaded_at TEXT NOT NULL,
  rules_version INTEGER NOT NULL,
  total_rows INTEGER NOT NULL DEFAULT 0,
  inserted_rows INTEGER NOT NULL DEFAULT 0,
  failed_rows INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL CHECK (status IN ('processing', 'completed', 'partial', 'failed'))
);

CREATE TABLE IF NOT EXISTS mis_records (
  record_id INTEGER PRIMARY KEY AUTOINCREMENT,
  batch_id TEXT NOT NULL REFERENCES mis_uploads(batch_id),
  campaign_id TEXT,
  owner_tag TEXT,
  distributor_sourced INTEGER NOT NULL CHECK (distributor_sourced IN (0, 1)),
  attribution_reason TEXT NOT NULL,
  application_number TEXT,
  lead_ref TEXT,
  application_status TEXT,
  card_type TEXT,
  status TEXT,
  disposition TEXT,
  booking_status TEXT,
  attempt INTEGER,
  customer_dropped_page TEXT,
  lead_generation_stage TEXT,
  fields_json TEXT NOT NULL DEFAULT '{}',
  ingested_at TEXT NOT NULL,
  CHECK ((owner_tag IS NULL) = (distributor_sourced = 0))
);

CREATE TRIGGER IF NOT EXISTS trg_mis_records_raw_immutable
BEFORE UPDATE OF campaign_id, fields_json, batch_id ON mis_records
BEGIN
  SELECT RAISE(FAIL, 'mis_records raw columns are immutable');
END;

CREATE INDEX IF NOT EXISTS idx_mis_records_owner_tag
  ON mis_records(owner_tag, ingested_at);
CREATE INDEX IF NOT EXISTS idx_mis_records_campaign
  ON mis_records(campaign_id);
CREATE INDEX IF NOT EXISTS idx_mis_records_batch
  ON mis_records(batch_id);

CREATE TABLE IF NOT EXISTS leads (
  lead_id INTEGER PRIMARY KEY AUTOINCREMENT,
  customer_name TEXT NOT NULL,
  phone_number TEXT,
  email TEXT,
  card_type TEXT NOT NULL DEFAULT 'Credit Card',
  application_date TEXT,
  status TEXT NOT NULL DEFAULT 'new' CHECK (status IN ('new', 'in-progress', 'closed', 'rejected')),
  assigned_to INTEGER REFERENCES agents(agent_id),
  created_by INTEGER NOT NULL REFERENCES agents(agent_id),
  campaign_tag TEXT,
  bank TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_leads_created_by
  ON leads(created_by, created_at);
CREATE INDEX IF NOT EXISTS idx_leads_campaign_tag
  ON leads(campaign_tag);

CREATE TABLE IF NOT EXISTS lead_progress (
  progress_id INTEGER PRIMARY KEY AUTOINCREMENT,
  lead_id INTEGER NOT NULL REFERENCES leads(lead_id),
  agent_id INTEGER NOT NULL REFERENCES agents(agent_id),
  status TEXT NOT NULL CHECK (status IN ('new', 'in-progress', 'closed', 'rejected')),
  notes TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_lead_progress_no_update
BEFORE UPDATE ON lead_progress
BEGIN
  SELECT RAISE(FAIL, 'lead_progress is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_lead_progress_no_delete
BEFORE DELETE ON lead_progress
BEGIN
  SELECT RAISE(FAIL, 'lead_progress is append-only');
END;

CREATE TABLE IF NOT EXISTS login_logs (
  login_id INTEGER PRIMARY KEY AUTOINCREMENT,
  agent_id INTEGER NOT NULL REFERENCES agents(agent_id),
  login_at TEXT NOT NULL,
  logout_at TEXT,
  ip_address TEXT,
  location TEXT,
  user_agent TEXT
);

CREATE INDEX IF NOT EXISTS idx_login_logs_agent_time
  ON login_logs(agent_id, login_at);
";

const AGENT_COLUMNS: &str = "agent_id, username, email, role, supervisor_id, is_active, created_at, last_login_at, last_login_location";

pub struct SqliteTrackerStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub contract_version: String,
    pub current_version: Option<i64>,
    pub target_version: i64,
    pub up_to_date: bool,
}

impl SqliteTrackerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_TRACKER_V1)
            .context("failed to apply lead tracker schema")?;

        let now = timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRACKER_MIGRATION_VERSION, now],
            )
            .context("failed to register lead tracker schema migration")?;

        let seeded = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO agents(username, email, role, created_at)
                 VALUES (?1, ?2, 'admin', ?3)",
                params![DEFAULT_ADMIN_USERNAME, DEFAULT_ADMIN_EMAIL, now],
            )
            .context("failed to seed default admin agent")?;
        if seeded > 0 {
            tracing::info!(username = DEFAULT_ADMIN_USERNAME, "seeded default admin agent");
        }

        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let has_table = table_exists(&self.conn, "schema_migrations")?;
        let current_version = if has_table {
            self.conn
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .context("failed to read schema_migrations")?
        } else {
            None
        };

        Ok(SchemaStatus {
            contract_version: "schema_status.v1".to_string(),
            current_version,
            target_version: TRACKER_MIGRATION_VERSION,
            up_to_date: current_version == Some(TRACKER_MIGRATION_VERSION),
        })
    }

    /// Registers a new agent. Only admins may do this.
    pub fn create_agent(&self, actor: &Caller, input: &AgentInput) -> Result<Agent> {
        actor.require_role(Role::Admin)?;
        input.validate()?;

        if let Some(supervisor_id) = input.supervisor_id {
            self.ensure_supervisor(supervisor_id)?;
        }

        let now = timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO agents(username, email, role, supervisor_id, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    input.username.trim(),
                    input.email.trim(),
                    input.role.as_str(),
                    input.supervisor_id.map(|id| id.0),
                    now
                ],
            )
            .map_err(|err| match err {
                rusqlite::Error::SqliteFailure(code, _)
                    if code.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    anyhow!(
                        "write conflict: username `{}` or email `{}` is already registered",
                        input.username.trim(),
                        input.email.trim()
                    )
                }
                other => anyhow::Error::new(other).context("failed to insert agent"),
            })?;

        let agent_id = AgentId(self.conn.last_insert_rowid());
        tracing::info!(
            agent_id = agent_id.0,
            username = input.username.trim(),
            role = input.role.as_str(),
            created_by = actor.username.as_str(),
            "registered agent"
        );

        self.require_agent(agent_id)
    }

    pub fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        self.conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"),
                params![agent_id.0],
                parse_agent_row,
            )
            .optional()
            .context("failed to query agent by id")
    }

    pub fn get_agent_by_username(&self, username: &str) -> Result<Option<Agent>> {
        self.conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE username = ?1"),
                params![username.trim()],
                parse_agent_row,
            )
            .optional()
            .context("failed to query agent by username")
    }

    /// Soft-deactivates or reactivates an agent. Deactivated agents drop out
    /// of team scopes on the next read.
    pub fn set_agent_active(&self, actor: &Caller, agent_id: AgentId, active: bool) -> Result<Agent> {
        actor.require_role(Role::Admin)?;
        if agent_id == actor.agent_id && !active {
            return Err(TrackerError::Validation(
                "an admin MUST NOT deactivate themselves".to_string(),
            )
            .into());
        }

        let updated = self
            .conn
            .execute(
                "UPDATE agents SET is_active = ?2 WHERE agent_id = ?1",
                params![agent_id.0, bool_to_sql(active)],
            )
            .context("failed to update agent activity")?;
        if updated == 0 {
            return Err(TrackerError::NotFound(format!("agent {agent_id}")).into());
        }

        tracing::info!(agent_id = agent_id.0, active, "changed agent activity");
        self.require_agent(agent_id)
    }

    pub fn assign_supervisor(
        &self,
        actor: &Caller,
        agent_id: AgentId,
        supervisor_id: Option<AgentId>,
    ) -> Result<Agent> {
        actor.require_role(Role::Admin)?;
        let agent = self.require_agent(agent_id)?;

        if let Some(supervisor_id) = supervisor_id {
            if matches!(agent.role, Role::Admin) {
                return Err(TrackerError::Validation(
                    "admin agents MUST NOT have a supervising team leader".to_string(),
                )
                .into());
            }
            if supervisor_id == agent_id {
                return Err(TrackerError::Validation(
                    "an agent MUST NOT supervise themselves".to_string(),
                )
                .into());
            }
            self.ensure_supervisor(supervisor_id)?;
        }

        self.conn
            .execute(
                "UPDATE agents SET supervisor_id = ?2 WHERE agent_id = ?1",
                params![agent_id.0, supervisor_id.map(|id| id.0)],
            )
            .context("failed to update agent supervisor")?;

        tracing::info!(
            agent_id = agent_id.0,
            supervisor_id = supervisor_id.map(|id| id.0),
            "reassigned supervisor"
        );
        self.require_agent(agent_id)
    }

    /// Builds the request-time caller identity for `username`.
    pub fn caller_for_username(&self, username: &str) -> Result<Caller> {
        let agent = self
            .get_agent_by_username(username)?
            .ok_or_else(|| anyhow!("unauthenticated: unknown agent `{}`", username.trim()))?;

        if !agent.is_active {
            return Err(anyhow!(
                "unauthenticated: agent `{}` is deactivated",
                agent.username
            ));
        }

        Ok(Caller {
            agent_id: agent.agent_id,
            username: agent.username,
            role: agent.role,
            supervisor_id: agent.supervisor_id,
        })
    }

    /// Resolves the caller's visibility from the current directory state.
    pub fn scope_for(&self, caller: &Caller) -> Result<VisibilityScope> {
        resolve_scope(caller, self)
    }

    pub fn list_agents(&self, scope: &VisibilityScope) -> Result<Vec<Agent>> {
        let (clause, args) = scope_clause(scope, RecordFamily::Agents, "a");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM agents a WHERE {clause} ORDER BY a.agent_id ASC",
            prefixed_agent_columns("a")
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), parse_agent_row)?;
        collect_rows(rows)
    }

    fn require_agent(&self, agent_id: AgentId) -> Result<Agent> {
        self.get_agent(agent_id)?
            .ok_or_else(|| TrackerError::NotFound(format!("agent {agent_id}")).into())
    }

    fn ensure_supervisor(&self, supervisor_id: AgentId) -> Result<()> {
        let supervisor = self.require_agent(supervisor_id)?;
        if !supervisor.is_active || !matches!(supervisor.role, Role::TeamLeader) {
            return Err(TrackerError::Validation(format!(
                "supervisor `{}` MUST be an active team_leader",
                supervisor.username
            ))
            .into());
        }
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl OrgDirectory for SqliteTrackerStore {
    type Error = anyhow::Error;

    fn supervisor_of(&self, agent_id: AgentId) -> Result<Option<AgentId>> {
        let supervisor = self
            .conn
            .query_row(
                "SELECT supervisor_id FROM agents WHERE agent_id = ?1",
                params![agent_id.0],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .context("failed to query supervisor")?;
        Ok(supervisor.flatten().map(AgentId))
    }

    fn direct_reports(&self, supervisor_id: AgentId) -> Result<Vec<AgentIdentity>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, username
             FROM agents
             WHERE supervisor_id = ?1 AND is_active = 1
             ORDER BY agent_id ASC",
        )?;
        let rows = stmt.query_map(params![supervisor_id.0], |row| {
            Ok(AgentIdentity {
                agent_id: AgentId(row.get(0)?),
                username: row.get(1)?,
            })
        })?;
        collect_rows(rows)
    }
}

/// Column holding the owner of a record in each family.
fn owner_column(family: RecordFamily) -> &'static str {
    match family {
        RecordFamily::Leads => "created_by",
        RecordFamily::MisRecords => "owner_tag",
        RecordFamily::LoginLogs | RecordFamily::Agents => "agent_id",
        RecordFamily::MisUploads => "uploaded_by",
    }
}

/// Renders `scope` as a SQL predicate over `alias`'s ownership column. The
/// predicate uses anonymous `?` placeholders, bound in order from the
/// returned values.
fn scope_clause(
    scope: &VisibilityScope,
    family: RecordFamily,
    alias: &str,
) -> (String, Vec<SqlValue>) {
    let column = format!("{alias}.{}", owner_column(family));
    let values: Vec<SqlValue> = match family.ownership() {
        lead_tracker_core::OwnershipKind::AgentId => match scope.member_ids() {
            None => return ("1 = 1".to_string(), Vec::new()),
            Some(ids) => ids.into_iter().map(|id| SqlValue::Integer(id.0)).collect(),
        },
        lead_tracker_core::OwnershipKind::AgentTag => match scope.member_tags() {
            None => return ("1 = 1".to_string(), Vec::new()),
            Some(tags) => tags.into_iter().map(SqlValue::Text).collect(),
        },
    };

    if values.is_empty() {
        return ("0 = 1".to_string(), values);
    }

    let placeholders = vec!["?"; values.len()].join(", ");
    let clause = match family.ownership() {
        lead_tracker_core::OwnershipKind::AgentId => format!("{column} IN ({placeholders})"),
        lead_tracker_core::OwnershipKind::AgentTag => {
            format!("UPPER({column}) IN ({placeholders})")
        }
    };
    (clause, values)
}

fn prefixed_agent_columns(alias: &str) -> String {
    AGENT_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let agent_id: i64 = row.get(0)?;
    let role_raw: String = row.get(3)?;
    let (role, fell_back) = Role::parse_or_restrictive(&role_raw);
    if fell_back {
        tracing::warn!(
            agent_id,
            role = role_raw.as_str(),
            "unrecognized stored role; applying user scope"
        );
    }

    Ok(Agent {
        agent_id: AgentId(agent_id),
        username: row.get(1)?,
        email: row.get(2)?,
        role,
        supervisor_id: row.get::<_, Option<i64>>(4)?.map(AgentId),
        is_active: row.get::<_, i64>(5)? == 1,
        created_at: parse_time(6, &row.get::<_, String>(6)?)?,
        last_login_at: parse_optional_time(7, row.get(7)?)?,
        last_login_location: row.get(8)?,
    })
}

fn parse_time(index: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| to_sql_error(index, &err))
}

fn parse_optional_time(index: usize, raw: Option<String>) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.as_deref().map(|value| parse_time(index, value)).transpose()
}

fn to_sql_error(index: usize, err: &TrackerError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn count_from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    pub fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    pub fn fixture_store() -> SqliteTrackerStore {
        let store = must(SqliteTrackerStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    pub fn admin(store: &SqliteTrackerStore) -> Caller {
        must(store.caller_for_username(DEFAULT_ADMIN_USERNAME))
    }

    pub fn add_agent(
        store: &SqliteTrackerStore,
        username: &str,
        role: Role,
        supervisor: Option<&Agent>,
    ) -> Agent {
        must(store.create_agent(
            &admin(store),
            &AgentInput {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                role,
                supervisor_id: supervisor.map(|agent| agent.agent_id),
            },
        ))
    }

    pub fn caller(store: &SqliteTrackerStore, username: &str) -> Caller {
        must(store.caller_for_username(username))
    }

    /// Team leader `tl010` supervising `rpm001` and `rpm002`; `rpm003`
    /// reports to a second leader `tl020`.
    pub fn team_fixture(store: &SqliteTrackerStore) -> [Agent; 5] {
        let leader = add_agent(store, "tl010", Role::TeamLeader, None);
        let other_leader = add_agent(store, "tl020", Role::TeamLeader, None);
        let first = add_agent(store, "rpm001", Role::User, Some(&leader));
        let second = add_agent(store, "rpm002", Role::User, Some(&leader));
        let third = add_agent(store, "rpm003", Role::User, Some(&other_leader));
        [leader, other_leader, first, second, third]
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use lead_tracker_core::OwnerRef;
    use ulid::Ulid;

    #[test]
    fn migrate_creates_tables_and_seeds_admin() {
        let store = fixture_store();
        for table in [
            "agents",
            "mis_uploads",
            "mis_records",
            "leads",
            "lead_progress",
            "login_logs",
            "schema_migrations",
        ] {
            assert!(must(table_exists(store.connection(), table)), "{table}");
        }

        let admin = admin(&store);
        assert_eq!(admin.role, Role::Admin);
        assert_eq!(admin.supervisor_id, None);

        let status = must(store.schema_status());
        assert!(status.up_to_date);
        assert_eq!(status.current_version, Some(TRACKER_MIGRATION_VERSION));
    }

    #[test]
    fn migration_is_idempotent() {
        let store = fixture_store();
        let [leader, ..] = team_fixture(&store);
        must(store.migrate());

        let agents = must(store.list_agents(&VisibilityScope::Unrestricted));
        assert_eq!(agents.len(), 6);
        assert!(agents.iter().any(|agent| agent.agent_id == leader.agent_id));
    }

    #[test]
    fn only_admins_register_agents() {
        let store = fixture_store();
        let [leader, ..] = team_fixture(&store);
        let leader_caller = caller(&store, &leader.username);

        let err = match store.create_agent(
            &leader_caller,
            &AgentInput {
                username: "rpm009".to_string(),
                email: "rpm009@example.com".to_string(),
                role: Role::User,
                supervisor_id: Some(leader.agent_id),
            },
        ) {
            Ok(_) => panic!("team leader must not register agents"),
            Err(err) => err,
        };
        assert!(err.to_string().starts_with("forbidden:"));
    }

    #[test]
    fn duplicate_usernames_are_write_conflicts() {
        let store = fixture_store();
        add_agent(&store, "rpm001", Role::User, None);

        let err = match store.create_agent(
            &admin(&store),
            &AgentInput {
                username: "RPM001".to_string(),
                email: "other@example.com".to_string(),
                role: Role::User,
                supervisor_id: None,
            },
        ) {
            Ok(_) => panic!("duplicate username must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("write conflict"));
    }

    #[test]
    fn supervisor_must_be_active_team_leader() {
        let store = fixture_store();
        let plain = add_agent(&store, "rpm001", Role::User, None);

        let result = store.create_agent(
            &admin(&store),
            &AgentInput {
                username: "rpm002".to_string(),
                email: "rpm002@example.com".to_string(),
                role: Role::User,
                supervisor_id: Some(plain.agent_id),
            },
        );
        assert!(result.is_err());

        let leader = add_agent(&store, "tl010", Role::TeamLeader, None);
        must(store.set_agent_active(&admin(&store), leader.agent_id, false));
        let result = store.assign_supervisor(&admin(&store), plain.agent_id, Some(leader.agent_id));
        assert!(result.is_err());
    }

    #[test]
    fn team_scope_follows_current_directory() {
        let store = fixture_store();
        let [leader, other_leader, first, second, third] = team_fixture(&store);
        let leader_caller = caller(&store, &leader.username);

        let scope = must(store.scope_for(&leader_caller));
        assert!(scope.admits(OwnerRef::Agent(first.agent_id)));
        assert!(scope.admits(OwnerRef::Agent(second.agent_id)));
        assert!(scope.admits(OwnerRef::Agent(leader.agent_id)));
        assert!(!scope.admits(OwnerRef::Agent(third.agent_id)));
        assert!(!scope.admits(OwnerRef::Agent(other_leader.agent_id)));

        must(store.assign_supervisor(&admin(&store), third.agent_id, Some(leader.agent_id)));
        must(store.set_agent_active(&admin(&store), second.agent_id, false));

        let scope = must(store.scope_for(&leader_caller));
        assert!(scope.admits(OwnerRef::Agent(third.agent_id)));
        assert!(!scope.admits(OwnerRef::Agent(second.agent_id)));
        assert_eq!(
            must(store.supervisor_of(third.agent_id)),
            Some(leader.agent_id)
        );
    }

    #[test]
    fn deactivated_agents_cannot_act() {
        let store = fixture_store();
        let [_, _, first, ..] = team_fixture(&store);
        must(store.set_agent_active(&admin(&store), first.agent_id, false));

        let err = match store.caller_for_username("rpm001") {
            Ok(_) => panic!("deactivated agent must not resolve"),
            Err(err) => err,
        };
        assert!(err.to_string().starts_with("unauthenticated:"));

        must(store.set_agent_active(&admin(&store), first.agent_id, true));
        must(store.caller_for_username("RPM001"));
    }

    #[test]
    fn agents_are_never_deleted() {
        let store = fixture_store();
        let agent = add_agent(&store, "rpm001", Role::User, None);
        let result = store.connection().execute(
            "DELETE FROM agents WHERE agent_id = ?1",
            params![agent.agent_id.0],
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_stored_role_degrades_to_user_scope() {
        let store = fixture_store();
        let [leader, _, first, ..] = team_fixture(&store);
        must(
            store
                .connection()
                .execute(
                    "UPDATE agents SET role = 'superuser' WHERE agent_id = ?1",
                    params![leader.agent_id.0],
                )
                .map_err(anyhow::Error::from),
        );

        let degraded = caller(&store, &leader.username);
        assert_eq!(degraded.role, Role::User);
        let scope = must(store.scope_for(&degraded));
        assert!(!scope.admits(OwnerRef::Agent(first.agent_id)));
        assert!(scope.admits(OwnerRef::Agent(leader.agent_id)));
    }

    #[test]
    fn list_agents_is_scoped() {
        let store = fixture_store();
        let [leader, ..] = team_fixture(&store);

        let leader_scope = must(store.scope_for(&caller(&store, &leader.username)));
        let names: Vec<String> = must(store.list_agents(&leader_scope))
            .into_iter()
            .map(|agent| agent.username)
            .collect();
        assert_eq!(names, vec!["tl010", "rpm001", "rpm002"]);

        let user_scope = must(store.scope_for(&caller(&store, "rpm003")));
        assert_eq!(must(store.list_agents(&user_scope)).len(), 1);
    }

    #[test]
    fn scope_clause_renders_each_ownership_kind() {
        let scope = VisibilityScope::for_caller(
            &Caller {
                agent_id: AgentId(7),
                username: "rpm007".to_string(),
                role: Role::User,
                supervisor_id: None,
            },
            &[],
        );

        let (clause, args) = scope_clause(&scope, RecordFamily::Leads, "l");
        assert_eq!(clause, "l.created_by IN (?)");
        assert_eq!(args, vec![SqlValue::Integer(7)]);

        let (clause, args) = scope_clause(&scope, RecordFamily::MisRecords, "m");
        assert_eq!(clause, "UPPER(m.owner_tag) IN (?)");
        assert_eq!(args, vec![SqlValue::Text("RPM007".to_string())]);

        let (clause, args) = scope_clause(&VisibilityScope::Unrestricted, RecordFamily::LoginLogs, "g");
        assert_eq!(clause, "1 = 1");
        assert!(args.is_empty());
    }

    #[test]
    fn busy_timeout_allows_write_after_lock_release() {
        let db_path =
            std::env::temp_dir().join(format!("lead-tracker-lock-{}.sqlite3", Ulid::new()));

        let setup = must(SqliteTrackerStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let locker = match Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open locker connection: {err}"),
        };
        if let Err(err) = locker.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to take write lock: {err}");
        }

        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(150));
            if let Err(err) = locker.execute_batch("COMMIT;") {
                panic!("failed to release write lock: {err}");
            }
        });

        let store = must(SqliteTrackerStore::open(&db_path));
        add_agent(&store, "rpm001", Role::User, None);

        if handle.join().is_err() {
            panic!("lock thread panicked");
        }
        let _ = std::fs::remove_file(&db_path);
    }
}

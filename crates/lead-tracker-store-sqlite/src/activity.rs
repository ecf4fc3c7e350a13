use std::collections::BTreeMap;

use anyhow::{Context, Result};
use lead_tracker_core::{
    now_utc, since_days, AgentId, AgentIdentity, Caller, Lead, LeadInput, LeadProgress,
    LeadStatus, LoginEvent, LoginEventInput, OrgDirectory, RecordFamily, Role, TrackerError,
    VisibilityScope,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    collect_rows, count_from_sql, parse_optional_time, parse_time, scope_clause, timestamp,
    MisStatistics, SqliteTrackerStore, DEFAULT_RECORD_LIMIT,
};

const LEAD_COLUMNS: &str = "l.lead_id, l.customer_name, l.phone_number, l.email, l.card_type, l.application_date, l.status, l.assigned_to, l.created_by, l.campaign_tag, l.bank, l.notes, l.created_at, l.updated_at";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadFilter {
    pub status: Option<LeadStatus>,
    pub created_by: Option<AgentId>,
    pub campaign_tag: Option<String>,
    pub limit: usize,
}

impl Default for LeadFilter {
    fn default() -> Self {
        Self {
            status: None,
            created_by: None,
            campaign_tag: None,
            limit: DEFAULT_RECORD_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadStatistics {
    pub contract_version: String,
    pub since: String,
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignProgress {
    pub contract_version: String,
    pub campaign_tag: String,
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPerformance {
    pub agent_id: AgentId,
    pub username: String,
    pub role: Role,
    pub total_leads: u64,
    pub closed_leads: u64,
    pub in_progress_leads: u64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginLogEntry {
    pub username: String,
    #[serde(flatten)]
    pub event: LoginEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginStatistics {
    pub agent_id: AgentId,
    pub username: String,
    pub login_count: u64,
    pub last_login_at: Option<String>,
    pub last_location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamMemberSummary {
    pub agent_id: AgentId,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
    pub leads: u64,
    pub closed_leads: u64,
    pub mis_records: u64,
    pub approved_applications: u64,
    pub logins: u64,
    pub last_login_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardSummary {
    pub contract_version: String,
    pub caller: AgentIdentity,
    pub role: Role,
    pub supervisor: Option<AgentIdentity>,
    pub scope: VisibilityScope,
    pub window_days: u32,
    pub leads: LeadStatistics,
    pub mis: MisStatistics,
    pub logins: u64,
    pub performance: Vec<AgentPerformance>,
}

impl SqliteTrackerStore {
    pub fn create_lead(&self, creator: &Caller, input: &LeadInput) -> Result<Lead> {
        input.validate()?;

        if let Some(assignee) = input.assigned_to {
            let agent = self
                .get_agent(assignee)?
                .ok_or_else(|| TrackerError::NotFound(format!("agent {assignee}")))?;
            if !agent.is_active {
                return Err(TrackerError::Validation(format!(
                    "cannot assign lead to deactivated agent `{}`",
                    agent.username
                ))
                .into());
            }
        }

        let now = timestamp(now_utc())?;
        self.conn
            .execute(
                "INSERT INTO leads(
                    customer_name, phone_number, email, card_type, application_date, status,
                    assigned_to, created_by, campaign_tag, bank, notes, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'new', ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    input.customer_name.trim(),
                    input.phone_number,
                    input.email,
                    input.card_type_or_default(),
                    input.application_date,
                    input.assigned_to.map(|id| id.0),
                    creator.agent_id.0,
                    input.campaign_tag,
                    input.bank,
                    input.notes,
                    now
                ],
            )
            .context("failed to insert lead")?;

        let lead_id = self.conn.last_insert_rowid();
        tracing::info!(lead_id, created_by = creator.username.as_str(), "created lead");

        self.conn
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads l WHERE l.lead_id = ?1"),
                params![lead_id],
                parse_lead_row,
            )
            .context("failed to read back lead")
    }

    pub fn list_leads(&self, scope: &VisibilityScope, filter: &LeadFilter) -> Result<Vec<Lead>> {
        let (clause, mut args) = scope_clause(scope, RecordFamily::Leads, "l");
        let mut sql = format!("SELECT {LEAD_COLUMNS} FROM leads l WHERE {clause}");

        if let Some(status) = filter.status {
            sql.push_str(" AND l.status = ?");
            args.push(SqlValue::Text(status.as_str().to_string()));
        }
        if let Some(created_by) = filter.created_by {
            sql.push_str(" AND l.created_by = ?");
            args.push(SqlValue::Integer(created_by.0));
        }
        if let Some(tag) = &filter.campaign_tag {
            sql.push_str(" AND l.campaign_tag = ?");
            args.push(SqlValue::Text(tag.trim().to_string()));
        }
        sql.push_str(" ORDER BY l.created_at DESC, l.lead_id DESC LIMIT ?");
        args.push(SqlValue::Integer(
            i64::try_from(filter.limit).unwrap_or(i64::MAX),
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), parse_lead_row)?;
        collect_rows(rows)
    }

    /// Returns the lead only when `scope` admits its creator.
    pub fn get_lead(&self, scope: &VisibilityScope, lead_id: i64) -> Result<Option<Lead>> {
        let (clause, mut args) = scope_clause(scope, RecordFamily::Leads, "l");
        args.push(SqlValue::Integer(lead_id));

        self.conn
            .query_row(
                &format!("SELECT {LEAD_COLUMNS} FROM leads l WHERE {clause} AND l.lead_id = ?"),
                params_from_iter(args),
                parse_lead_row,
            )
            .optional()
            .context("failed to query lead")
    }

    /// Moves a lead to `status` and appends a progress entry. A lead outside
    /// the actor's current scope is reported as not found.
    pub fn update_lead_status(
        &mut self,
        actor: &Caller,
        lead_id: i64,
        status: LeadStatus,
        notes: Option<&str>,
    ) -> Result<Lead> {
        let scope = self.scope_for(actor)?;
        let previous = self
            .get_lead(&scope, lead_id)?
            .ok_or_else(|| TrackerError::NotFound(format!("lead {lead_id}")))?;

        let now = timestamp(now_utc())?;
        let notes = notes.map(str::trim).filter(|value| !value.is_empty());

        let tx = self
            .conn
            .transaction()
            .context("failed to start lead update transaction")?;
        tx.execute(
            "UPDATE leads
             SET status = ?2, updated_at = ?3, notes = COALESCE(?4, notes)
             WHERE lead_id = ?1",
            params![lead_id, status.as_str(), now, notes],
        )
        .context("failed to update lead status")?;
        tx.execute(
            "INSERT INTO lead_progress(lead_id, agent_id, status, notes, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lead_id, actor.agent_id.0, status.as_str(), notes, now],
        )
        .context("failed to record lead progress")?;
        tx.commit().context("failed to commit lead update")?;

        tracing::info!(
            lead_id,
            from = previous.status.as_str(),
            to = status.as_str(),
            agent = actor.username.as_str(),
            "updated lead status"
        );

        self.get_lead(&scope, lead_id)?
            .ok_or_else(|| TrackerError::NotFound(format!("lead {lead_id}")).into())
    }

    pub fn lead_progress(&self, scope: &VisibilityScope, lead_id: i64) -> Result<Vec<LeadProgress>> {
        if self.get_lead(scope, lead_id)?.is_none() {
            return Err(TrackerError::NotFound(format!("lead {lead_id}")).into());
        }

        let mut stmt = self.conn.prepare(
            "SELECT progress_id, lead_id, agent_id, status, notes, recorded_at
             FROM lead_progress
             WHERE lead_id = ?1
             ORDER BY progress_id ASC",
        )?;
        let rows = stmt.query_map(params![lead_id], |row| {
            Ok(LeadProgress {
                progress_id: row.get(0)?,
                lead_id: row.get(1)?,
                agent_id: AgentId(row.get(2)?),
                status: parse_status(3, &row.get::<_, String>(3)?)?,
                notes: row.get(4)?,
                recorded_at: parse_time(5, &row.get::<_, String>(5)?)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn lead_statistics(&self, scope: &VisibilityScope, since: OffsetDateTime) -> Result<LeadStatistics> {
        let since = timestamp(since)?;
        let (clause, mut args) = scope_clause(scope, RecordFamily::Leads, "l");
        args.push(SqlValue::Text(since.clone()));

        let by_status = self.count_leads_by_status(
            &format!("{clause} AND l.created_at >= ?"),
            args,
        )?;

        Ok(LeadStatistics {
            contract_version: "lead_statistics.v1".to_string(),
            since,
            total: by_status.values().sum(),
            by_status,
        })
    }

    pub fn campaign_progress(&self, scope: &VisibilityScope, campaign_tag: &str) -> Result<CampaignProgress> {
        let (clause, mut args) = scope_clause(scope, RecordFamily::Leads, "l");
        args.push(SqlValue::Text(campaign_tag.trim().to_string()));

        let by_status = self.count_leads_by_status(&format!("{clause} AND l.campaign_tag = ?"), args)?;

        Ok(CampaignProgress {
            contract_version: "campaign_progress.v1".to_string(),
            campaign_tag: campaign_tag.trim().to_string(),
            total: by_status.values().sum(),
            by_status,
        })
    }

    /// Lead outcomes per visible agent, busiest first.
    #[allow(clippy::cast_precision_loss)]
    pub fn agent_performance(&self, scope: &VisibilityScope, since: OffsetDateTime) -> Result<Vec<AgentPerformance>> {
        let (clause, scope_args) = scope_clause(scope, RecordFamily::Agents, "a");
        let mut args = vec![SqlValue::Text(timestamp(since)?)];
        args.extend(scope_args);

        let mut stmt = self.conn.prepare(&format!(
            "SELECT a.agent_id, a.username, a.role,
                    COUNT(l.lead_id),
                    COALESCE(SUM(CASE WHEN l.status = 'closed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN l.status = 'in-progress' THEN 1 ELSE 0 END), 0)
             FROM agents a
             LEFT JOIN leads l ON l.created_by = a.agent_id AND l.created_at >= ?
             WHERE {clause}
             GROUP BY a.agent_id
             ORDER BY COUNT(l.lead_id) DESC, a.agent_id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            let total_leads = count_from_sql(row.get(3)?);
            let closed_leads = count_from_sql(row.get(4)?);
            Ok(AgentPerformance {
                agent_id: AgentId(row.get(0)?),
                username: row.get(1)?,
                role: Role::parse_or_restrictive(&row.get::<_, String>(2)?).0,
                total_leads,
                closed_leads,
                in_progress_leads: count_from_sql(row.get(5)?),
                conversion_rate: if total_leads == 0 {
                    0.0
                } else {
                    closed_leads as f64 / total_leads as f64
                },
            })
        })?;
        collect_rows(rows)
    }

    /// Records a login and stamps the agent's last-login columns.
    pub fn record_login(&self, agent_id: AgentId, input: &LoginEventInput) -> Result<LoginEvent> {
        let agent = self
            .get_agent(agent_id)?
            .ok_or_else(|| TrackerError::NotFound(format!("agent {agent_id}")))?;
        if !agent.is_active {
            return Err(anyhow::anyhow!(
                "unauthenticated: agent `{}` is deactivated",
                agent.username
            ));
        }

        let login_at = now_utc();
        let login_raw = timestamp(login_at)?;
        self.conn
            .execute(
                "INSERT INTO login_logs(agent_id, login_at, ip_address, location, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    agent_id.0,
                    login_raw,
                    input.ip_address,
                    input.location,
                    input.user_agent
                ],
            )
            .context("failed to insert login log")?;
        let login_id = self.conn.last_insert_rowid();

        self.conn
            .execute(
                "UPDATE agents
                 SET last_login_at = ?2, last_login_location = COALESCE(?3, last_login_location)
                 WHERE agent_id = ?1",
                params![agent_id.0, login_raw, input.location],
            )
            .context("failed to stamp agent last login")?;

        tracing::info!(
            agent_id = agent_id.0,
            username = agent.username.as_str(),
            location = input.location.as_deref(),
            "recorded login"
        );

        Ok(LoginEvent {
            login_id,
            agent_id,
            login_at: lead_tracker_core::parse_rfc3339_utc(&login_raw)?,
            logout_at: None,
            ip_address: input.ip_address.clone(),
            location: input.location.clone(),
            user_agent: input.user_agent.clone(),
        })
    }

    /// Closes every open session of the agent. Returns how many were closed.
    pub fn record_logout(&self, agent_id: AgentId) -> Result<usize> {
        let closed = self
            .conn
            .execute(
                "UPDATE login_logs SET logout_at = ?2 WHERE agent_id = ?1 AND logout_at IS NULL",
                params![agent_id.0, timestamp(now_utc())?],
            )
            .context("failed to record logout")?;
        tracing::info!(agent_id = agent_id.0, closed, "recorded logout");
        Ok(closed)
    }

    pub fn list_login_logs(
        &self,
        scope: &VisibilityScope,
        since: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<LoginLogEntry>> {
        let (clause, mut args) = scope_clause(scope, RecordFamily::LoginLogs, "g");
        args.push(SqlValue::Text(timestamp(since)?));
        args.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let mut stmt = self.conn.prepare(&format!(
            "SELECT g.login_id, g.agent_id, g.login_at, g.logout_at, g.ip_address, g.location,
                    g.user_agent, a.username
             FROM login_logs g
             JOIN agents a ON a.agent_id = g.agent_id
             WHERE {clause} AND g.login_at >= ?
             ORDER BY g.login_at DESC, g.login_id DESC
             LIMIT ?"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(LoginLogEntry {
                username: row.get(7)?,
                event: LoginEvent {
                    login_id: row.get(0)?,
                    agent_id: AgentId(row.get(1)?),
                    login_at: parse_time(2, &row.get::<_, String>(2)?)?,
                    logout_at: parse_optional_time(3, row.get(3)?)?,
                    ip_address: row.get(4)?,
                    location: row.get(5)?,
                    user_agent: row.get(6)?,
                },
            })
        })?;
        collect_rows(rows)
    }

    pub fn login_statistics(&self, scope: &VisibilityScope, since: OffsetDateTime) -> Result<Vec<LoginStatistics>> {
        let (clause, scope_args) = scope_clause(scope, RecordFamily::LoginLogs, "g");
        let mut args = vec![SqlValue::Text(timestamp(since)?)];
        args.extend(scope_args);

        let mut stmt = self.conn.prepare(&format!(
            "SELECT a.agent_id, a.username, COUNT(g.login_id), MAX(g.login_at),
                    (SELECT latest.location
                     FROM login_logs latest
                     WHERE latest.agent_id = a.agent_id
                     ORDER BY latest.login_at DESC, latest.login_id DESC
                     LIMIT 1)
             FROM login_logs g
             JOIN agents a ON a.agent_id = g.agent_id AND g.login_at >= ?
             WHERE {clause}
             GROUP BY a.agent_id
             ORDER BY COUNT(g.login_id) DESC, a.agent_id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(LoginStatistics {
                agent_id: AgentId(row.get(0)?),
                username: row.get(1)?,
                login_count: count_from_sql(row.get(2)?),
                last_login_at: row.get(3)?,
                last_location: row.get(4)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Per-agent activity for every agent the scope admits.
    pub fn team_overview(&self, scope: &VisibilityScope, since: OffsetDateTime) -> Result<Vec<TeamMemberSummary>> {
        let since = timestamp(since)?;
        let (clause, scope_args) = scope_clause(scope, RecordFamily::Agents, "a");
        let mut args: Vec<SqlValue> = (0..5).map(|_| SqlValue::Text(since.clone())).collect();
        args.extend(scope_args);

        let mut stmt = self.conn.prepare(&format!(
            "SELECT a.agent_id, a.username, a.role, a.is_active, a.last_login_at,
                    (SELECT COUNT(*) FROM leads l
                     WHERE l.created_by = a.agent_id AND l.created_at >= ?),
                    (SELECT COUNT(*) FROM leads l
                     WHERE l.created_by = a.agent_id AND l.status = 'closed' AND l.created_at >= ?),
                    (SELECT COUNT(*) FROM mis_records m
                     WHERE UPPER(m.owner_tag) = UPPER(a.username) AND m.ingested_at >= ?),
                    (SELECT COUNT(*) FROM mis_records m
                     WHERE UPPER(m.owner_tag) = UPPER(a.username)
                       AND UPPER(m.application_status) = 'APPROVED'
                       AND m.ingested_at >= ?),
                    (SELECT COUNT(*) FROM login_logs g
                     WHERE g.agent_id = a.agent_id AND g.login_at >= ?)
             FROM agents a
             WHERE {clause}
             ORDER BY a.agent_id ASC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(TeamMemberSummary {
                agent_id: AgentId(row.get(0)?),
                username: row.get(1)?,
                role: Role::parse_or_restrictive(&row.get::<_, String>(2)?).0,
                is_active: row.get::<_, i64>(3)? == 1,
                last_login_at: row.get(4)?,
                leads: count_from_sql(row.get(5)?),
                closed_leads: count_from_sql(row.get(6)?),
                mis_records: count_from_sql(row.get(7)?),
                approved_applications: count_from_sql(row.get(8)?),
                logins: count_from_sql(row.get(9)?),
            })
        })?;
        collect_rows(rows)
    }

    /// Everything the landing page shows for `caller`, computed from a scope
    /// resolved at call time.
    pub fn dashboard(&self, caller: &Caller, now: OffsetDateTime, days: u32) -> Result<DashboardSummary> {
        let scope = self.scope_for(caller)?;
        let since = since_days(now, days);

        let supervisor = match self.supervisor_of(caller.agent_id)? {
            Some(supervisor_id) => self.get_agent(supervisor_id)?.map(|agent| agent.identity()),
            None => None,
        };
        let logins = self
            .login_statistics(&scope, since)?
            .iter()
            .map(|entry| entry.login_count)
            .sum();

        Ok(DashboardSummary {
            contract_version: "dashboard.v1".to_string(),
            caller: caller.identity(),
            role: caller.role,
            supervisor,
            window_days: days,
            leads: self.lead_statistics(&scope, since)?,
            mis: self.mis_statistics(&scope, since)?,
            logins,
            performance: self.agent_performance(&scope, since)?,
            scope,
        })
    }

    fn count_leads_by_status(&self, predicate: &str, args: Vec<SqlValue>) -> Result<BTreeMap<String, u64>> {
        let mut by_status: BTreeMap<String, u64> = LeadStatus::ALL
            .iter()
            .map(|status| (status.as_str().to_string(), 0))
            .collect();

        let mut stmt = self.conn.prepare(&format!(
            "SELECT l.status, COUNT(*) FROM leads l WHERE {predicate} GROUP BY l.status"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((row.get::<_, String>(0)?, count_from_sql(row.get(1)?)))
        })?;
        for (status, count) in collect_rows(rows)? {
            by_status.insert(status, count);
        }
        Ok(by_status)
    }
}

fn parse_status(index: usize, raw: &str) -> rusqlite::Result<LeadStatus> {
    LeadStatus::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid lead status: {raw}"),
            )),
        )
    })
}

fn parse_lead_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lead> {
    Ok(Lead {
        lead_id: row.get(0)?,
        customer_name: row.get(1)?,
        phone_number: row.get(2)?,
        email: row.get(3)?,
        card_type: row.get(4)?,
        application_date: row.get(5)?,
        status: parse_status(6, &row.get::<_, String>(6)?)?,
        assigned_to: row.get::<_, Option<i64>>(7)?.map(AgentId),
        created_by: AgentId(row.get(8)?),
        campaign_tag: row.get(9)?,
        bank: row.get(10)?,
        notes: row.get(11)?,
        created_at: parse_time(12, &row.get::<_, String>(12)?)?,
        updated_at: parse_time(13, &row.get::<_, String>(13)?)?,
    })
}

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod attribution;
pub mod scope;

pub use attribution::{classify, Attribution, AttributionReason, AttributionRules};
pub use scope::{
    resolve_scope, AgentIdentity, Caller, OrgDirectory, OwnerRef, OwnershipKind, RecordFamily,
    Role, VisibilityScope,
};

/// Header of the MIS column carrying the raw campaign-id.
pub const CAMPAIGN_ID_COLUMN: &str = "FORM CAMPAIGN_ID";

/// Columns the dashboards aggregate over. Missing ones only degrade analytics.
pub const TRACKED_MIS_COLUMNS: [&str; 4] = ["APPLICATION STATUS", "CARD TYPE", "Status", "LEAD ID"];

pub const DEFAULT_CARD_TYPE: &str = "Credit Card";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TrackerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AgentId(pub i64);

impl Display for AgentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub agent_id: AgentId,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub supervisor_id: Option<AgentId>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
    pub last_login_location: Option<String>,
}

impl Agent {
    #[must_use]
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            agent_id: self.agent_id,
            username: self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInput {
    pub username: String,
    pub email: String,
    pub role: Role,
    pub supervisor_id: Option<AgentId>,
}

impl AgentInput {
    /// Validates an agent registration before it reaches the directory.
    ///
    /// # Errors
    /// Returns [`TrackerError::Validation`] when identity fields are blank or
    /// an admin is given a supervising team leader.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.username.trim().is_empty() {
            return Err(TrackerError::Validation(
                "username MUST be provided".to_string(),
            ));
        }

        if self.username.chars().any(char::is_whitespace) {
            return Err(TrackerError::Validation(
                "username MUST NOT contain whitespace".to_string(),
            ));
        }

        if !self.email.contains('@') {
            return Err(TrackerError::Validation(
                "email MUST be a valid address".to_string(),
            ));
        }

        if matches!(self.role, Role::Admin) && self.supervisor_id.is_some() {
            return Err(TrackerError::Validation(
                "admin agents MUST NOT have a supervising team leader".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LeadStatus {
    #[serde(rename = "new")]
    New,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "rejected")]
    Rejected,
}

impl LeadStatus {
    pub const ALL: [Self; 4] = [Self::New, Self::InProgress, Self::Closed, Self::Rejected];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in-progress",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "in-progress" | "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lead {
    pub lead_id: i64,
    pub customer_name: String,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub card_type: String,
    pub application_date: Option<String>,
    pub status: LeadStatus,
    pub assigned_to: Option<AgentId>,
    pub created_by: AgentId,
    pub campaign_tag: Option<String>,
    pub bank: Option<String>,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadInput {
    pub customer_name: String,
    pub phone_number: Option<String>,
    pub email: Option<String>,
    pub card_type: Option<String>,
    pub application_date: Option<String>,
    pub assigned_to: Option<AgentId>,
    pub campaign_tag: Option<String>,
    pub bank: Option<String>,
    pub notes: Option<String>,
}

impl LeadInput {
    /// # Errors
    /// Returns [`TrackerError::Validation`] when the customer name is blank.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.customer_name.trim().is_empty() {
            return Err(TrackerError::Validation(
                "customer_name MUST be provided".to_string(),
            ));
        }

        if let Some(date) = &self.application_date {
            if time::Date::parse(date, &time::format_description::well_known::Iso8601::DATE)
                .is_err()
            {
                return Err(TrackerError::Validation(format!(
                    "application_date `{date}` MUST be YYYY-MM-DD"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn card_type_or_default(&self) -> &str {
        self.card_type
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_CARD_TYPE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadProgress {
    pub progress_id: i64,
    pub lead_id: i64,
    pub agent_id: AgentId,
    pub status: LeadStatus,
    pub notes: Option<String>,
    pub recorded_at: OffsetDateTime,
}

/// One spreadsheet row as handed to ingest: the campaign-id plus every raw
/// column, keyed by header text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MisRowInput {
    pub campaign_id: Option<String>,
    pub fields: BTreeMap<String, String>,
}

impl MisRowInput {
    #[must_use]
    pub fn from_columns(fields: BTreeMap<String, String>) -> Self {
        let campaign_id = fields
            .get(CAMPAIGN_ID_COLUMN)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self {
            campaign_id,
            fields,
        }
    }

    #[must_use]
    pub fn field(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MisRecord {
    pub record_id: i64,
    pub batch_id: Ulid,
    pub campaign_id: Option<String>,
    pub owner_tag: Option<String>,
    pub distributor_sourced: bool,
    pub application_status: Option<String>,
    pub card_type: Option<String>,
    pub lead_ref: Option<String>,
    pub ingested_at: OffsetDateTime,
    pub fields: BTreeMap<String, String>,
}

/// Result of checking a sheet's header row before ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderCheck {
    pub missing_tracked: Vec<String>,
}

/// Checks that the campaign-id column is present and lists absent tracked
/// columns.
///
/// # Errors
/// Returns [`TrackerError::Validation`] when the campaign-id column is absent.
pub fn check_mis_headers<S: AsRef<str>>(headers: &[S]) -> Result<HeaderCheck, TrackerError> {
    let has = |wanted: &str| headers.iter().any(|header| header.as_ref().trim() == wanted);

    if !has(CAMPAIGN_ID_COLUMN) {
        return Err(TrackerError::Validation(format!(
            "missing required column `{CAMPAIGN_ID_COLUMN}`"
        )));
    }

    let missing_tracked = TRACKED_MIS_COLUMNS
        .iter()
        .filter(|column| !has(column))
        .map(|column| (*column).to_string())
        .collect();

    Ok(HeaderCheck { missing_tracked })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginEvent {
    pub login_id: i64,
    pub agent_id: AgentId,
    pub login_at: OffsetDateTime,
    pub logout_at: Option<OffsetDateTime>,
    pub ip_address: Option<String>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginEventInput {
    pub ip_address: Option<String>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`TrackerError::Validation`] when the input is not valid RFC3339
/// or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TrackerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| TrackerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(TrackerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 in UTC truncated to whole seconds, so stored
/// values compare correctly as text.
///
/// # Errors
/// Returns [`TrackerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TrackerError> {
    let utc = value.to_offset(UtcOffset::UTC);
    let truncated = utc - Duration::nanoseconds(i64::from(utc.nanosecond()));
    truncated
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            TrackerError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Start of a trailing window of `days` days ending at `now`.
#[must_use]
pub fn since_days(now: OffsetDateTime, days: u32) -> OffsetDateTime {
    now - Duration::days(i64::from(days))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn agent_input(role: Role, supervisor_id: Option<AgentId>) -> AgentInput {
        AgentInput {
            username: "rpm001".to_string(),
            email: "rpm001@example.com".to_string(),
            role,
            supervisor_id,
        }
    }

    #[test]
    fn admin_cannot_have_supervisor() {
        let input = agent_input(Role::Admin, Some(AgentId(2)));
        assert!(matches!(input.validate(), Err(TrackerError::Validation(_))));

        must_ok(agent_input(Role::Admin, None).validate());
        must_ok(agent_input(Role::User, Some(AgentId(2))).validate());
    }

    #[test]
    fn agent_input_rejects_blank_username_and_bad_email() {
        let mut input = agent_input(Role::User, None);
        input.username = "  ".to_string();
        assert!(input.validate().is_err());

        let mut input = agent_input(Role::User, None);
        input.email = "not-an-address".to_string();
        assert!(input.validate().is_err());
    }

    #[test]
    fn lead_status_round_trips_through_text() {
        for status in LeadStatus::ALL {
            assert_eq!(LeadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LeadStatus::parse("in_progress"), Some(LeadStatus::InProgress));
        assert_eq!(LeadStatus::parse("archived"), None);
    }

    #[test]
    fn lead_input_defaults_card_type_and_checks_date() {
        let mut input = LeadInput {
            customer_name: "Asha Rao".to_string(),
            ..LeadInput::default()
        };
        assert_eq!(input.card_type_or_default(), DEFAULT_CARD_TYPE);
        must_ok(input.validate());

        input.application_date = Some("07/02/2026".to_string());
        assert!(input.validate().is_err());

        input.application_date = Some("2026-02-07".to_string());
        must_ok(input.validate());

        input.customer_name = String::new();
        assert!(input.validate().is_err());
    }

    #[test]
    fn mis_row_pulls_campaign_id_from_columns() {
        let mut fields = BTreeMap::new();
        fields.insert(CAMPAIGN_ID_COLUMN.to_string(), "  PPIPL_RPM001 ".to_string());
        fields.insert("CARD TYPE".to_string(), " ".to_string());

        let row = MisRowInput::from_columns(fields);
        assert_eq!(row.campaign_id.as_deref(), Some("PPIPL_RPM001"));
        assert_eq!(row.field("CARD TYPE"), None);
        assert_eq!(row.field(CAMPAIGN_ID_COLUMN), Some("PPIPL_RPM001"));
    }

    #[test]
    fn header_check_requires_campaign_column() {
        let missing = check_mis_headers(&["LEAD ID", "Status"]);
        assert!(matches!(missing, Err(TrackerError::Validation(_))));

        let check = must_ok(check_mis_headers(&[
            "FORM CAMPAIGN_ID",
            "LEAD ID",
            "Status",
        ]));
        assert_eq!(
            check.missing_tracked,
            vec!["APPLICATION STATUS".to_string(), "CARD TYPE".to_string()]
        );
    }

    #[test]
    fn formatted_timestamps_drop_subsecond_precision() {
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00.987Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }

    #[test]
    fn non_utc_timestamps_are_rejected() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+05:30").is_err());
    }

    #[test]
    fn since_days_walks_back_whole_days() {
        let now = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        let since = since_days(now, 30);
        assert_eq!(must_ok(format_rfc3339(since)), "2026-01-08T12:00:00Z");
    }
}

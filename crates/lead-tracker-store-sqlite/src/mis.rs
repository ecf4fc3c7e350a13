use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use lead_tracker_core::{
    check_mis_headers, classify, now_utc, AttributionRules, Caller, MisRecord, MisRowInput,
    RecordFamily, Role, TrackerError, VisibilityScope,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    bool_to_sql, collect_rows, count_from_sql, parse_time, scope_clause, timestamp,
    SqliteTrackerStore,
};

/// Spreadsheet columns copied into dedicated columns for aggregation. Every
/// other column survives only in `fields_json`.
const PROMOTED_COLUMNS: [(&str, &str); 9] = [
    ("APPLICATION NUMBER", "application_number"),
    ("LEAD ID", "lead_ref"),
    ("APPLICATION STATUS", "application_status"),
    ("CARD TYPE", "card_type"),
    ("Status", "status"),
    ("Disposition", "disposition"),
    ("Booking-Status", "booking_status"),
    ("CUSTOMER DROPPED PAGE", "customer_dropped_page"),
    ("LEAD GENERATION STAGE", "lead_generation_stage"),
];

const ATTEMPT_COLUMN: &str = "Attempt";

const BREAKDOWN_DIMENSIONS: [&str; 7] = [
    "application_status",
    "customer_dropped_page",
    "lead_generation_stage",
    "card_type",
    "status",
    "disposition",
    "booking_status",
];

const MIS_RECORD_COLUMNS: &str = "m.record_id, m.batch_id, m.campaign_id, m.owner_tag, m.distributor_sourced, m.application_status, m.card_type, m.lead_ref, m.ingested_at, m.fields_json";

pub const DEFAULT_RECORD_LIMIT: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub contract_version: String,
    pub batch_id: Ulid,
    pub file_name: String,
    pub rules_version: u32,
    pub status: String,
    pub total_rows: usize,
    pub inserted_rows: usize,
    pub failed_rows: usize,
    pub distributor_rows: usize,
    pub system_rows: usize,
    pub missing_tracked_columns: Vec<String>,
    pub unattributed_owner_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReattributeReport {
    pub contract_version: String,
    pub rules_version: u32,
    pub scanned_rows: usize,
    pub changed_rows: usize,
    pub distributor_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MisUpload {
    pub batch_id: Ulid,
    pub file_name: String,
    pub uploaded_by: String,
    pub uploaded_at: OffsetDateTime,
    pub rules_version: u32,
    pub total_rows: u64,
    pub inserted_rows: u64,
    pub failed_rows: u64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MisRecordFilter {
    pub campaign_id: Option<String>,
    pub owner_tag: Option<String>,
    pub distributor_only: bool,
    pub limit: usize,
}

impl Default for MisRecordFilter {
    fn default() -> Self {
        Self {
            campaign_id: None,
            owner_tag: None,
            distributor_only: false,
            limit: DEFAULT_RECORD_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MisStatistics {
    pub contract_version: String,
    pub since: String,
    pub total_records: u64,
    pub distributor_records: u64,
    pub system_records: u64,
    pub distinct_campaigns: u64,
    pub distinct_owner_tags: u64,
    pub last_ingested_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MisAnalytics {
    pub contract_version: String,
    pub since: String,
    pub total_records: u64,
    pub approved: u64,
    pub pending: u64,
    pub rejected: u64,
    pub average_attempts: Option<f64>,
    pub visa_platinum: u64,
    pub mastercard: u64,
    pub unique_campaigns: u64,
    pub unique_drop_pages: u64,
    pub unique_stages: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountBucket {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MisBreakdown {
    pub contract_version: String,
    pub since: String,
    pub dimensions: BTreeMap<String, Vec<CountBucket>>,
}

impl SqliteTrackerStore {
    /// Ingests one uploaded spreadsheet. Each row is classified exactly once
    /// here and the derived owner tag is stored next to the raw data. A row
    /// that fails to insert is counted and skipped.
    pub fn ingest_mis_batch(
        &mut self,
        uploader: &Caller,
        file_name: &str,
        rows: &[MisRowInput],
        rules: &AttributionRules,
    ) -> Result<IngestReport> {
        rules.validate()?;
        if file_name.trim().is_empty() {
            return Err(TrackerError::Validation("file_name MUST be provided".to_string()).into());
        }
        if rows.is_empty() {
            return Err(TrackerError::Validation("MIS batch contains no rows".to_string()).into());
        }

        let headers: BTreeSet<&str> = rows
            .iter()
            .flat_map(|row| row.fields.keys().map(String::as_str))
            .collect();
        let headers: Vec<&str> = headers.into_iter().collect();
        let header_check = check_mis_headers(&headers)?;
        if !header_check.missing_tracked.is_empty() {
            tracing::warn!(
                file_name,
                missing = ?header_check.missing_tracked,
                "MIS upload lacks tracked columns; analytics will be partial"
            );
        }

        let batch_id = Ulid::new();
        let ingested_at = timestamp(now_utc())?;
        let mut inserted_rows = 0_usize;
        let mut failed_rows = 0_usize;
        let mut distributor_rows = 0_usize;

        let tx = self
            .conn
            .transaction()
            .context("failed to start ingest transaction")?;

        tx.execute(
            "INSERT INTO mis_uploads(batch_id, file_name, uploaded_by, uploaded_at, rules_version, total_rows, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'processing')",
            params![
                batch_id.to_string(),
                file_name.trim(),
                uploader.agent_id.0,
                ingested_at,
                i64::from(rules.rules_version),
                i64::try_from(rows.len()).context("row count overflow")?
            ],
        )
        .context("failed to insert mis upload")?;

        {
            let promoted = PROMOTED_COLUMNS
                .iter()
                .map(|(_, column)| *column)
                .collect::<Vec<_>>()
                .join(", ");
            let mut insert = tx
                .prepare(&format!(
                    "INSERT INTO mis_records(
                        batch_id, campaign_id, owner_tag, distributor_sourced, attribution_reason,
                        {promoted}, attempt, fields_json, ingested_at
                     ) VALUES ({})",
                    vec!["?"; 5 + PROMOTED_COLUMNS.len() + 3].join(", ")
                ))
                .context("failed to prepare mis record insert")?;

            for (index, row) in rows.iter().enumerate() {
                let attribution = classify(row.campaign_id.as_deref(), rules);
                let fields_json =
                    serde_json::to_string(&row.fields).context("failed to encode MIS fields")?;

                let mut values: Vec<SqlValue> = vec![
                    SqlValue::Text(batch_id.to_string()),
                    optional_text(row.campaign_id.as_deref()),
                    optional_text(attribution.owner_tag.as_deref()),
                    SqlValue::Integer(bool_to_sql(attribution.distributor_sourced)),
                    SqlValue::Text(attribution.reason.as_str().to_string()),
                ];
                values.extend(
                    PROMOTED_COLUMNS
                        .iter()
                        .map(|(header, _)| optional_text(row.field(header))),
                );
                values.push(
                    row.field(ATTEMPT_COLUMN)
                        .and_then(parse_attempt)
                        .map_or(SqlValue::Null, SqlValue::Integer),
                );
                values.push(SqlValue::Text(fields_json));
                values.push(SqlValue::Text(ingested_at.clone()));

                match insert.execute(params_from_iter(values)) {
                    Ok(_) => {
                        inserted_rows += 1;
                        if attribution.distributor_sourced {
                            distributor_rows += 1;
                        }
                    }
                    Err(err) => {
                        failed_rows += 1;
                        tracing::warn!(
                            batch_id = %batch_id,
                            row = index + 1,
                            error = %err,
                            "failed to insert MIS row"
                        );
                    }
                }
            }
        }

        let status = match (inserted_rows, failed_rows) {
            (_, 0) => "completed",
            (0, _) => "failed",
            _ => "partial",
        };
        tx.execute(
            "UPDATE mis_uploads
             SET inserted_rows = ?2, failed_rows = ?3, status = ?4
             WHERE batch_id = ?1",
            params![
                batch_id.to_string(),
                i64::try_from(inserted_rows).context("row count overflow")?,
                i64::try_from(failed_rows).context("row count overflow")?,
                status
            ],
        )
        .context("failed to finalize mis upload")?;

        let unattributed_owner_tags = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT owner_tag
                 FROM mis_records
                 WHERE batch_id = ?1
                   AND owner_tag IS NOT NULL
                   AND UPPER(owner_tag) NOT IN (SELECT UPPER(username) FROM agents)
                 ORDER BY owner_tag ASC",
            )?;
            let rows = stmt.query_map(params![batch_id.to_string()], |row| row.get::<_, String>(0))?;
            collect_rows(rows)?
        };

        tx.commit().context("failed to commit ingest transaction")?;

        tracing::info!(
            batch_id = %batch_id,
            file_name,
            uploaded_by = uploader.username.as_str(),
            total_rows = rows.len(),
            inserted_rows,
            failed_rows,
            distributor_rows,
            "ingested MIS batch"
        );

        Ok(IngestReport {
            contract_version: "mis_ingest.v1".to_string(),
            batch_id,
            file_name: file_name.trim().to_string(),
            rules_version: rules.rules_version,
            status: status.to_string(),
            total_rows: rows.len(),
            inserted_rows,
            failed_rows,
            distributor_rows,
            system_rows: inserted_rows - distributor_rows,
            missing_tracked_columns: header_check.missing_tracked,
            unattributed_owner_tags,
        })
    }

    /// Recomputes owner tag and distributor flag for every stored row from its
    /// raw campaign-id. Admin only.
    pub fn reattribute(&mut self, actor: &Caller, rules: &AttributionRules) -> Result<ReattributeReport> {
        actor.require_role(Role::Admin)?;
        rules.validate()?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start reattribution transaction")?;

        let stored = {
            let mut stmt = tx.prepare(
                "SELECT record_id, campaign_id, owner_tag FROM mis_records ORDER BY record_id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            collect_rows(rows)?
        };

        let mut changed_rows = 0_usize;
        let mut distributor_rows = 0_usize;
        {
            let mut update = tx.prepare(
                "UPDATE mis_records
                 SET owner_tag = ?2, distributor_sourced = ?3, attribution_reason = ?4
                 WHERE record_id = ?1",
            )?;
            for (record_id, campaign_id, owner_tag) in &stored {
                let attribution = classify(campaign_id.as_deref(), rules);
                if attribution.distributor_sourced {
                    distributor_rows += 1;
                }
                if attribution.owner_tag == *owner_tag {
                    continue;
                }
                update
                    .execute(params![
                        record_id,
                        attribution.owner_tag,
                        bool_to_sql(attribution.distributor_sourced),
                        attribution.reason.as_str()
                    ])
                    .with_context(|| format!("failed to reattribute mis record {record_id}"))?;
                changed_rows += 1;
            }
        }

        tx.commit().context("failed to commit reattribution")?;

        tracing::info!(
            rules_version = rules.rules_version,
            scanned_rows = stored.len(),
            changed_rows,
            "reattributed MIS records"
        );

        Ok(ReattributeReport {
            contract_version: "mis_reattribute.v1".to_string(),
            rules_version: rules.rules_version,
            scanned_rows: stored.len(),
            changed_rows,
            distributor_rows,
        })
    }

    pub fn list_mis_records(
        &self,
        scope: &VisibilityScope,
        filter: &MisRecordFilter,
    ) -> Result<Vec<MisRecord>> {
        let (clause, mut args) = scope_clause(scope, RecordFamily::MisRecords, "m");
        let mut sql = format!("SELECT {MIS_RECORD_COLUMNS} FROM mis_records m WHERE {clause}");

        if let Some(campaign_id) = &filter.campaign_id {
            sql.push_str(" AND UPPER(m.campaign_id) = UPPER(?)");
            args.push(SqlValue::Text(campaign_id.trim().to_string()));
        }
        if let Some(owner_tag) = &filter.owner_tag {
            sql.push_str(" AND UPPER(m.owner_tag) = UPPER(?)");
            args.push(SqlValue::Text(owner_tag.trim().to_string()));
        }
        if filter.distributor_only {
            sql.push_str(" AND m.distributor_sourced = 1");
        }
        sql.push_str(" ORDER BY m.record_id DESC LIMIT ?");
        args.push(SqlValue::Integer(
            i64::try_from(filter.limit).unwrap_or(i64::MAX),
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), parse_mis_record_row)?;
        collect_rows(rows)
    }

    pub fn mis_statistics(&self, scope: &VisibilityScope, since: OffsetDateTime) -> Result<MisStatistics> {
        let since = timestamp(since)?;
        let (clause, mut args) = scope_clause(scope, RecordFamily::MisRecords, "m");
        args.push(SqlValue::Text(since.clone()));

        let stats = self
            .conn
            .query_row(
                &format!(
                    "SELECT
                        COUNT(*),
                        COALESCE(SUM(m.distributor_sourced), 0),
                        COUNT(DISTINCT m.campaign_id),
                        COUNT(DISTINCT m.owner_tag),
                        MAX(m.ingested_at)
                     FROM mis_records m
                     WHERE {clause} AND m.ingested_at >= ?"
                ),
                params_from_iter(args),
                |row| {
                    let total = count_from_sql(row.get(0)?);
                    let distributor = count_from_sql(row.get(1)?);
                    Ok(MisStatistics {
                        contract_version: "mis_statistics.v1".to_string(),
                        since: since.clone(),
                        total_records: total,
                        distributor_records: distributor,
                        system_records: total.saturating_sub(distributor),
                        distinct_campaigns: count_from_sql(row.get(2)?),
                        distinct_owner_tags: count_from_sql(row.get(3)?),
                        last_ingested_at: row.get(4)?,
                    })
                },
            )
            .context("failed to compute MIS statistics")?;

        Ok(stats)
    }

    pub fn mis_analytics(&self, scope: &VisibilityScope, since: OffsetDateTime) -> Result<MisAnalytics> {
        let since = timestamp(since)?;
        let (clause, mut args) = scope_clause(scope, RecordFamily::MisRecords, "m");
        args.push(SqlValue::Text(since.clone()));

        self.conn
            .query_row(
                &format!(
                    "SELECT
                        COUNT(*),
                        COALESCE(SUM(CASE WHEN UPPER(m.application_status) = 'APPROVED' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN UPPER(m.application_status) = 'PENDING' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN UPPER(m.application_status) = 'REJECTED' THEN 1 ELSE 0 END), 0),
                        AVG(m.attempt),
                        COALESCE(SUM(CASE WHEN m.card_type LIKE '%visa%platinum%' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN m.card_type LIKE '%mastercard%' THEN 1 ELSE 0 END), 0),
                        COUNT(DISTINCT m.campaign_id),
                        COUNT(DISTINCT m.customer_dropped_page),
                        COUNT(DISTINCT m.lead_generation_stage)
                     FROM mis_records m
                     WHERE {clause} AND m.ingested_at >= ?"
                ),
                params_from_iter(args),
                |row| {
                    Ok(MisAnalytics {
                        contract_version: "mis_analytics.v1".to_string(),
                        since: since.clone(),
                        total_records: count_from_sql(row.get(0)?),
                        approved: count_from_sql(row.get(1)?),
                        pending: count_from_sql(row.get(2)?),
                        rejected: count_from_sql(row.get(3)?),
                        average_attempts: row.get(4)?,
                        visa_platinum: count_from_sql(row.get(5)?),
                        mastercard: count_from_sql(row.get(6)?),
                        unique_campaigns: count_from_sql(row.get(7)?),
                        unique_drop_pages: count_from_sql(row.get(8)?),
                        unique_stages: count_from_sql(row.get(9)?),
                    })
                },
            )
            .context("failed to compute MIS analytics")
    }

    pub fn mis_status_breakdown(
        &self,
        scope: &VisibilityScope,
        since: OffsetDateTime,
    ) -> Result<MisBreakdown> {
        let since = timestamp(since)?;
        let mut dimensions = BTreeMap::new();

        for dimension in BREAKDOWN_DIMENSIONS {
            let (clause, mut args) = scope_clause(scope, RecordFamily::MisRecords, "m");
            args.push(SqlValue::Text(since.clone()));
            let mut stmt = self.conn.prepare(&format!(
                "SELECT m.{dimension}, COUNT(*)
                 FROM mis_records m
                 WHERE {clause} AND m.ingested_at >= ? AND m.{dimension} IS NOT NULL
                 GROUP BY m.{dimension}
                 ORDER BY COUNT(*) DESC, m.{dimension} ASC"
            ))?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                Ok(CountBucket {
                    value: row.get(0)?,
                    count: count_from_sql(row.get(1)?),
                })
            })?;
            dimensions.insert(dimension.to_string(), collect_rows(rows)?);
        }

        Ok(MisBreakdown {
            contract_version: "mis_breakdown.v1".to_string(),
            since,
            dimensions,
        })
    }

    pub fn list_mis_uploads(&self, scope: &VisibilityScope) -> Result<Vec<MisUpload>> {
        let (clause, args) = scope_clause(scope, RecordFamily::MisUploads, "u");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT u.batch_id, u.file_name, a.username, u.uploaded_at, u.rules_version,
                    u.total_rows, u.inserted_rows, u.failed_rows, u.status
             FROM mis_uploads u
             JOIN agents a ON a.agent_id = u.uploaded_by
             WHERE {clause}
             ORDER BY u.uploaded_at DESC, u.batch_id DESC"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            let batch_raw: String = row.get(0)?;
            let rules_version: i64 = row.get(4)?;
            Ok(MisUpload {
                batch_id: parse_ulid(0, &batch_raw)?,
                file_name: row.get(1)?,
                uploaded_by: row.get(2)?,
                uploaded_at: parse_time(3, &row.get::<_, String>(3)?)?,
                rules_version: u32::try_from(rules_version).unwrap_or_default(),
                total_rows: count_from_sql(row.get(5)?),
                inserted_rows: count_from_sql(row.get(6)?),
                failed_rows: count_from_sql(row.get(7)?),
                status: row.get(8)?,
            })
        })?;
        collect_rows(rows)
    }
}

fn optional_text(value: Option<&str>) -> SqlValue {
    value.map_or(SqlValue::Null, |text| SqlValue::Text(text.to_string()))
}

/// Attempt counts arrive as text, sometimes as spreadsheet floats ("3.0").
#[allow(clippy::cast_possible_truncation)]
fn parse_attempt(raw: &str) -> Option<i64> {
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && value.fract() == 0.0)
        .map(|value| value as i64)
}

fn parse_ulid(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid ULID: {raw}"),
            )),
        )
    })
}

fn parse_mis_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MisRecord> {
    let batch_raw: String = row.get(1)?;
    let fields_raw: String = row.get(9)?;
    let fields: BTreeMap<String, String> = serde_json::from_str(&fields_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid fields_json: {err}"),
            )),
        )
    })?;

    Ok(MisRecord {
        record_id: row.get(0)?,
        batch_id: parse_ulid(1, &batch_raw)?,
        campaign_id: row.get(2)?,
        owner_tag: row.get(3)?,
        distributor_sourced: row.get::<_, i64>(4)? == 1,
        application_status: row.get(5)?,
        card_type: row.get(6)?,
        lead_ref: row.get(7)?,
        ingested_at: parse_time(8, &row.get::<_, String>(8)?)?,
        fields,
    })
}

/// Builds ingest rows from a header row and string cells, skipping rows with
/// no content.
pub fn rows_from_table(headers: &[String], cells: &[Vec<String>]) -> Result<Vec<MisRowInput>> {
    if headers.iter().all(|header| header.trim().is_empty()) {
        return Err(anyhow!("MIS sheet has no header row"));
    }

    Ok(cells
        .iter()
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|row| {
            let fields = headers
                .iter()
                .zip(row.iter().map(String::as_str).chain(std::iter::repeat("")))
                .filter(|(header, _)| !header.trim().is_empty())
                .map(|(header, cell)| (header.trim().to_string(), cell.trim().to_string()))
                .collect();
            MisRowInput::from_columns(fields)
        })
        .collect())
}

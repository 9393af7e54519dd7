//! Finding persistence and the operator workflow on top of it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::detect::source::{FindingKey, FindingsSink, SourceError};
use crate::detect::{DetectError, Finding, FindingAction, FindingKind, FindingStatus, Severity};
use crate::storage::SqliteStore;

const FINDING_COLUMNS: &str = "id, entity_id, rule_id, kind, severity, title, description, metric_name,
     expected_value, actual_value, deviation_pct, suggested_actions_json, status, detected_at,
     resolved_at, resolved_by";

const ACTIVE_STATUSES: &str = "('new', 'acknowledged', 'investigating')";

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 200;

/// Query filter for [`SqliteStore::list_findings`]. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FindingFilter {
    pub status: Option<FindingStatus>,
    pub severity: Option<Severity>,
    pub kind: Option<FindingKind>,
    pub rule_id: Option<i64>,
    pub entity_id: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl FindingFilter {
    /// Page size, clamped to `1..=MAX_LIMIT`.
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

/// Active findings per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
    pub total: u64,
}

impl SeverityCounts {
    fn add(&mut self, severity: Severity, n: u64) {
        match severity {
            Severity::Low => self.low += n,
            Severity::Medium => self.medium += n,
            Severity::High => self.high += n,
            Severity::Critical => self.critical += n,
        }
        self.total += n;
    }
}

struct RawFinding {
    id: String,
    entity_id: Option<i64>,
    rule_id: i64,
    kind: String,
    severity: String,
    title: String,
    description: String,
    metric_name: String,
    expected_value: f64,
    actual_value: f64,
    deviation_pct: f64,
    suggested_actions_json: String,
    status: String,
    detected_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
}

fn read_finding(row: &Row<'_>) -> rusqlite::Result<RawFinding> {
    Ok(RawFinding {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        rule_id: row.get(2)?,
        kind: row.get(3)?,
        severity: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        metric_name: row.get(7)?,
        expected_value: row.get(8)?,
        actual_value: row.get(9)?,
        deviation_pct: row.get(10)?,
        suggested_actions_json: row.get(11)?,
        status: row.get(12)?,
        detected_at: row.get(13)?,
        resolved_at: row.get(14)?,
        resolved_by: row.get(15)?,
    })
}

impl TryFrom<RawFinding> for Finding {
    type Error = SourceError;

    fn try_from(raw: RawFinding) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: String| SourceError::Corrupt(format!("finding {}: {what}: {e}", raw.id));

        Ok(Finding {
            id: Uuid::parse_str(&raw.id).map_err(|e| corrupt("id", e.to_string()))?,
            kind: raw.kind.parse().map_err(|e| corrupt("kind", e))?,
            severity: raw.severity.parse().map_err(|e| corrupt("severity", e))?,
            status: raw.status.parse().map_err(|e| corrupt("status", e))?,
            suggested_actions: serde_json::from_str(&raw.suggested_actions_json)
                .map_err(|e| corrupt("suggested actions", e.to_string()))?,
            entity_id: raw.entity_id,
            rule_id: raw.rule_id,
            title: raw.title,
            description: raw.description,
            metric_name: raw.metric_name,
            expected_value: raw.expected_value,
            actual_value: raw.actual_value,
            deviation_pct: raw.deviation_pct,
            detected_at: raw.detected_at,
            resolved_at: raw.resolved_at,
            resolved_by: raw.resolved_by,
        })
    }
}

fn fetch_finding(conn: &Connection, id: Uuid) -> Result<Option<Finding>, SourceError> {
    let raw = conn
        .query_row(
            &format!("SELECT {FINDING_COLUMNS} FROM findings WHERE id = ?1"),
            [id.to_string()],
            read_finding,
        )
        .optional()?;
    raw.map(Finding::try_from).transpose()
}

impl SqliteStore {
    /// Findings matching `filter`, newest first.
    pub fn list_findings(&self, filter: &FindingFilter) -> Result<Vec<Finding>, SourceError> {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(severity) = filter.severity {
            clauses.push("severity = ?");
            args.push(Value::Text(severity.as_str().to_string()));
        }
        if let Some(kind) = filter.kind {
            clauses.push("kind = ?");
            args.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(rule_id) = filter.rule_id {
            clauses.push("rule_id = ?");
            args.push(Value::Integer(rule_id));
        }
        if let Some(entity_id) = filter.entity_id {
            clauses.push("entity_id = ?");
            args.push(Value::Integer(entity_id));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        args.push(Value::Integer(i64::from(filter.limit())));
        args.push(Value::Integer(i64::from(filter.offset.unwrap_or(0))));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FINDING_COLUMNS} FROM findings {where_clause}
             ORDER BY detected_at DESC, rowid DESC
             LIMIT ? OFFSET ?"
        ))?;
        let rows = stmt.query_map(params_from_iter(args), read_finding)?;

        let mut findings = Vec::new();
        for raw in rows {
            findings.push(Finding::try_from(raw?)?);
        }
        Ok(findings)
    }

    pub fn get_finding(&self, id: Uuid) -> Result<Finding, DetectError> {
        let conn = self.conn()?;
        fetch_finding(&conn, id)?.ok_or_else(|| DetectError::NotFound(format!("finding {id}")))
    }

    /// Apply an operator action. Resolving or dismissing stamps
    /// `resolved_at` and records `actor` as `resolved_by`.
    pub fn transition_finding(
        &self,
        id: Uuid,
        action: FindingAction,
        actor: Option<&str>,
    ) -> Result<Finding, DetectError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = fetch_finding(&tx, id)?.ok_or_else(|| DetectError::NotFound(format!("finding {id}")))?;
        let next = current.status.apply(action)?;

        if next.is_terminal() {
            tx.execute(
                "UPDATE findings SET status = ?1, resolved_at = ?2, resolved_by = ?3 WHERE id = ?4",
                params![next.as_str(), Utc::now(), actor, id.to_string()],
            )?;
        } else {
            tx.execute(
                "UPDATE findings SET status = ?1 WHERE id = ?2",
                params![next.as_str(), id.to_string()],
            )?;
        }

        let updated = fetch_finding(&tx, id)?.ok_or_else(|| DetectError::NotFound(format!("finding {id}")))?;
        tx.commit()?;

        info!(finding = %id, from = %current.status, to = %next, "Finding transitioned");
        Ok(updated)
    }

    /// Counts of active findings per severity, zero-filled.
    pub fn finding_counts(&self) -> Result<SeverityCounts, SourceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT severity, COUNT(*) FROM findings
             WHERE status IN {ACTIVE_STATUSES}
             GROUP BY severity"
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = SeverityCounts::default();
        for row in rows {
            let (severity, n) = row?;
            let severity: Severity = severity.parse().map_err(SourceError::Corrupt)?;
            counts.add(severity, n.max(0) as u64);
        }
        Ok(counts)
    }
}

impl FindingsSink for SqliteStore {
    fn create_many(&self, findings: &[Finding]) -> Result<(), SourceError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO findings ({FINDING_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ))?;
            for f in findings {
                let actions = serde_json::to_string(&f.suggested_actions)
                    .map_err(|e| SourceError::Corrupt(e.to_string()))?;
                stmt.execute(params![
                    f.id.to_string(),
                    f.entity_id,
                    f.rule_id,
                    f.kind.as_str(),
                    f.severity.as_str(),
                    f.title,
                    f.description,
                    f.metric_name,
                    f.expected_value,
                    f.actual_value,
                    f.deviation_pct,
                    actions,
                    f.status.as_str(),
                    f.detected_at,
                    f.resolved_at,
                    f.resolved_by,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn active_keys(&self) -> Result<HashSet<FindingKey>, SourceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT rule_id, entity_id FROM findings WHERE status IN {ACTIVE_STATUSES}"
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;

        let mut keys = HashSet::new();
        for key in rows {
            keys.insert(key?);
        }
        Ok(keys)
    }
}

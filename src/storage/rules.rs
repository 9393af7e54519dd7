//! Rule persistence.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::detect::profiles;
use crate::detect::rule::{ConditionKind, NewRule, Rule};
use crate::detect::source::{RuleSource, SourceError};
use crate::detect::DetectError;
use crate::storage::SqliteStore;

const RULE_COLUMNS: &str = "id, name, description, metric_name, condition_kind, threshold_value,
     floor_value, ceiling_value, lookback_days, enabled, created_at";

struct RawRule {
    rule: Rule,
    condition_kind: String,
}

fn read_rule(row: &Row<'_>) -> rusqlite::Result<RawRule> {
    Ok(RawRule {
        rule: Rule {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            metric_name: row.get(3)?,
            condition_kind: ConditionKind::Threshold,
            threshold_value: row.get(5)?,
            floor_value: row.get(6)?,
            ceiling_value: row.get(7)?,
            lookback_days: row.get(8)?,
            enabled: row.get(9)?,
            created_at: row.get(10)?,
        },
        condition_kind: row.get(4)?,
    })
}

impl TryFrom<RawRule> for Rule {
    type Error = SourceError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        let condition_kind = raw
            .condition_kind
            .parse()
            .map_err(|e| SourceError::Corrupt(format!("rule {}: {e}", raw.rule.id)))?;
        Ok(Rule { condition_kind, ..raw.rule })
    }
}

fn query_rules(conn: &Connection, filter: &str) -> Result<Vec<RawRule>, SourceError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM anomaly_rules {filter} ORDER BY name, id"
    ))?;
    let rows = stmt.query_map([], read_rule)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn fetch_rule(conn: &Connection, id: i64) -> Result<Option<Rule>, SourceError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RULE_COLUMNS} FROM anomaly_rules WHERE id = ?1"),
            [id],
            read_rule,
        )
        .optional()?;
    raw.map(Rule::try_from).transpose()
}

fn insert(conn: &Connection, rule: NewRule) -> Result<Rule, DetectError> {
    rule.validate()?;
    let created_at = Utc::now();
    conn.execute(
        "INSERT INTO anomaly_rules (name, description, metric_name, condition_kind, threshold_value,
             floor_value, ceiling_value, lookback_days, enabled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            rule.name,
            rule.description,
            rule.metric_name,
            rule.condition_kind.as_str(),
            rule.threshold_value,
            rule.floor_value,
            rule.ceiling_value,
            rule.lookback_days,
            rule.enabled,
            created_at,
        ],
    )?;
    Ok(rule.into_rule(conn.last_insert_rowid(), created_at))
}

impl SqliteStore {
    /// All rules, ordered by name.
    pub fn list_rules(&self) -> Result<Vec<Rule>, SourceError> {
        let conn = self.conn()?;
        query_rules(&conn, "")?
            .into_iter()
            .map(Rule::try_from)
            .collect()
    }

    pub fn get_rule(&self, id: i64) -> Result<Rule, DetectError> {
        let conn = self.conn()?;
        fetch_rule(&conn, id)?.ok_or_else(|| DetectError::NotFound(format!("rule {id}")))
    }

    /// Validate and store a new rule. Unknown metric names are rejected here
    /// rather than at evaluation time.
    pub fn insert_rule(&self, rule: NewRule) -> Result<Rule, DetectError> {
        let conn = self.conn()?;
        insert(&conn, rule)
    }

    pub fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<Rule, DetectError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE anomaly_rules SET enabled = ?1 WHERE id = ?2",
            params![enabled, id],
        )?;
        if changed == 0 {
            return Err(DetectError::NotFound(format!("rule {id}")));
        }
        fetch_rule(&conn, id)?.ok_or_else(|| DetectError::NotFound(format!("rule {id}")))
    }

    /// Insert the default rule set if no rules exist yet. Returns how many
    /// rules were inserted.
    pub fn install_defaults(&self) -> Result<usize, DetectError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: i64 = tx.query_row("SELECT COUNT(*) FROM anomaly_rules", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(0);
        }

        let defaults = profiles::defaults();
        let count = defaults.len();
        for rule in defaults {
            insert(&tx, rule)?;
        }
        tx.commit()?;

        info!(count, "Installed default rules");
        Ok(count)
    }
}

impl RuleSource for SqliteStore {
    /// Rows that cannot be decoded are logged and left out so the rest of
    /// the rule set still runs.
    fn enabled_rules(&self) -> Result<Vec<Rule>, SourceError> {
        let conn = self.conn()?;
        let mut rules = Vec::new();
        for raw in query_rules(&conn, "WHERE enabled = 1")? {
            match Rule::try_from(raw) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(error = %e, "Skipping undecodable rule"),
            }
        }
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::metric::MetricField;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_insert_and_read_back() {
        let store = store();
        let inserted = store
            .insert_rule(
                NewRule::new("Budget", MetricField::Spend, ConditionKind::Threshold, 0.0, 1)
                    .with_ceiling(110.0)
                    .describe("daily spend ceiling"),
            )
            .unwrap();

        let loaded = store.get_rule(inserted.id).unwrap();
        assert_eq!(loaded.name, "Budget");
        assert_eq!(loaded.condition_kind, ConditionKind::Threshold);
        assert_eq!(loaded.ceiling_value, Some(110.0));
        assert_eq!(loaded.floor_value, None);
        assert_eq!(loaded.description.as_deref(), Some("daily spend ceiling"));
        assert!(loaded.enabled);
    }

    #[test]
    fn test_unknown_metric_rejected_at_insert() {
        let store = store();
        let mut rule = NewRule::new("x", MetricField::Ctr, ConditionKind::Deviation, 10.0, 7);
        rule.metric_name = "dwell_time".into();

        assert!(matches!(store.insert_rule(rule), Err(DetectError::UnknownMetric(_))));
        assert!(store.list_rules().unwrap().is_empty());
    }

    #[test]
    fn test_toggle_enabled() {
        let store = store();
        let rule = store
            .insert_rule(NewRule::new("CTR", MetricField::Ctr, ConditionKind::Deviation, -30.0, 7))
            .unwrap();

        let disabled = store.set_rule_enabled(rule.id, false).unwrap();
        assert!(!disabled.enabled);
        assert!(store.enabled_rules().unwrap().is_empty());
        assert_eq!(store.list_rules().unwrap().len(), 1);

        assert!(matches!(
            store.set_rule_enabled(999, true),
            Err(DetectError::NotFound(_))
        ));
    }

    #[test]
    fn test_install_defaults_only_once() {
        let store = store();
        assert_eq!(store.install_defaults().unwrap(), 10);
        assert_eq!(store.install_defaults().unwrap(), 0);

        let rules = store.list_rules().unwrap();
        assert_eq!(rules.len(), 10);
        // ordered by name
        assert_eq!(rules[0].name, "Budget Overrun Warning");
    }

    #[test]
    fn test_corrupt_condition_kind_is_reported() {
        let store = store();
        store
            .pool()
            .get()
            .unwrap()
            .execute(
                "INSERT INTO anomaly_rules (name, metric_name, condition_kind) VALUES ('bad', 'ctr', 'wobble')",
                [],
            )
            .unwrap();

        assert!(matches!(store.list_rules(), Err(SourceError::Corrupt(_))));

        store
            .insert_rule(NewRule::new("CTR", MetricField::Ctr, ConditionKind::Deviation, -30.0, 7))
            .unwrap();
        let enabled = store.enabled_rules().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "CTR");
    }
}

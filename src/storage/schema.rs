//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomaly_rules (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            metric_name TEXT NOT NULL,
            condition_kind TEXT NOT NULL,
            threshold_value REAL NOT NULL DEFAULT 0,
            lookback_days INTEGER NOT NULL DEFAULT 7 CHECK (lookback_days >= 1),
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS performance_metrics (
            id INTEGER PRIMARY KEY,
            entity_id INTEGER NOT NULL,
            period TEXT NOT NULL,
            impressions INTEGER NOT NULL DEFAULT 0,
            clicks INTEGER NOT NULL DEFAULT 0,
            ctr REAL NOT NULL DEFAULT 0,
            conversions INTEGER NOT NULL DEFAULT 0,
            spend REAL NOT NULL DEFAULT 0,
            viewability_rate REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS findings (
            id TEXT PRIMARY KEY,
            entity_id INTEGER,
            rule_id INTEGER NOT NULL REFERENCES anomaly_rules(id),
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            expected_value REAL NOT NULL,
            actual_value REAL NOT NULL,
            deviation_pct REAL NOT NULL,
            suggested_actions_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'new',
            detected_at TEXT NOT NULL,
            resolved_at TEXT,
            resolved_by TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_metrics_period ON performance_metrics(period);
        CREATE INDEX IF NOT EXISTS idx_metrics_entity_period ON performance_metrics(entity_id, period);
        CREATE INDEX IF NOT EXISTS idx_findings_detected ON findings(detected_at);
        CREATE INDEX IF NOT EXISTS idx_findings_status ON findings(status);
        CREATE INDEX IF NOT EXISTS idx_findings_rule_entity ON findings(rule_id, entity_id);",
    )?;

    // Migration: explicit threshold bounds on rules
    for column in ["floor_value", "ceiling_value"] {
        let present: i32 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('anomaly_rules') WHERE name = ?1",
                [column],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if present == 0 {
            conn.execute(&format!("ALTER TABLE anomaly_rules ADD COLUMN {column} REAL"), [])?;
        }
    }

    Ok(())
}

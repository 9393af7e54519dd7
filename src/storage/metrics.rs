//! Metric ingest and the aggregate queries detection runs on.

use rusqlite::{params, OptionalExtension};

use crate::detect::metric::{MetricField, MetricPoint, MetricRow};
use crate::detect::rule::ThresholdBound;
use crate::detect::source::{MetricsSource, SourceError};
use crate::detect::window::DateRange;
use crate::storage::SqliteStore;

impl SqliteStore {
    /// Append metric rows in one transaction. Duplicate `(entity, period)`
    /// rows are stored as given.
    pub fn insert_metrics(&self, rows: &[MetricRow]) -> Result<usize, SourceError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO performance_metrics
                     (entity_id, period, impressions, clicks, ctr, conversions, spend, viewability_rate)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.entity_id,
                    row.period,
                    row.impressions,
                    row.clicks,
                    row.ctr,
                    row.conversions,
                    row.spend,
                    row.viewability_rate,
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }
}

impl MetricsSource for SqliteStore {
    fn average(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<f64>, SourceError> {
        let conn = self.conn()?;
        let avg = conn.query_row(
            &format!(
                "SELECT AVG({}) FROM performance_metrics
                 WHERE period >= ?1 AND period <= ?2
                 AND (?3 IS NULL OR entity_id = ?3)",
                metric.column()
            ),
            params![range.start, range.end, entity],
            |row| row.get::<_, Option<f64>>(0),
        )?;
        Ok(avg)
    }

    fn latest(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<MetricPoint>, SourceError> {
        let conn = self.conn()?;
        let point = conn
            .query_row(
                &format!(
                    "SELECT entity_id, {}, period FROM performance_metrics
                     WHERE period >= ?1 AND period <= ?2
                     AND (?3 IS NULL OR entity_id = ?3)
                     ORDER BY period DESC, id DESC
                     LIMIT 1",
                    metric.column()
                ),
                params![range.start, range.end, entity],
                |row| {
                    Ok(MetricPoint {
                        entity_id: row.get(0)?,
                        value: row.get(1)?,
                        period: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(point)
    }

    fn rows_violating(
        &self,
        metric: MetricField,
        bound: &ThresholdBound,
        range: DateRange,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, SourceError> {
        let conn = self.conn()?;
        let col = metric.column();
        let mut stmt = conn.prepare(&format!(
            "SELECT entity_id, {col}, period FROM performance_metrics
             WHERE period >= ?1 AND period <= ?2
             AND ((?3 IS NOT NULL AND {col} < ?3) OR (?4 IS NOT NULL AND {col} > ?4))
             ORDER BY period DESC, id DESC
             LIMIT ?5"
        ))?;

        let rows = stmt.query_map(
            params![range.start, range.end, bound.floor, bound.ceiling, limit as i64],
            |row| {
                Ok(MetricPoint {
                    entity_id: row.get(0)?,
                    value: row.get(1)?,
                    period: row.get(2)?,
                })
            },
        )?;

        let mut points = Vec::new();
        for r in rows {
            points.push(r?);
        }
        Ok(points)
    }
}

//! In-memory rule store, metrics source and findings sink.
//!
//! Used to embed the engine without a database and to drive it in tests.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::detect::metric::{MetricField, MetricPoint, MetricRow};
use crate::detect::rule::{NewRule, Rule, ThresholdBound};
use crate::detect::source::{FindingKey, FindingsSink, MetricsSource, RuleSource, SourceError};
use crate::detect::window::{mean, DateRange};
use crate::detect::{DetectError, Finding};

#[derive(Debug, Default)]
struct Inner {
    rules: Vec<Rule>,
    metrics: Vec<MetricRow>,
    findings: Vec<Finding>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate and store a rule, assigning the next id.
    pub fn add_rule(&self, rule: NewRule) -> Result<Rule, DetectError> {
        rule.validate()?;
        Ok(self.push_rule(rule))
    }

    /// Store a rule without validation, the way legacy rows arrive.
    pub fn push_rule(&self, rule: NewRule) -> Rule {
        let mut inner = self.lock();
        let id = inner.rules.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let rule = rule.into_rule(id, Utc::now());
        inner.rules.push(rule.clone());
        rule
    }

    pub fn set_enabled(&self, rule_id: i64, enabled: bool) -> Result<(), DetectError> {
        let mut inner = self.lock();
        let rule = inner
            .rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| DetectError::NotFound(format!("rule {rule_id}")))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn insert_metrics(&self, rows: &[MetricRow]) {
        self.lock().metrics.extend_from_slice(rows);
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.lock().findings.clone()
    }

    /// Rows in `range` (optionally for one entity), in insertion order.
    fn points(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Vec<MetricPoint> {
        self.lock()
            .metrics
            .iter()
            .filter(|row| range.contains(row.period))
            .filter(|row| entity.map_or(true, |e| row.entity_id == e))
            .map(|row| metric.point(row))
            .collect()
    }
}

impl RuleSource for MemoryStore {
    fn enabled_rules(&self) -> Result<Vec<Rule>, SourceError> {
        Ok(self.lock().rules.iter().filter(|r| r.enabled).cloned().collect())
    }
}

impl MetricsSource for MemoryStore {
    fn average(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<f64>, SourceError> {
        let values: Vec<f64> = self
            .points(metric, entity, range)
            .iter()
            .map(|p| p.value)
            .collect();
        Ok(mean(&values))
    }

    fn latest(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<MetricPoint>, SourceError> {
        // max_by_key keeps the last maximum, so ties go to the newest insert.
        Ok(self
            .points(metric, entity, range)
            .into_iter()
            .max_by_key(|p| p.period))
    }

    fn rows_violating(
        &self,
        metric: MetricField,
        bound: &ThresholdBound,
        range: DateRange,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, SourceError> {
        let mut points: Vec<(usize, MetricPoint)> = self
            .points(metric, None, range)
            .into_iter()
            .enumerate()
            .filter(|(_, p)| bound.violation(p.value).is_some())
            .collect();
        points.sort_by(|(ia, a), (ib, b)| b.period.cmp(&a.period).then(ib.cmp(ia)));
        Ok(points.into_iter().take(limit).map(|(_, p)| p).collect())
    }
}

impl FindingsSink for MemoryStore {
    fn create_many(&self, findings: &[Finding]) -> Result<(), SourceError> {
        self.lock().findings.extend_from_slice(findings);
        Ok(())
    }

    fn active_keys(&self) -> Result<HashSet<FindingKey>, SourceError> {
        Ok(self
            .lock()
            .findings
            .iter()
            .filter(|f| f.status.is_active())
            .map(|f| (f.rule_id, f.entity_id))
            .collect())
    }
}

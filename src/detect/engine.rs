use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::finding;
use crate::detect::metric::MetricField;
use crate::detect::rule::{ConditionKind, Rule};
use crate::detect::source::{FindingsSink, MetricsSource, RuleSource};
use crate::detect::window::{pct_change, DateRange, MAX_LOOKBACK_DAYS};
use crate::detect::{DetectError, Finding};

/// Tunables for a detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectOptions {
    /// Cap on findings a single threshold rule may emit per run.
    pub max_threshold_findings: usize,
    /// Drop findings whose rule and entity already have an active finding.
    pub dedupe_open_findings: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            max_threshold_findings: 10,
            dedupe_open_findings: false,
        }
    }
}

/// Evaluates every enabled rule against the metrics source and persists
/// the violations it finds.
pub struct DetectionEngine<R, M, F> {
    rules: R,
    metrics: M,
    findings: F,
    options: DetectOptions,
}

impl<R, M, F> DetectionEngine<R, M, F>
where
    R: RuleSource,
    M: MetricsSource,
    F: FindingsSink,
{
    pub fn new(rules: R, metrics: M, findings: F) -> Self {
        Self {
            rules,
            metrics,
            findings,
            options: DetectOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DetectOptions) -> Self {
        self.options = options;
        self
    }

    /// Run all enabled rules as of `effective_date` and return the findings
    /// that were created.
    ///
    /// `lookback_override` replaces every rule's window when set. A rule
    /// that fails or finds no data contributes nothing; only an unreachable
    /// store or a failed batch write aborts the run.
    pub fn run_detection(
        &self,
        effective_date: NaiveDate,
        lookback_override: Option<u32>,
    ) -> Result<Vec<Finding>, DetectError> {
        let rules = self.rules.enabled_rules()?;
        info!(rules = rules.len(), %effective_date, "Running anomaly detection");

        let mut created = Vec::new();
        let mut skipped = 0usize;
        for rule in &rules {
            let lookback = lookback_override
                .filter(|days| *days > 0)
                .unwrap_or(rule.lookback_days)
                .clamp(1, MAX_LOOKBACK_DAYS);

            match self.evaluate_rule(rule, effective_date, lookback) {
                Ok(found) => {
                    debug!(rule_id = rule.id, rule = %rule.name, found = found.len(), "Rule evaluated");
                    created.extend(found);
                }
                Err(DetectError::Source(e)) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    skipped += 1;
                    warn!(rule_id = rule.id, rule = %rule.name, error = %e, "Skipping rule");
                }
            }
        }

        if self.options.dedupe_open_findings && !created.is_empty() {
            let mut seen = self.findings.active_keys()?;
            let before = created.len();
            created.retain(|f| seen.insert((f.rule_id, f.entity_id)));
            debug!(dropped = before - created.len(), "Suppressed duplicate findings");
        }

        if !created.is_empty() {
            self.findings.create_many(&created)?;
        }

        info!(
            evaluated = rules.len() - skipped,
            skipped,
            findings = created.len(),
            "Anomaly detection finished"
        );
        Ok(created)
    }

    fn evaluate_rule(
        &self,
        rule: &Rule,
        effective_date: NaiveDate,
        lookback_days: u32,
    ) -> Result<Vec<Finding>, DetectError> {
        let metric = rule.metric()?;

        match rule.condition_kind {
            ConditionKind::Threshold => self.check_threshold(rule, metric, effective_date, lookback_days),
            ConditionKind::Deviation => self.check_deviation(rule, metric, effective_date, lookback_days),
            ConditionKind::Trend => self.check_trend(rule, metric, effective_date, lookback_days),
        }
    }

    /// Every row in the window outside the rule's fixed bounds.
    fn check_threshold(
        &self,
        rule: &Rule,
        metric: MetricField,
        effective_date: NaiveDate,
        lookback_days: u32,
    ) -> Result<Vec<Finding>, DetectError> {
        let bound = rule.threshold_bound();
        let window = DateRange::lookback(effective_date, lookback_days);
        let violations = self.metrics.rows_violating(
            metric,
            &bound,
            window,
            self.options.max_threshold_findings,
        )?;

        Ok(violations
            .iter()
            .filter_map(|point| {
                let direction = bound.violation(point.value)?;
                let crossed = bound.crossed(direction)?;
                Some(finding::threshold(rule, metric, point, crossed, direction))
            })
            .collect())
    }

    /// The latest row against the window average.
    fn check_deviation(
        &self,
        rule: &Rule,
        metric: MetricField,
        effective_date: NaiveDate,
        lookback_days: u32,
    ) -> Result<Vec<Finding>, DetectError> {
        let window = DateRange::lookback(effective_date, lookback_days);

        let Some(average) = self.metrics.average(metric, None, window)? else {
            return Ok(Vec::new());
        };
        if average == 0.0 || !average.is_finite() {
            return Ok(Vec::new());
        }
        let Some(latest) = self.metrics.latest(metric, None, window)? else {
            return Ok(Vec::new());
        };

        let deviation = pct_change(average, latest.value);
        if deviation.abs() < rule.threshold_value.abs() {
            return Ok(Vec::new());
        }
        Ok(vec![finding::deviation(
            rule,
            metric,
            &latest,
            average,
            deviation,
            lookback_days,
        )])
    }

    /// Second-half average against first-half average.
    fn check_trend(
        &self,
        rule: &Rule,
        metric: MetricField,
        effective_date: NaiveDate,
        lookback_days: u32,
    ) -> Result<Vec<Finding>, DetectError> {
        let (first, second) = DateRange::halves(effective_date, lookback_days);
        if first.is_empty() {
            return Ok(Vec::new());
        }

        let first_avg = self.metrics.average(metric, None, first)?;
        let second_avg = self.metrics.average(metric, None, second)?;
        let (Some(first_avg), Some(second_avg)) = (first_avg, second_avg) else {
            return Ok(Vec::new());
        };
        if first_avg == 0.0 || second_avg == 0.0 {
            return Ok(Vec::new());
        }

        let change = pct_change(first_avg, second_avg);
        let threshold = rule.threshold_value;
        let fires = (threshold < 0.0 && change <= threshold) || (threshold > 0.0 && change >= threshold);
        if !fires {
            return Ok(Vec::new());
        }
        Ok(vec![finding::trend(
            rule,
            metric,
            first_avg,
            second_avg,
            change,
            lookback_days,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::memory::MemoryStore;
    use crate::detect::metric::{MetricPoint, MetricRow};
    use crate::detect::rule::{NewRule, ThresholdBound};
    use crate::detect::source::{FindingKey, SourceError};
    use crate::detect::{FindingKind, Severity};
    use std::collections::HashSet;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn row(entity: i64, period: NaiveDate, metric: MetricField, value: f64) -> MetricRow {
        MetricRow::empty(entity, period).with(metric, value)
    }

    fn engine(store: &MemoryStore) -> DetectionEngine<&MemoryStore, &MemoryStore, &MemoryStore> {
        DetectionEngine::new(store, store, store)
    }

    #[test]
    fn test_threshold_floor() {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new(
                "Viewability Floor",
                MetricField::ViewabilityRate,
                ConditionKind::Threshold,
                50.0,
                1,
            ))
            .unwrap();
        store.insert_metrics(&[row(3, day(6, 10), MetricField::ViewabilityRate, 40.0)]);

        let found = engine(&store).run_detection(day(6, 10), None).unwrap();
        assert_eq!(found.len(), 1);
        let f = &found[0];
        assert_eq!(f.actual_value, 40.0);
        assert_eq!(f.expected_value, 50.0);
        assert_eq!(f.severity, Severity::Medium);
        assert_eq!(f.deviation_pct, 0.0);
        assert_eq!(f.entity_id, Some(3));
        assert_eq!(f.kind, FindingKind::ViewabilityDrop);
    }

    #[test]
    fn test_threshold_signed_ceiling() {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("Spend Ceiling", MetricField::Spend, ConditionKind::Threshold, -110.0, 1))
            .unwrap();
        store.insert_metrics(&[
            row(1, day(6, 10), MetricField::Spend, 120.0),
            row(2, day(6, 10), MetricField::Spend, 90.0),
        ]);

        let found = engine(&store).run_detection(day(6, 10), None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].actual_value, 120.0);
        assert_eq!(found[0].expected_value, 110.0);
        assert_eq!(found[0].kind, FindingKind::BudgetOverrun);
    }

    #[test]
    fn test_threshold_explicit_ceiling() {
        let store = MemoryStore::new();
        store
            .add_rule(
                NewRule::new("Budget", MetricField::Spend, ConditionKind::Threshold, 0.0, 1)
                    .with_ceiling(110.0),
            )
            .unwrap();
        store.insert_metrics(&[
            row(1, day(6, 10), MetricField::Spend, 120.0),
            row(2, day(6, 10), MetricField::Spend, 50.0),
        ]);

        let found = engine(&store).run_detection(day(6, 10), None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entity_id, Some(1));
    }

    #[test]
    fn test_threshold_is_capped() {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("Floor", MetricField::ViewabilityRate, ConditionKind::Threshold, 50.0, 1))
            .unwrap();
        let rows: Vec<MetricRow> = (0..15)
            .map(|e| row(e, day(6, 10), MetricField::ViewabilityRate, 10.0))
            .collect();
        store.insert_metrics(&rows);

        let found = engine(&store).run_detection(day(6, 10), None).unwrap();
        assert_eq!(found.len(), 10);

        let options = DetectOptions { max_threshold_findings: 3, ..Default::default() };
        let found = engine(&store).with_options(options).run_detection(day(6, 10), None).unwrap();
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_threshold_ignores_rows_outside_window() {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("Floor", MetricField::ViewabilityRate, ConditionKind::Threshold, 50.0, 1))
            .unwrap();
        store.insert_metrics(&[
            row(1, day(6, 1), MetricField::ViewabilityRate, 10.0),
            row(2, day(6, 20), MetricField::ViewabilityRate, 10.0),
        ]);

        assert!(engine(&store).run_detection(day(6, 10), None).unwrap().is_empty());
    }

    fn deviation_store(values: &[f64]) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("Drop", MetricField::Impressions, ConditionKind::Deviation, -30.0, 7))
            .unwrap();
        let rows: Vec<MetricRow> = values
            .iter()
            .enumerate()
            .map(|(i, v)| row(i as i64 + 1, day(6, 8 + i as u32), MetricField::Impressions, *v))
            .collect();
        store.insert_metrics(&rows);
        store
    }

    #[test]
    fn test_deviation_below_threshold_is_quiet() {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("CTR Drop", MetricField::Ctr, ConditionKind::Deviation, -30.0, 7))
            .unwrap();
        store.insert_metrics(&[
            row(1, day(6, 8), MetricField::Ctr, 2.05),
            row(1, day(6, 9), MetricField::Ctr, 2.05),
            row(1, day(6, 10), MetricField::Ctr, 1.9),
        ]);

        assert!(engine(&store).run_detection(day(6, 10), None).unwrap().is_empty());
    }

    #[test]
    fn test_deviation_high_severity() {
        let store = deviation_store(&[1300.0, 1300.0, 400.0]);
        let found = engine(&store).run_detection(day(6, 10), None).unwrap();

        assert_eq!(found.len(), 1);
        let f = &found[0];
        assert_eq!(f.severity, Severity::High);
        assert_eq!(f.deviation_pct, -60.0);
        assert_eq!(f.expected_value, 1000.0);
        assert_eq!(f.actual_value, 400.0);
        assert_eq!(f.entity_id, Some(3));
        assert_eq!(f.kind, FindingKind::PerformanceDrop);
    }

    #[test]
    fn test_deviation_medium_severity() {
        let store = deviation_store(&[1200.0, 1200.0, 600.0]);
        let found = engine(&store).run_detection(day(6, 10), None).unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Medium);
        assert_eq!(found[0].deviation_pct, -40.0);
    }

    #[test]
    fn test_deviation_fires_on_spikes_regardless_of_sign() {
        let store = deviation_store(&[500.0, 500.0, 2000.0]);
        let found = engine(&store).run_detection(day(6, 10), None).unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, FindingKind::ImpressionSpike);
        assert!(found[0].deviation_pct > 0.0);
    }

    #[test]
    fn test_deviation_zero_average_is_skipped() {
        let store = deviation_store(&[0.0, 0.0, 0.0]);
        assert!(engine(&store).run_detection(day(6, 10), None).unwrap().is_empty());

        let empty = deviation_store(&[]);
        assert!(engine(&empty).run_detection(day(6, 10), None).unwrap().is_empty());
    }

    fn trend_store(threshold: f64, first: f64, second: f64) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("Conversion Decline", MetricField::Conversions, ConditionKind::Trend, threshold, 14))
            .unwrap();
        // effective Jun 15: first half Jun 1..=7, second half Jun 8..=15
        let mut rows = Vec::new();
        for d in 1..=7 {
            rows.push(row(1, day(6, d), MetricField::Conversions, first));
        }
        for d in 8..=15 {
            rows.push(row(1, day(6, d), MetricField::Conversions, second));
        }
        store.insert_metrics(&rows);
        store
    }

    #[test]
    fn test_trend_decline() {
        let store = trend_store(-25.0, 100.0, 70.0);
        let found = engine(&store).run_detection(day(6, 15), None).unwrap();

        assert_eq!(found.len(), 1);
        let f = &found[0];
        assert_eq!(f.severity, Severity::High);
        assert_eq!(f.expected_value, 100.0);
        assert_eq!(f.actual_value, 70.0);
        assert_eq!(f.deviation_pct, -30.0);
        assert_eq!(f.entity_id, None);
        assert_eq!(f.kind, FindingKind::ConversionDecline);
    }

    #[test]
    fn test_trend_is_asymmetric() {
        // growth does not trip a decline rule
        let store = trend_store(-25.0, 100.0, 150.0);
        assert!(engine(&store).run_detection(day(6, 15), None).unwrap().is_empty());

        // growth rule fires on growth
        let store = trend_store(25.0, 100.0, 150.0);
        let found = engine(&store).run_detection(day(6, 15), None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].deviation_pct, 50.0);

        // and not on a decline
        let store = trend_store(25.0, 100.0, 60.0);
        assert!(engine(&store).run_detection(day(6, 15), None).unwrap().is_empty());
    }

    #[test]
    fn test_trend_zero_first_half_is_skipped() {
        let store = trend_store(-25.0, 0.0, 70.0);
        assert!(engine(&store).run_detection(day(6, 15), None).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_metric_does_not_block_other_rules() {
        let store = MemoryStore::new();
        let mut legacy = NewRule::new("Legacy", MetricField::Ctr, ConditionKind::Deviation, 10.0, 7);
        legacy.metric_name = "bounce_rate".into();
        store.push_rule(legacy);
        let valid = store
            .add_rule(NewRule::new("Floor", MetricField::ViewabilityRate, ConditionKind::Threshold, 50.0, 1))
            .unwrap();
        store.insert_metrics(&[row(1, day(6, 10), MetricField::ViewabilityRate, 40.0)]);

        let found = engine(&store).run_detection(day(6, 10), None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule_id, valid.id);
    }

    #[test]
    fn test_oversized_lookback_does_not_break_the_run() {
        let store = MemoryStore::new();
        store.push_rule(NewRule::new("Wide", MetricField::Conversions, ConditionKind::Trend, -25.0, 1_000_000_000));
        let valid = store
            .add_rule(NewRule::new("Floor", MetricField::ViewabilityRate, ConditionKind::Threshold, 50.0, 1))
            .unwrap();
        store.insert_metrics(&[row(1, day(6, 10), MetricField::ViewabilityRate, 40.0)]);

        let found = engine(&store).run_detection(day(6, 10), None).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule_id, valid.id);

        let found = engine(&store).run_detection(day(6, 10), Some(u32::MAX)).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_disabled_rules_are_not_evaluated() {
        let store = MemoryStore::new();
        let rule = store
            .add_rule(NewRule::new("Floor", MetricField::ViewabilityRate, ConditionKind::Threshold, 50.0, 1))
            .unwrap();
        store.set_enabled(rule.id, false).unwrap();
        store.insert_metrics(&[row(1, day(6, 10), MetricField::ViewabilityRate, 40.0)]);

        assert!(engine(&store).run_detection(day(6, 10), None).unwrap().is_empty());
    }

    #[test]
    fn test_lookback_override_widens_every_window() {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("Floor", MetricField::ViewabilityRate, ConditionKind::Threshold, 50.0, 1))
            .unwrap();
        store.insert_metrics(&[row(1, day(6, 5), MetricField::ViewabilityRate, 40.0)]);

        assert!(engine(&store).run_detection(day(6, 10), None).unwrap().is_empty());
        assert_eq!(engine(&store).run_detection(day(6, 10), Some(7)).unwrap().len(), 1);
        // zero is treated as no override
        assert!(engine(&store).run_detection(day(6, 10), Some(0)).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_runs_duplicate_findings() {
        let store = deviation_store(&[1300.0, 1300.0, 400.0]);
        let first = engine(&store).run_detection(day(6, 10), None).unwrap();
        let second = engine(&store).run_detection(day(6, 10), None).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(store.findings().len(), 2);
    }

    #[test]
    fn test_dedupe_suppresses_active_duplicates() {
        let store = deviation_store(&[1300.0, 1300.0, 400.0]);
        let options = DetectOptions { dedupe_open_findings: true, ..Default::default() };

        let first = engine(&store).with_options(options.clone()).run_detection(day(6, 10), None).unwrap();
        let second = engine(&store).with_options(options).run_detection(day(6, 10), None).unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(store.findings().len(), 1);
    }

    #[test]
    fn test_engine_is_deterministic_apart_from_identity() {
        let a = deviation_store(&[1300.0, 1300.0, 400.0]);
        let b = deviation_store(&[1300.0, 1300.0, 400.0]);
        let fa = engine(&a).run_detection(day(6, 10), None).unwrap();
        let fb = engine(&b).run_detection(day(6, 10), None).unwrap();

        let strip = |f: &Finding| (f.rule_id, f.entity_id, f.kind, f.severity, f.title.clone(), f.deviation_pct);
        assert_eq!(fa.iter().map(strip).collect::<Vec<_>>(), fb.iter().map(strip).collect::<Vec<_>>());
    }

    /// Fails every query on one metric, delegates the rest.
    struct FlakyMetrics<'a> {
        inner: &'a MemoryStore,
        broken: MetricField,
        fatal: bool,
    }

    impl FlakyMetrics<'_> {
        fn fail(&self, metric: MetricField) -> Result<(), SourceError> {
            if metric != self.broken {
                return Ok(());
            }
            if self.fatal {
                Err(SourceError::Unavailable("connection refused".into()))
            } else {
                Err(SourceError::Query(rusqlite::Error::QueryReturnedNoRows))
            }
        }
    }

    impl MetricsSource for FlakyMetrics<'_> {
        fn average(&self, metric: MetricField, entity: Option<i64>, range: DateRange) -> Result<Option<f64>, SourceError> {
            self.fail(metric)?;
            self.inner.average(metric, entity, range)
        }

        fn latest(&self, metric: MetricField, entity: Option<i64>, range: DateRange) -> Result<Option<MetricPoint>, SourceError> {
            self.fail(metric)?;
            self.inner.latest(metric, entity, range)
        }

        fn rows_violating(
            &self,
            metric: MetricField,
            bound: &ThresholdBound,
            range: DateRange,
            limit: usize,
        ) -> Result<Vec<MetricPoint>, SourceError> {
            self.fail(metric)?;
            self.inner.rows_violating(metric, bound, range, limit)
        }
    }

    fn two_rule_store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .add_rule(NewRule::new("CTR", MetricField::Ctr, ConditionKind::Deviation, 10.0, 7))
            .unwrap();
        store
            .add_rule(NewRule::new("Floor", MetricField::ViewabilityRate, ConditionKind::Threshold, 50.0, 1))
            .unwrap();
        store.insert_metrics(&[row(1, day(6, 10), MetricField::ViewabilityRate, 40.0)]);
        store
    }

    #[test]
    fn test_query_failure_is_isolated_to_its_rule() {
        let store = two_rule_store();
        let metrics = FlakyMetrics { inner: &store, broken: MetricField::Ctr, fatal: false };

        let found = DetectionEngine::new(&store, metrics, &store)
            .run_detection(day(6, 10), None)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metric_name, "viewability_rate");
    }

    #[test]
    fn test_unreachable_source_aborts_the_run() {
        let store = two_rule_store();
        let metrics = FlakyMetrics { inner: &store, broken: MetricField::Ctr, fatal: true };

        let err = DetectionEngine::new(&store, metrics, &store)
            .run_detection(day(6, 10), None)
            .unwrap_err();
        assert!(matches!(err, DetectError::Source(SourceError::Unavailable(_))));
        assert!(store.findings().is_empty());
    }

    struct DeadSink;

    impl FindingsSink for DeadSink {
        fn create_many(&self, _: &[Finding]) -> Result<(), SourceError> {
            Err(SourceError::Unavailable("disk full".into()))
        }

        fn active_keys(&self) -> Result<HashSet<FindingKey>, SourceError> {
            Ok(HashSet::new())
        }
    }

    #[test]
    fn test_sink_failure_fails_the_run() {
        let store = two_rule_store();
        let result = DetectionEngine::new(&store, &store, DeadSink).run_detection(day(6, 10), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_nothing_written_when_nothing_found() {
        let store = MemoryStore::new();
        let found = DetectionEngine::new(&store, &store, DeadSink)
            .run_detection(day(6, 10), None)
            .unwrap();
        assert!(found.is_empty());
    }
}

//! Collaborator capabilities the detection engine depends on.

use std::collections::HashSet;

use thiserror::Error;

use crate::detect::metric::{MetricField, MetricPoint};
use crate::detect::rule::{Rule, ThresholdBound};
use crate::detect::window::DateRange;
use crate::detect::Finding;

#[derive(Debug, Error)]
pub enum SourceError {
    /// The store could not be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl SourceError {
    /// Fatal errors end a detection run; anything else only ends the rule
    /// that hit it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Key identifying "the same anomaly" across runs: rule and entity.
pub type FindingKey = (i64, Option<i64>);

pub trait RuleSource {
    fn enabled_rules(&self) -> Result<Vec<Rule>, SourceError>;
}

/// Aggregate reads over the metrics time-series.
///
/// `entity` narrows the query to one entity; `None` aggregates across all
/// of them.
pub trait MetricsSource {
    /// Mean of `metric` over the rows in `range`, `None` when there are none.
    fn average(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<f64>, SourceError>;

    /// The most recent row in `range`.
    fn latest(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<MetricPoint>, SourceError>;

    /// Up to `limit` rows in `range` violating `bound`, most recent first.
    fn rows_violating(
        &self,
        metric: MetricField,
        bound: &ThresholdBound,
        range: DateRange,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, SourceError>;
}

pub trait FindingsSink {
    /// Persist a batch of new findings, all or nothing.
    fn create_many(&self, findings: &[Finding]) -> Result<(), SourceError>;

    /// Keys of findings that are still new, acknowledged or investigating.
    fn active_keys(&self) -> Result<HashSet<FindingKey>, SourceError>;
}

impl<T: RuleSource + ?Sized> RuleSource for &T {
    fn enabled_rules(&self) -> Result<Vec<Rule>, SourceError> {
        (**self).enabled_rules()
    }
}

impl<T: MetricsSource + ?Sized> MetricsSource for &T {
    fn average(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<f64>, SourceError> {
        (**self).average(metric, entity, range)
    }

    fn latest(
        &self,
        metric: MetricField,
        entity: Option<i64>,
        range: DateRange,
    ) -> Result<Option<MetricPoint>, SourceError> {
        (**self).latest(metric, entity, range)
    }

    fn rows_violating(
        &self,
        metric: MetricField,
        bound: &ThresholdBound,
        range: DateRange,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, SourceError> {
        (**self).rows_violating(metric, bound, range, limit)
    }
}

impl<T: FindingsSink + ?Sized> FindingsSink for &T {
    fn create_many(&self, findings: &[Finding]) -> Result<(), SourceError> {
        (**self).create_many(findings)
    }

    fn active_keys(&self) -> Result<HashSet<FindingKey>, SourceError> {
        (**self).active_keys()
    }
}

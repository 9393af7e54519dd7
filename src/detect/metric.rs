//! Metric rows and the registry of inspectable metric fields.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::detect::DetectError;

/// One observed data point: the metrics of one entity for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub entity_id: i64,
    pub period: NaiveDate,
    #[serde(default)]
    pub impressions: i64,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub ctr: f64,
    #[serde(default)]
    pub conversions: i64,
    #[serde(default)]
    pub spend: f64,
    #[serde(default)]
    pub viewability_rate: f64,
}

impl MetricRow {
    /// A row with every metric zeroed.
    pub fn empty(entity_id: i64, period: NaiveDate) -> Self {
        Self {
            entity_id,
            period,
            impressions: 0,
            clicks: 0,
            ctr: 0.0,
            conversions: 0,
            spend: 0.0,
            viewability_rate: 0.0,
        }
    }

    /// Set a single metric, converting to the column's native type.
    pub fn with(mut self, field: MetricField, value: f64) -> Self {
        match field {
            MetricField::Impressions => self.impressions = value as i64,
            MetricField::Clicks => self.clicks = value as i64,
            MetricField::Ctr => self.ctr = value,
            MetricField::Conversions => self.conversions = value as i64,
            MetricField::Spend => self.spend = value,
            MetricField::ViewabilityRate => self.viewability_rate = value,
        }
        self
    }
}

/// A single metric value pulled out of a row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub entity_id: i64,
    pub value: f64,
    pub period: NaiveDate,
}

/// The numeric fields a rule may inspect.
///
/// Parsing a rule's `metric_name` through [`FromStr`] replaces a dynamic
/// attribute lookup: unknown names are rejected instead of silently
/// matching nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Impressions,
    Clicks,
    Ctr,
    Conversions,
    Spend,
    ViewabilityRate,
}

impl MetricField {
    pub const ALL: [MetricField; 6] = [
        Self::Impressions,
        Self::Clicks,
        Self::Ctr,
        Self::Conversions,
        Self::Spend,
        Self::ViewabilityRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Impressions => "impressions",
            Self::Clicks => "clicks",
            Self::Ctr => "ctr",
            Self::Conversions => "conversions",
            Self::Spend => "spend",
            Self::ViewabilityRate => "viewability_rate",
        }
    }

    /// Column name in the `performance_metrics` table. Never user input.
    pub fn column(&self) -> &'static str {
        self.as_str()
    }

    pub fn value(&self, row: &MetricRow) -> f64 {
        match self {
            Self::Impressions => row.impressions as f64,
            Self::Clicks => row.clicks as f64,
            Self::Ctr => row.ctr,
            Self::Conversions => row.conversions as f64,
            Self::Spend => row.spend,
            Self::ViewabilityRate => row.viewability_rate,
        }
    }

    pub fn point(&self, row: &MetricRow) -> MetricPoint {
        MetricPoint {
            entity_id: row.entity_id,
            value: self.value(row),
            period: row.period,
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MetricField {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| DetectError::UnknownMetric(s.to_string()))
    }
}

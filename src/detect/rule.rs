//! Detection rules and their validation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::metric::MetricField;
use crate::detect::window::MAX_LOOKBACK_DAYS;
use crate::detect::DetectError;

/// The evaluation strategy a rule uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Every row in the window is checked against a fixed bound.
    Threshold,
    /// The latest row is compared with the window average.
    Deviation,
    /// The second half of the window is compared with the first half.
    Trend,
}

impl ConditionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Deviation => "deviation",
            Self::Trend => "trend",
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ConditionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threshold" => Ok(Self::Threshold),
            "deviation" => Ok(Self::Deviation),
            "trend" => Ok(Self::Trend),
            other => Err(format!("unknown condition kind '{other}'")),
        }
    }
}

/// Which way a metric moved relative to what was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Drop,
    Rise,
}

impl Direction {
    pub fn of(change: f64) -> Self {
        if change < 0.0 {
            Self::Drop
        } else {
            Self::Rise
        }
    }
}

/// Fixed bounds of a `threshold` rule. A value is in violation when it
/// falls below `floor` or rises above `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ThresholdBound {
    pub floor: Option<f64>,
    pub ceiling: Option<f64>,
}

impl ThresholdBound {
    pub fn floor(v: f64) -> Self {
        Self { floor: Some(v), ceiling: None }
    }

    pub fn ceiling(v: f64) -> Self {
        Self { floor: None, ceiling: Some(v) }
    }

    /// Decode a single signed threshold: positive values are floors,
    /// zero and negative values are ceilings of their magnitude.
    pub fn from_signed(threshold_value: f64) -> Self {
        if threshold_value > 0.0 {
            Self::floor(threshold_value)
        } else {
            Self::ceiling(threshold_value.abs())
        }
    }

    pub fn violation(&self, value: f64) -> Option<Direction> {
        if self.floor.is_some_and(|f| value < f) {
            return Some(Direction::Drop);
        }
        if self.ceiling.is_some_and(|c| value > c) {
            return Some(Direction::Rise);
        }
        None
    }

    /// The bound that `direction` crossed, reported as the expected value.
    pub fn crossed(&self, direction: Direction) -> Option<f64> {
        match direction {
            Direction::Drop => self.floor,
            Direction::Rise => self.ceiling,
        }
    }
}

/// A configured detection policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub metric_name: String,
    pub condition_kind: ConditionKind,
    pub threshold_value: f64,
    pub floor_value: Option<f64>,
    pub ceiling_value: Option<f64>,
    pub lookback_days: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn metric(&self) -> Result<MetricField, DetectError> {
        self.metric_name.parse()
    }

    /// Bounds used by a `threshold` rule. Explicit `floor_value` /
    /// `ceiling_value` win; otherwise `threshold_value` is decoded by sign.
    pub fn threshold_bound(&self) -> ThresholdBound {
        if self.floor_value.is_some() || self.ceiling_value.is_some() {
            ThresholdBound {
                floor: self.floor_value,
                ceiling: self.ceiling_value,
            }
        } else {
            ThresholdBound::from_signed(self.threshold_value)
        }
    }
}

fn default_lookback() -> u32 {
    7
}

fn default_enabled() -> bool {
    true
}

/// A rule as authored by an operator, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub metric_name: String,
    pub condition_kind: ConditionKind,
    #[serde(default)]
    pub threshold_value: f64,
    #[serde(default)]
    pub floor_value: Option<f64>,
    #[serde(default)]
    pub ceiling_value: Option<f64>,
    #[serde(default = "default_lookback")]
    pub lookback_days: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl NewRule {
    pub fn new(
        name: impl Into<String>,
        metric: MetricField,
        condition_kind: ConditionKind,
        threshold_value: f64,
        lookback_days: u32,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            metric_name: metric.as_str().to_string(),
            condition_kind,
            threshold_value,
            floor_value: None,
            ceiling_value: None,
            lookback_days,
            enabled: true,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_floor(mut self, floor: f64) -> Self {
        self.floor_value = Some(floor);
        self
    }

    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        self.ceiling_value = Some(ceiling);
        self
    }

    /// Reject rules that could never evaluate the way they read.
    pub fn validate(&self) -> Result<MetricField, DetectError> {
        let invalid = |reason: &str| DetectError::InvalidRule {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        let metric: MetricField = self.metric_name.parse()?;

        if self.lookback_days < 1 {
            return Err(invalid("lookback_days must be at least 1"));
        }
        if self.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(invalid("lookback_days is longer than ten years"));
        }
        let values = [Some(self.threshold_value), self.floor_value, self.ceiling_value];
        if values.into_iter().flatten().any(|v| !v.is_finite()) {
            return Err(invalid("threshold values must be finite"));
        }

        let explicit = self.floor_value.is_some() || self.ceiling_value.is_some();
        match self.condition_kind {
            ConditionKind::Threshold => {
                if let (Some(floor), Some(ceiling)) = (self.floor_value, self.ceiling_value) {
                    if floor > ceiling {
                        return Err(invalid("floor_value is above ceiling_value"));
                    }
                }
            }
            ConditionKind::Deviation | ConditionKind::Trend if explicit => {
                return Err(invalid("floor/ceiling only apply to threshold rules"));
            }
            ConditionKind::Trend if self.threshold_value == 0.0 => {
                return Err(invalid("trend threshold must be non-zero"));
            }
            ConditionKind::Deviation | ConditionKind::Trend => {}
        }

        Ok(metric)
    }

    pub fn into_rule(self, id: i64, created_at: DateTime<Utc>) -> Rule {
        Rule {
            id,
            name: self.name,
            description: self.description,
            metric_name: self.metric_name,
            condition_kind: self.condition_kind,
            threshold_value: self.threshold_value,
            floor_value: self.floor_value,
            ceiling_value: self.ceiling_value,
            lookback_days: self.lookback_days,
            enabled: self.enabled,
            created_at,
        }
    }
}

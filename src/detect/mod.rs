//! Rule-based anomaly detection over daily metrics.
//!
//! Rules are evaluated against a [`source::MetricsSource`] by the
//! [`engine::DetectionEngine`], which hands every violation to a
//! [`source::FindingsSink`] as a [`Finding`].

pub mod engine;
pub mod finding;
pub mod memory;
pub mod metric;
pub mod profiles;
pub mod rule;
pub mod source;
pub mod window;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use self::source::SourceError;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("invalid rule '{name}': {reason}")]
    InvalidRule { name: String, reason: String },

    #[error("cannot {action} a finding in status {from}")]
    InvalidTransition { from: FindingStatus, action: FindingAction },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Ordinal importance of a finding: `low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown severity '{s}'"))
    }
}

/// Categorical label of a finding, derived from the rule's metric and the
/// direction of the violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    PerformanceDrop,
    BudgetOverrun,
    CtrAnomaly,
    ImpressionSpike,
    ViewabilityDrop,
    ConversionDecline,
    InventoryUnderutilization,
    MetricSpike,
}

impl FindingKind {
    pub const ALL: [FindingKind; 8] = [
        Self::PerformanceDrop,
        Self::BudgetOverrun,
        Self::CtrAnomaly,
        Self::ImpressionSpike,
        Self::ViewabilityDrop,
        Self::ConversionDecline,
        Self::InventoryUnderutilization,
        Self::MetricSpike,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerformanceDrop => "performance_drop",
            Self::BudgetOverrun => "budget_overrun",
            Self::CtrAnomaly => "ctr_anomaly",
            Self::ImpressionSpike => "impression_spike",
            Self::ViewabilityDrop => "viewability_drop",
            Self::ConversionDecline => "conversion_decline",
            Self::InventoryUnderutilization => "inventory_underutilization",
            Self::MetricSpike => "metric_spike",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FindingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown finding kind '{s}'"))
    }
}

/// Lifecycle state of a finding.
///
/// The engine only ever creates findings in [`FindingStatus::New`]; every
/// other transition is an operator action applied through
/// [`FindingStatus::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    New,
    Acknowledged,
    Investigating,
    Resolved,
    Dismissed,
}

impl FindingStatus {
    pub const ALL: [FindingStatus; 5] = [
        Self::New,
        Self::Acknowledged,
        Self::Investigating,
        Self::Resolved,
        Self::Dismissed,
    ];

    /// Statuses that still need operator attention.
    pub const ACTIVE: [FindingStatus; 3] = [Self::New, Self::Acknowledged, Self::Investigating];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Acknowledged => "acknowledged",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Dismissed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn apply(self, action: FindingAction) -> Result<FindingStatus, DetectError> {
        use FindingAction as A;
        use FindingStatus as S;

        let next = match (self, action) {
            (S::New, A::Acknowledge) => S::Acknowledged,
            (S::Acknowledged, A::Investigate) => S::Investigating,
            (S::Acknowledged | S::Investigating, A::Resolve) => S::Resolved,
            (from, A::Dismiss) if !from.is_terminal() => S::Dismissed,
            (from, action) => return Err(DetectError::InvalidTransition { from, action }),
        };
        Ok(next)
    }
}

impl fmt::Display for FindingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FindingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("unknown finding status '{s}'"))
    }
}

/// Operator actions on a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingAction {
    Acknowledge,
    Investigate,
    Resolve,
    Dismiss,
}

impl fmt::Display for FindingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Acknowledge => "acknowledge",
            Self::Investigate => "investigate",
            Self::Resolve => "resolve",
            Self::Dismiss => "dismiss",
        })
    }
}

/// An emitted anomaly with its numeric evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    /// `None` for cross-entity findings (trend rules).
    pub entity_id: Option<i64>,
    pub rule_id: i64,
    pub kind: FindingKind,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub metric_name: String,
    pub expected_value: f64,
    pub actual_value: f64,
    pub deviation_pct: f64,
    pub suggested_actions: Vec<String>,
    pub status: FindingStatus,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_is_ordered() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_status_happy_path() {
        let s = FindingStatus::New;
        let s = s.apply(FindingAction::Acknowledge).unwrap();
        assert_eq!(s, FindingStatus::Acknowledged);
        let s = s.apply(FindingAction::Investigate).unwrap();
        assert_eq!(s, FindingStatus::Investigating);
        let s = s.apply(FindingAction::Resolve).unwrap();
        assert_eq!(s, FindingStatus::Resolved);
        assert!(s.is_terminal());
    }

    #[test]
    fn test_dismiss_from_any_open_state() {
        for from in FindingStatus::ACTIVE {
            assert_eq!(
                from.apply(FindingAction::Dismiss).unwrap(),
                FindingStatus::Dismissed
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for from in [FindingStatus::Resolved, FindingStatus::Dismissed] {
            for action in [
                FindingAction::Acknowledge,
                FindingAction::Investigate,
                FindingAction::Resolve,
                FindingAction::Dismiss,
            ] {
                assert!(matches!(
                    from.apply(action),
                    Err(DetectError::InvalidTransition { .. })
                ));
            }
        }
    }

    #[test]
    fn test_new_cannot_be_resolved_directly() {
        assert!(FindingStatus::New.apply(FindingAction::Resolve).is_err());
        assert!(FindingStatus::New.apply(FindingAction::Investigate).is_err());
    }

    #[test]
    fn test_string_round_trip() {
        assert_eq!("high".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!(
            "viewability_drop".parse::<FindingKind>().unwrap(),
            FindingKind::ViewabilityDrop
        );
        assert_eq!(
            "investigating".parse::<FindingStatus>().unwrap(),
            FindingStatus::Investigating
        );
        assert!("bogus".parse::<Severity>().is_err());
    }
}

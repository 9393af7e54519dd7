//! Turning rule violations into findings: classification, severity,
//! templated text and suggested actions.

use chrono::Utc;
use uuid::Uuid;

use crate::detect::metric::{MetricField, MetricPoint};
use crate::detect::rule::{ConditionKind, Direction, Rule};
use crate::detect::window::round2;
use crate::detect::{Finding, FindingKind, FindingStatus, Severity};

/// Deviations strictly above this magnitude (percent) are `high`.
pub const HIGH_DEVIATION_PCT: f64 = 50.0;

pub fn classify(metric: MetricField, condition: ConditionKind, direction: Direction) -> FindingKind {
    use MetricField as M;

    match (direction, metric) {
        (Direction::Drop, M::ViewabilityRate) => FindingKind::ViewabilityDrop,
        (Direction::Drop, M::Conversions) => FindingKind::ConversionDecline,
        (Direction::Drop, M::Ctr) => FindingKind::CtrAnomaly,
        (Direction::Drop, M::Impressions) if condition == ConditionKind::Threshold => {
            FindingKind::InventoryUnderutilization
        }
        (Direction::Drop, _) => FindingKind::PerformanceDrop,
        (Direction::Rise, M::Spend) => FindingKind::BudgetOverrun,
        (Direction::Rise, M::Impressions) => FindingKind::ImpressionSpike,
        (Direction::Rise, M::Ctr | M::Clicks) => FindingKind::CtrAnomaly,
        (Direction::Rise, _) => FindingKind::MetricSpike,
    }
}

pub fn deviation_severity(deviation_pct: f64) -> Severity {
    if deviation_pct.abs() > HIGH_DEVIATION_PCT {
        Severity::High
    } else {
        Severity::Medium
    }
}

pub fn suggested_actions(kind: FindingKind) -> &'static [&'static str] {
    match kind {
        FindingKind::PerformanceDrop => &[
            "Review placement performance.",
            "Check for technical issues.",
            "Compare with previous periods.",
        ],
        FindingKind::BudgetOverrun => &[
            "Review pacing and daily caps.",
            "Confirm booked rates with the media owner.",
        ],
        FindingKind::CtrAnomaly => &[
            "Check traffic sources for invalid clicks.",
            "Compare creative variants.",
        ],
        FindingKind::ImpressionSpike => &[
            "Verify ad server delivery logs.",
            "Check for duplicate tracking.",
        ],
        FindingKind::ViewabilityDrop => &[
            "Review placement position and format.",
            "Check page layout changes on the publisher side.",
        ],
        FindingKind::ConversionDecline => &[
            "Review campaign strategy.",
            "Adjust targeting or creative.",
        ],
        FindingKind::InventoryUnderutilization => &[
            "Check inventory availability and status.",
            "Rebalance placements across inventory.",
        ],
        FindingKind::MetricSpike => &[
            "Investigate root cause.",
            "Compare with previous periods.",
        ],
    }
}

struct Evidence {
    entity_id: Option<i64>,
    expected: f64,
    actual: f64,
    deviation_pct: f64,
}

fn build(
    rule: &Rule,
    metric: MetricField,
    kind: FindingKind,
    severity: Severity,
    title: String,
    description: String,
    evidence: Evidence,
) -> Finding {
    Finding {
        id: Uuid::new_v4(),
        entity_id: evidence.entity_id,
        rule_id: rule.id,
        kind,
        severity,
        title,
        description,
        metric_name: metric.as_str().to_string(),
        expected_value: evidence.expected,
        actual_value: evidence.actual,
        deviation_pct: evidence.deviation_pct,
        suggested_actions: suggested_actions(kind).iter().map(|s| s.to_string()).collect(),
        status: FindingStatus::New,
        detected_at: Utc::now(),
        resolved_at: None,
        resolved_by: None,
    }
}

/// One row breached a fixed bound.
pub fn threshold(
    rule: &Rule,
    metric: MetricField,
    point: &MetricPoint,
    bound: f64,
    direction: Direction,
) -> Finding {
    let kind = classify(metric, ConditionKind::Threshold, direction);
    let side = match direction {
        Direction::Drop => "floor",
        Direction::Rise => "ceiling",
    };
    build(
        rule,
        metric,
        kind,
        Severity::Medium,
        format!("{} triggered on entity {}", rule.name, point.entity_id),
        format!(
            "Metric '{}' = {} on {} breached {} {}.",
            metric, point.value, point.period, side, bound
        ),
        Evidence {
            entity_id: Some(point.entity_id),
            expected: bound,
            actual: point.value,
            deviation_pct: 0.0,
        },
    )
}

/// The latest row strayed from the window average.
pub fn deviation(
    rule: &Rule,
    metric: MetricField,
    latest: &MetricPoint,
    average: f64,
    deviation_pct: f64,
    lookback_days: u32,
) -> Finding {
    let kind = classify(metric, ConditionKind::Deviation, Direction::of(deviation_pct));
    build(
        rule,
        metric,
        kind,
        deviation_severity(deviation_pct),
        format!("{}: {:+.1}% deviation", rule.name, deviation_pct),
        format!(
            "Metric '{}' deviated {:+.1}% from the {}-day average ({:.2} -> {:.2}).",
            metric, deviation_pct, lookback_days, average, latest.value
        ),
        Evidence {
            entity_id: Some(latest.entity_id),
            expected: round2(average),
            actual: latest.value,
            deviation_pct: round2(deviation_pct),
        },
    )
}

/// The second half of the window moved away from the first half.
pub fn trend(
    rule: &Rule,
    metric: MetricField,
    first_half: f64,
    second_half: f64,
    change_pct: f64,
    lookback_days: u32,
) -> Finding {
    let kind = classify(metric, ConditionKind::Trend, Direction::of(change_pct));
    build(
        rule,
        metric,
        kind,
        Severity::High,
        format!("{}: {:+.1}% trend", rule.name, change_pct),
        format!(
            "Metric '{}' shows a {:+.1}% trend over {} days ({:.2} -> {:.2}).",
            metric, change_pct, lookback_days, first_half, second_half
        ),
        Evidence {
            entity_id: None,
            expected: round2(first_half),
            actual: round2(second_half),
            deviation_pct: round2(change_pct),
        },
    )
}

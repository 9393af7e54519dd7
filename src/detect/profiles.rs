//! Default out-of-box detection rules.

use crate::detect::metric::MetricField;
use crate::detect::rule::{ConditionKind, NewRule};

/// Return the default rule set.
pub fn defaults() -> Vec<NewRule> {
    use ConditionKind::{Deviation, Threshold, Trend};
    use MetricField::{Conversions, Ctr, Impressions, Spend, ViewabilityRate};

    vec![
        NewRule::new("CTR Drop Alert", Ctr, Deviation, -30.0, 7)
            .describe("Fires when CTR deviates more than 30% from the 7-day average."),
        NewRule::new("Impression Spike", Impressions, Deviation, 50.0, 3)
            .describe("Fires when impressions move more than 50% away from the 3-day average."),
        NewRule::new("Budget Overrun Warning", Spend, Threshold, 0.0, 1)
            .with_ceiling(110.0)
            .describe("Fires when daily spend exceeds 110."),
        NewRule::new("Viewability Floor", ViewabilityRate, Threshold, 50.0, 1)
            .with_floor(50.0)
            .describe("Fires when viewability drops below 50%."),
        NewRule::new("Conversion Decline", Conversions, Trend, -25.0, 14)
            .describe("Fires when conversions trend downward by 25% or more over 14 days."),
        NewRule::new("Performance Drop (Composite)", Spend, Deviation, -40.0, 7)
            .describe("Fires when spend deviates more than 40% from the weekly average."),
        NewRule::new("Inventory Under-Utilization", Impressions, Threshold, 20.0, 7)
            .with_floor(20.0)
            .describe("Fires when a placement delivers fewer than 20 impressions in a day."),
        NewRule::new("High CPM Alert", Spend, Threshold, 0.0, 3)
            .with_ceiling(150.0)
            .describe("Fires when daily spend exceeds 150."),
        NewRule::new("Click Fraud Indicator", Ctr, Deviation, 200.0, 1)
            .describe("Fires when CTR moves more than 200% away from the daily norm."),
        NewRule::new("Weekend Dip Monitor", Impressions, Trend, -50.0, 2)
            .describe("Fires when impressions drop 50% or more between the halves of a 2-day window."),
    ]
}

//! Serialized detection runs and the cron loop that triggers them.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use cron::Schedule;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::detect::engine::{DetectOptions, DetectionEngine};
use crate::detect::source::SourceError;
use crate::detect::{DetectError, Finding};
use crate::storage::SqliteStore;

/// Runs detection against the store, one run at a time.
///
/// Clones share the same lock, so runs triggered over HTTP and by the
/// schedule never overlap.
#[derive(Clone)]
pub struct DetectionRunner {
    store: SqliteStore,
    options: DetectOptions,
    run_lock: Arc<Mutex<()>>,
}

impl DetectionRunner {
    pub fn new(store: SqliteStore, options: DetectOptions) -> Self {
        Self {
            store,
            options,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Run detection on a blocking thread while holding the run lock.
    pub async fn run(
        &self,
        effective_date: NaiveDate,
        lookback_override: Option<u32>,
    ) -> Result<Vec<Finding>, DetectError> {
        let _guard = self.run_lock.lock().await;

        let store = self.store.clone();
        let options = self.options.clone();
        tokio::task::spawn_blocking(move || {
            DetectionEngine::new(&store, &store, &store)
                .with_options(options)
                .run_detection(effective_date, lookback_override)
        })
        .await
        .map_err(|e| DetectError::Source(SourceError::Unavailable(format!("detection task failed: {e}"))))?
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr).with_context(|| format!("invalid cron expression '{expr}'"))
}

/// The next `count` fire times strictly after `after`.
pub fn next_fire_times(schedule: &Schedule, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
    schedule.after(&after).take(count).collect()
}

/// Sleep until each fire time and run detection as of that UTC day.
/// Failures are logged and the loop keeps going.
pub async fn run_schedule_loop(runner: DetectionRunner, schedule: Schedule) {
    info!("Detection scheduler started");

    loop {
        let Some(next) = next_fire_times(&schedule, Utc::now(), 1).pop() else {
            warn!("Schedule has no upcoming fire times, stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        info!(next = %next.to_rfc3339(), "Next scheduled detection run");
        tokio::time::sleep(wait).await;

        let today = Utc::now().date_naive();
        match runner.run(today, None).await {
            Ok(findings) => info!(%today, findings = findings.len(), "Scheduled detection finished"),
            Err(e) => error!(%today, error = %e, "Scheduled detection failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::metric::{MetricField, MetricRow};
    use crate::detect::rule::{ConditionKind, NewRule};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_fire_times_daily() {
        let schedule = parse_schedule("0 0 6 * * *").unwrap();
        let next = next_fire_times(&schedule, at("2024-07-10T07:00:00Z"), 2);
        assert_eq!(next, vec![at("2024-07-11T06:00:00Z"), at("2024-07-12T06:00:00Z")]);
    }

    #[test]
    fn test_parse_schedule_rejects_garbage() {
        assert!(parse_schedule("whenever").is_err());
    }

    #[tokio::test]
    async fn test_runner_persists_findings() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_rule(
                NewRule::new("Budget", MetricField::Spend, ConditionKind::Threshold, 0.0, 1)
                    .with_ceiling(100.0),
            )
            .unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 7, 10).unwrap();
        store
            .insert_metrics(&[MetricRow::empty(7, day).with(MetricField::Spend, 180.0)])
            .unwrap();

        let runner = DetectionRunner::new(store.clone(), DetectOptions::default());
        let other = runner.clone();
        let (a, b) = tokio::join!(runner.run(day, None), other.run(day, None));

        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(store.list_findings(&Default::default()).unwrap().len(), 2);
    }
}

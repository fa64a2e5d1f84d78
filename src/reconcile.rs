use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{RunConfig, RunConfigStore};
use crate::domain::{Cycle, LeadInterval, format_interval_list};
use crate::error::StageError;

pub const DEFAULT_MAX_HORIZON_HOURS: u32 = 384;
pub const DEFAULT_STEP_HOURS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonPolicy {
    pub max_horizon_hours: u32,
    pub trim_steps: u32,
}

impl Default for HorizonPolicy {
    fn default() -> Self {
        Self {
            max_horizon_hours: DEFAULT_MAX_HORIZON_HOURS,
            trim_steps: 1,
        }
    }
}

impl HorizonPolicy {
    pub fn horizon_hours(&self, forecast_days: Option<f64>, step: u32) -> u32 {
        let step = step.max(1);
        let requested = match forecast_days {
            Some(days) if days.is_finite() && days > 0.0 => {
                let hours = (days * 24.0).round();
                if hours >= f64::from(self.max_horizon_hours) {
                    self.max_horizon_hours
                } else {
                    hours as u32
                }
            }
            _ => self.max_horizon_hours,
        };
        let capped = requested.min(self.max_horizon_hours);
        capped - capped % step
    }

    pub fn trimmed_end_hour(&self, horizon_hours: u32, step: u32) -> u32 {
        horizon_hours.saturating_sub(step.saturating_mul(self.trim_steps))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub cycle: Cycle,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub run_hours: u32,
    pub intervals: Vec<LeadInterval>,
}

impl TimeRange {
    pub fn for_cycle(
        cycle: Cycle,
        policy: &HorizonPolicy,
        forecast_days: Option<f64>,
        step: u32,
    ) -> Result<Self, StageError> {
        let horizon = policy.horizon_hours(forecast_days, step);
        let end_hour = policy.trimmed_end_hour(horizon, step);
        let interval = LeadInterval::new(0, step, end_hour)?;
        let start = cycle.time();
        Ok(Self {
            cycle,
            start,
            end: start + Duration::hours(i64::from(end_hour)),
            run_hours: end_hour,
            intervals: vec![interval],
        })
    }
}

pub struct ConfigReconciler<'a> {
    store: &'a RunConfigStore,
    policy: HorizonPolicy,
}

impl<'a> ConfigReconciler<'a> {
    pub fn new(store: &'a RunConfigStore, policy: HorizonPolicy) -> Self {
        Self { store, policy }
    }

    pub fn record_candidate(&self, config: &mut RunConfig, cycle: Cycle) -> Result<(), StageError> {
        config.cycle = Some(cycle);
        self.store.persist_entries(&[("CYCLE", cycle.id())])
    }

    pub fn reconcile(&self, config: &mut RunConfig, cycle: Cycle) -> Result<TimeRange, StageError> {
        let range = self.plan(config, cycle)?;
        apply(config, &range);

        let mut entries = vec![
            ("CYCLE", cycle.id()),
            ("INTERVALS", format_interval_list(&range.intervals)),
        ];
        entries.extend(config.time_entries());
        self.store.persist_entries(&entries)?;

        info!(
            %cycle,
            start = %range.start,
            end = %range.end,
            run_hours = range.run_hours,
            "run config reconciled"
        );
        Ok(range)
    }

    pub fn plan(&self, config: &RunConfig, cycle: Cycle) -> Result<TimeRange, StageError> {
        TimeRange::for_cycle(cycle, &self.policy, config.forecast_days, step_hours(config))
    }
}

pub fn apply(config: &mut RunConfig, range: &TimeRange) {
    config.cycle = Some(range.cycle);
    config.start = Some(range.start);
    config.end = Some(range.end);
    config.intervals = range.intervals.clone();
}

pub fn step_hours(config: &RunConfig) -> u32 {
    config
        .intervals
        .first()
        .map(|interval| interval.step)
        .unwrap_or(DEFAULT_STEP_HOURS)
}

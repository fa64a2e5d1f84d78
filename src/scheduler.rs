use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::audit::{OutcomeStatus, RetrievalOutcome};
use crate::domain::{Bounds, Cycle, LeadInterval, Resolution};
use crate::error::StageError;
use crate::gfs::{Endpoint, ForecastFile, GfsClient};
use crate::retriever::{FileRetriever, RetrievalTask};
use crate::store::Store;
use crate::validator::StructuralValidator;

pub const DEFAULT_MAX_PARALLEL: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub cycle: Cycle,
    pub area: String,
    pub resolution: Resolution,
    pub bounds: Option<Bounds>,
    pub intervals: Vec<LeadInterval>,
}

impl RunPlan {
    pub fn lead_hours(&self) -> Vec<u32> {
        self.expand().into_iter().map(|(_, hour)| hour).collect()
    }

    pub fn tasks(&self, store: &Store, endpoint: &Endpoint) -> Vec<RetrievalTask> {
        self.expand()
            .into_iter()
            .map(|(interval, lead_hour)| {
                let file = ForecastFile::new(self.cycle, lead_hour, self.resolution);
                RetrievalTask {
                    cycle: self.cycle,
                    lead_hour,
                    resolution: self.resolution,
                    area: self.area.clone(),
                    bounds: self.bounds,
                    interval,
                    destination: store.file_path(&self.area, &file),
                    url: endpoint.filter_url(&file, self.bounds.as_ref()),
                }
            })
            .collect()
    }

    fn expand(&self) -> Vec<(LeadInterval, u32)> {
        let mut seen = HashSet::new();
        let mut hours = Vec::new();
        for interval in &self.intervals {
            for hour in interval.hours() {
                if seen.insert(hour) {
                    hours.push((*interval, hour));
                }
            }
        }
        hours
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub max_parallel: usize,
    pub dry_run: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            dry_run: false,
        }
    }
}

#[derive(Debug)]
pub struct BatchReport {
    pub submitted: usize,
    pub outcomes: Vec<RetrievalOutcome>,
    pub failures: Vec<StageError>,
    pub planned: Vec<u32>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub cached: usize,
    pub ok: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.outcomes.iter().map(|outcome| outcome.size_bytes).sum()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for outcome in &self.outcomes {
            match outcome.status {
                OutcomeStatus::Cached => counts.cached += 1,
                OutcomeStatus::Ok => counts.ok += 1,
                OutcomeStatus::Fail => counts.failed += 1,
            }
        }
        counts
    }
}

pub struct Scheduler<'a, C: GfsClient, V: StructuralValidator> {
    retriever: FileRetriever<'a, C, V>,
    options: SchedulerOptions,
}

impl<'a, C: GfsClient, V: StructuralValidator> Scheduler<'a, C, V> {
    pub fn new(retriever: FileRetriever<'a, C, V>, options: SchedulerOptions) -> Self {
        Self { retriever, options }
    }

    pub fn run(&self, tasks: &[RetrievalTask]) -> BatchReport {
        let started = Instant::now();
        if self.options.dry_run {
            let planned: Vec<u32> = tasks.iter().map(|task| task.lead_hour).collect();
            info!(tasks = planned.len(), "dry run, nothing dispatched");
            return BatchReport {
                submitted: 0,
                outcomes: Vec::new(),
                failures: Vec::new(),
                planned,
                elapsed: started.elapsed(),
            };
        }

        let ceiling = self.options.max_parallel.max(1);
        let mut submitted = 0;
        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut failures = Vec::new();

        // A batch is joined in full before the next one is dispatched.
        for batch in tasks.chunks(ceiling) {
            let results = thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|task| {
                        submitted += 1;
                        debug!(submission = submitted, lead_hour = task.lead_hour, "dispatch");
                        (task.lead_hour, scope.spawn(move || self.retriever.retrieve(task)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(lead_hour, handle)| {
                        handle
                            .join()
                            .map_err(|_| StageError::WorkerPanicked { lead_hour })
                    })
                    .collect::<Vec<_>>()
            });

            for result in results {
                match result {
                    Ok(outcome) => {
                        if let Err(err) = outcome.clone().into_result() {
                            failures.push(err);
                        }
                        outcomes.push(outcome);
                    }
                    Err(err) => failures.push(err),
                }
            }
        }

        outcomes.sort_by_key(|outcome| outcome.lead_hour);
        let report = BatchReport {
            submitted,
            outcomes,
            failures,
            planned: Vec::new(),
            elapsed: started.elapsed(),
        };
        let counts = report.counts();
        info!(
            submitted,
            cached = counts.cached,
            ok = counts.ok,
            failed = report.failures.len(),
            "all tasks finished"
        );
        report
    }
}

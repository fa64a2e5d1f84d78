use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, AuditRecord, OutcomeStatus, RetrievalOutcome};
use crate::domain::{Bounds, Cycle, LeadInterval, Resolution};
use crate::error::StageError;
use crate::gfs::GfsClient;
use crate::store::Store;
use crate::validator::{StructuralValidator, Validation};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub budget: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_RETRY_INTERVAL,
            budget: None,
        }
    }
}

impl RetryPolicy {
    fn may_retry(&self, attempt: u32, started: Instant) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match self.budget {
            Some(budget) => started.elapsed() + self.interval <= budget,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalTask {
    pub cycle: Cycle,
    pub lead_hour: u32,
    pub resolution: Resolution,
    pub area: String,
    pub bounds: Option<Bounds>,
    pub interval: LeadInterval,
    pub destination: Utf8PathBuf,
    pub url: String,
}

impl RetrievalTask {
    fn partial_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.part", self.destination))
    }
}

impl RetrievalOutcome {
    pub fn into_result(self) -> Result<Self, StageError> {
        match self.status {
            OutcomeStatus::Fail => Err(StageError::TaskRetryExhausted {
                lead_hour: self.lead_hour,
                attempts: self.attempts,
                url: self.url,
            }),
            _ => Ok(self),
        }
    }
}

pub struct FileRetriever<'a, C: GfsClient, V: StructuralValidator> {
    client: &'a C,
    validator: &'a V,
    audit: &'a AuditLog,
    policy: RetryPolicy,
}

impl<'a, C: GfsClient, V: StructuralValidator> FileRetriever<'a, C, V> {
    pub fn new(client: &'a C, validator: &'a V, audit: &'a AuditLog, policy: RetryPolicy) -> Self {
        Self {
            client,
            validator,
            audit,
            policy,
        }
    }

    pub fn retrieve(&self, task: &RetrievalTask) -> RetrievalOutcome {
        let started = Instant::now();
        let outcome = match self.cached(task) {
            Some(validation) => {
                debug!(lead_hour = task.lead_hour, path = %task.destination, "cache hit");
                self.outcome(task, OutcomeStatus::Cached, validation, 0, started)
            }
            None => self.fetch(task, started),
        };
        self.record(task, &outcome);
        outcome
    }

    fn cached(&self, task: &RetrievalTask) -> Option<Validation> {
        if !task.destination.as_std_path().is_file() {
            return None;
        }
        let validation = self.validator.validate(task.destination.as_std_path());
        if validation.valid {
            Some(validation)
        } else {
            warn!(
                lead_hour = task.lead_hour,
                path = %task.destination,
                "staged file failed validation, fetching again"
            );
            None
        }
    }

    fn fetch(&self, task: &RetrievalTask, started: Instant) -> RetrievalOutcome {
        let partial = task.partial_path();
        if let Some(parent) = task.destination.parent()
            && let Err(err) = Store::ensure_dir(parent)
        {
            warn!(lead_hour = task.lead_hour, error = %err, "cannot create run directory");
            return self.outcome(task, OutcomeStatus::Fail, Validation::invalid(), 1, started);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(task, &partial) {
                Ok(validation) => {
                    info!(
                        lead_hour = task.lead_hour,
                        attempt,
                        records = validation.records,
                        "retrieved"
                    );
                    return self.outcome(task, OutcomeStatus::Ok, validation, attempt, started);
                }
                Err(err) => {
                    remove_quietly(&partial);
                    if !self.policy.may_retry(attempt, started) {
                        warn!(lead_hour = task.lead_hour, attempt, error = %err, url = %task.url, "giving up");
                        return self.outcome(
                            task,
                            OutcomeStatus::Fail,
                            Validation::invalid(),
                            attempt,
                            started,
                        );
                    }
                    debug!(lead_hour = task.lead_hour, attempt, error = %err, "attempt failed, retrying");
                    if !self.policy.interval.is_zero() {
                        thread::sleep(self.policy.interval);
                    }
                }
            }
        }
    }

    fn attempt(&self, task: &RetrievalTask, partial: &Utf8Path) -> Result<Validation, StageError> {
        self.client.download(&task.url, partial.as_std_path())?;
        let validation = self.validator.validate(partial.as_std_path());
        if !validation.valid {
            return Err(StageError::ValidationFailed(task.destination.to_string()));
        }
        fs::rename(partial.as_std_path(), task.destination.as_std_path())
            .map_err(|err| StageError::Filesystem(format!("rename to {}: {err}", task.destination)))?;
        Ok(validation)
    }

    fn outcome(
        &self,
        task: &RetrievalTask,
        status: OutcomeStatus,
        validation: Validation,
        attempts: u32,
        started: Instant,
    ) -> RetrievalOutcome {
        let size_bytes = match status {
            OutcomeStatus::Fail => 0,
            _ => fs::metadata(task.destination.as_std_path())
                .map(|meta| meta.len())
                .unwrap_or(0),
        };
        RetrievalOutcome {
            lead_hour: task.lead_hour,
            status,
            size_bytes,
            records: validation.records,
            elapsed: started.elapsed(),
            attempts,
            url: task.url.clone(),
            destination: task.destination.clone(),
        }
    }

    fn record(&self, task: &RetrievalTask, outcome: &RetrievalOutcome) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            cycle: task.cycle,
            area: &task.area,
            resolution: task.resolution,
            bounds: task.bounds,
            interval: task.interval,
            outcome,
        };
        if let Err(err) = self.audit.append(&record) {
            warn!(lead_hour = task.lead_hour, error = %err, "audit append failed");
        }
    }
}

fn remove_quietly(path: &Utf8Path) {
    if let Err(err) = fs::remove_file(path.as_std_path())
        && err.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path, error = %err, "could not remove partial download");
    }
}

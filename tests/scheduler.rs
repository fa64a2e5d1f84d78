use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use gfs_stage::audit::{AuditLog, OutcomeStatus};
use gfs_stage::domain::{LeadInterval, Resolution};
use gfs_stage::error::StageError;
use gfs_stage::gfs::{Endpoint, GfsClient};
use gfs_stage::retriever::{FileRetriever, RetrievalTask, RetryPolicy};
use gfs_stage::scheduler::{RunPlan, Scheduler, SchedulerOptions};
use gfs_stage::store::Store;
use gfs_stage::validator::{StructuralValidator, Validation, ValidatorStatus};

/// Instrumented transport: tracks how many downloads are in flight.
#[derive(Default)]
struct FakeUpstream {
    failing_lead: Option<u32>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    downloads: AtomicUsize,
}

impl GfsClient for FakeUpstream {
    fn probe(&self, _url: &str) -> Result<bool, StageError> {
        Ok(true)
    }

    fn download(&self, url: &str, destination: &Path) -> Result<u64, StageError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let broken = self
            .failing_lead
            .is_some_and(|lead| url.contains(&format!(".f{lead:03}&")));
        let payload: &[u8] = if broken { b"" } else { b"GRIB....7777" };
        fs::write(destination, payload).unwrap();
        Ok(payload.len() as u64)
    }
}

struct SizeValidator;

impl StructuralValidator for SizeValidator {
    fn validate(&self, path: &Path) -> Validation {
        let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        Validation {
            valid: size > 0,
            records: u64::from(size > 0),
        }
    }

    fn status(&self) -> ValidatorStatus {
        ValidatorStatus::Ready {
            tool: "size".to_string(),
        }
    }
}

fn immediate(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        interval: Duration::ZERO,
        budget: None,
    }
}

fn tasks(root: &Utf8PathBuf, interval: LeadInterval) -> (Store, Vec<RetrievalTask>) {
    let store = Store::new(root.clone());
    let plan = RunPlan {
        cycle: "2025073018".parse().unwrap(),
        area: "case".to_string(),
        resolution: Resolution::Fine,
        bounds: None,
        intervals: vec![interval],
    };
    let tasks = plan.tasks(&store, &Endpoint::default());
    (store, tasks)
}

fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

#[test]
fn concurrency_never_exceeds_ceiling() {
    let (_temp, root) = temp_root();
    let (store, tasks) = tasks(&root, LeadInterval::new(0, 1, 99).unwrap());
    assert_eq!(tasks.len(), 100);

    let client = FakeUpstream {
        delay: Duration::from_millis(5),
        ..FakeUpstream::default()
    };
    let audit = AuditLog::new(store.audit_log_path("case"));
    let retriever = FileRetriever::new(&client, &SizeValidator, &audit, immediate(1));
    let options = SchedulerOptions {
        max_parallel: 24,
        dry_run: false,
    };
    let report = Scheduler::new(retriever, options).run(&tasks);

    assert!(report.success());
    assert_eq!(report.submitted, 100);
    assert_eq!(report.counts().ok, 100);
    assert_eq!(client.downloads.load(Ordering::SeqCst), 100);
    assert!(client.peak.load(Ordering::SeqCst) <= 24);

    let log = fs::read_to_string(audit.path().as_std_path()).unwrap();
    assert_eq!(log.lines().count(), 101);
    assert!(log.lines().skip(1).all(|row| row.contains(",OK,")));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Start(u32),
    End(u32),
}

/// Records download start/end order; one lead time is much slower.
struct OrderedUpstream {
    slow_lead: u32,
    events: Mutex<Vec<Event>>,
}

impl OrderedUpstream {
    fn lead_of(url: &str) -> u32 {
        (0..1000)
            .find(|lead| url.contains(&format!(".f{lead:03}&")))
            .unwrap()
    }
}

impl GfsClient for OrderedUpstream {
    fn probe(&self, _url: &str) -> Result<bool, StageError> {
        Ok(true)
    }

    fn download(&self, url: &str, destination: &Path) -> Result<u64, StageError> {
        let lead = Self::lead_of(url);
        self.events.lock().unwrap().push(Event::Start(lead));
        let delay = if lead == self.slow_lead { 300 } else { 2 };
        thread::sleep(Duration::from_millis(delay));
        fs::write(destination, b"GRIB....7777").unwrap();
        self.events.lock().unwrap().push(Event::End(lead));
        Ok(12)
    }
}

#[test]
fn next_batch_waits_for_the_slowest_task() {
    let (_temp, root) = temp_root();
    let (store, tasks) = tasks(&root, LeadInterval::new(0, 1, 47).unwrap());
    assert_eq!(tasks.len(), 48);

    let client = OrderedUpstream {
        slow_lead: 5,
        events: Mutex::new(Vec::new()),
    };
    let audit = AuditLog::new(store.audit_log_path("case"));
    let retriever = FileRetriever::new(&client, &SizeValidator, &audit, immediate(1));
    let options = SchedulerOptions {
        max_parallel: 24,
        dry_run: false,
    };
    let report = Scheduler::new(retriever, options).run(&tasks);
    assert_eq!(report.counts().ok, 48);

    let events = client.events.lock().unwrap();
    assert_eq!(events.len(), 96);
    let slow_end = events
        .iter()
        .position(|event| *event == Event::End(5))
        .unwrap();
    let first_second_batch = events
        .iter()
        .position(|event| matches!(event, Event::Start(lead) if *lead >= 24))
        .unwrap();
    assert!(slow_end < first_second_batch);
    assert!(
        events[..first_second_batch]
            .iter()
            .all(|event| matches!(event, Event::Start(lead) | Event::End(lead) if *lead < 24))
    );
}

#[test]
fn failing_task_does_not_affect_siblings() {
    let (_temp, root) = temp_root();
    let (store, tasks) = tasks(&root, LeadInterval::new(0, 3, 12).unwrap());
    let client = FakeUpstream {
        failing_lead: Some(6),
        ..FakeUpstream::default()
    };
    let audit = AuditLog::new(store.audit_log_path("case"));
    let retriever = FileRetriever::new(&client, &SizeValidator, &audit, immediate(60));
    let report = Scheduler::new(retriever, SchedulerOptions::default()).run(&tasks);

    assert!(!report.success());
    assert_eq!(report.failures.len(), 1);
    assert_matches!(
        &report.failures[0],
        StageError::TaskRetryExhausted {
            lead_hour: 6,
            attempts: 60,
            ..
        }
    );
    let counts = report.counts();
    assert_eq!((counts.ok, counts.failed), (4, 1));
    assert_eq!(client.downloads.load(Ordering::SeqCst), 4 + 60);

    let failed = &report.outcomes[2];
    assert_eq!(failed.lead_hour, 6);
    assert_eq!(failed.status, OutcomeStatus::Fail);
    assert!(!failed.destination.as_std_path().exists());

    let log = fs::read_to_string(audit.path().as_std_path()).unwrap();
    assert_eq!(log.lines().count(), 6);
    assert_eq!(log.matches(",FAIL,").count(), 1);
}

#[test]
fn rerun_is_served_from_cache() {
    let (_temp, root) = temp_root();
    let (store, tasks) = tasks(&root, LeadInterval::new(0, 3, 24).unwrap());
    let audit = AuditLog::new(store.audit_log_path("case"));

    let first = FakeUpstream::default();
    let retriever = FileRetriever::new(&first, &SizeValidator, &audit, immediate(3));
    let report = Scheduler::new(retriever, SchedulerOptions::default()).run(&tasks);
    assert_eq!(report.counts().ok, 9);

    let second = FakeUpstream::default();
    let retriever = FileRetriever::new(&second, &SizeValidator, &audit, immediate(3));
    let report = Scheduler::new(retriever, SchedulerOptions::default()).run(&tasks);
    assert_eq!(second.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(report.counts().cached, 9);
    assert!(
        report
            .outcomes
            .iter()
            .all(|outcome| outcome.status == OutcomeStatus::Cached && outcome.attempts == 0)
    );
}

#[test]
fn dry_run_only_enumerates() {
    let (_temp, root) = temp_root();
    let (store, tasks) = tasks(&root, LeadInterval::new(0, 6, 18).unwrap());
    let client = FakeUpstream::default();
    let audit = AuditLog::new(store.audit_log_path("case"));
    let retriever = FileRetriever::new(&client, &SizeValidator, &audit, immediate(1));
    let options = SchedulerOptions {
        dry_run: true,
        ..SchedulerOptions::default()
    };
    let report = Scheduler::new(retriever, options).run(&tasks);

    assert_eq!(report.planned, vec![0, 6, 12, 18]);
    assert_eq!(report.submitted, 0);
    assert!(report.outcomes.is_empty());
    assert_eq!(client.downloads.load(Ordering::SeqCst), 0);
    assert!(!audit.path().as_std_path().exists());
}

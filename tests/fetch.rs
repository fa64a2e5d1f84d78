use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

use gfs_stage::app::{App, FetchOptions, InitRequest};
use gfs_stage::config::RUN_DATE_FORMAT;
use gfs_stage::domain::{Resolution, ValidHours};
use gfs_stage::error::StageError;
use gfs_stage::gfs::GfsClient;
use gfs_stage::output::JsonOutput;
use gfs_stage::retriever::RetryPolicy;
use gfs_stage::validator::{StructuralValidator, Validation, ValidatorStatus};

/// Upstream where only the listed cycles exist.
struct FakeNomads {
    published: Vec<&'static str>,
}

impl FakeNomads {
    fn is_published(&self, url: &str) -> bool {
        self.published.iter().any(|cycle| {
            let dir = format!("gfs.{}/{}/atmos", &cycle[..8], &cycle[8..]);
            url.contains(&dir) || url.contains(&dir.replace('/', "%2F"))
        })
    }
}

impl GfsClient for FakeNomads {
    fn probe(&self, url: &str) -> Result<bool, StageError> {
        Ok(self.is_published(url))
    }

    fn download(&self, url: &str, destination: &Path) -> Result<u64, StageError> {
        if !self.is_published(url) {
            return Err(StageError::UpstreamStatus {
                status: 404,
                message: "not found".to_string(),
            });
        }
        fs::write(destination, b"GRIB-payload-7777").unwrap();
        Ok(17)
    }
}

struct NonEmpty;

impl StructuralValidator for NonEmpty {
    fn validate(&self, path: &Path) -> Validation {
        let valid = fs::metadata(path).map(|meta| meta.len() > 0).unwrap_or(false);
        Validation {
            valid,
            records: u64::from(valid),
        }
    }

    fn status(&self) -> ValidatorStatus {
        ValidatorStatus::Degraded {
            message: "size only".to_string(),
        }
    }
}

struct Case {
    _temp: tempfile::TempDir,
    config: Utf8PathBuf,
    stage: Utf8PathBuf,
}

fn init_case(app: &App<FakeNomads, NonEmpty>) -> Case {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let config = root.join("gfs.cnf");
    let stage = root.join("stage");
    let request = InitRequest {
        config_path: config.clone(),
        lat: 53.5461,
        lon: -113.4938,
        radius_km: 150.0,
        forecast_days: Some(2.0),
        case_name: "edmonton".to_string(),
        dest_root: Some(stage.clone()),
        start_date: None,
        interval_hours: 3,
        resolution: Resolution::Coarse,
        valid_hours: ValidHours::default(),
        geog_data_path: Some("/data/geog".to_string()),
        cycle: Some("2025073100".parse().unwrap()),
        now: None,
    };
    app.init(request, &JsonOutput).unwrap();
    Case {
        _temp: temp,
        config,
        stage,
    }
}

fn options(case: &Case) -> FetchOptions {
    let mut options = FetchOptions::new(case.config.clone());
    options.retry = RetryPolicy {
        max_attempts: 2,
        interval: Duration::ZERO,
        budget: None,
    };
    options.now = Some(Utc.with_ymd_and_hms(2025, 7, 31, 5, 0, 0).unwrap());
    options
}

fn read_keys(path: &Utf8PathBuf) -> HashMap<String, String> {
    fs::read_to_string(path.as_std_path())
        .unwrap()
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

#[test]
fn init_writes_a_complete_config() {
    let app = App::new(FakeNomads { published: vec![] }, NonEmpty);
    let case = init_case(&app);
    let keys = read_keys(&case.config);

    assert_eq!(keys["FOLDER_NAME"], "edmonton");
    assert_eq!(keys["CYCLE"], "2025073100");
    assert_eq!(keys["RESOLUTION"], "1p00");
    assert_eq!(keys["INTERVALS"], r#"("0 3 45")"#);
    assert_eq!(keys["START_DATE"], "2025-07-31_00:00:00");
    assert_eq!(keys["END_DATE"], "2025-08-01_21:00:00");
    assert_eq!(keys["RADIUS_KM"], "150");
    assert_eq!(keys["GEOG_DATA_PATH"], "\"/data/geog\"");
    let top: f64 = keys["TOP"].parse().unwrap();
    let bottom: f64 = keys["BOTTOM"].parse().unwrap();
    assert!(top > 53.5461 + 1.35 && bottom < 53.5461 - 1.35);
}

#[test]
fn fallback_cycle_is_reconciled_and_staged() {
    let app = App::new(FakeNomads { published: vec!["2025073018"] }, NonEmpty);
    let case = init_case(&app);
    fs::write(
        case.config.as_std_path(),
        fs::read_to_string(case.config.as_std_path()).unwrap() + "OPERATOR_NOTE=keep\n",
    )
    .unwrap();

    let result = app.fetch(options(&case), &JsonOutput).unwrap();
    assert!(result.success);
    assert_eq!(result.resolved.cycle.to_string(), "2025073018");
    assert_eq!(result.resolved.requested.to_string(), "2025073100");
    assert_eq!(result.resolved.retreats, 1);
    assert_eq!(result.counts.ok, 16);

    let keys = read_keys(&case.config);
    assert_eq!(keys["CYCLE"], "2025073018");
    assert_eq!(keys["INTERVALS"], r#"("0 3 45")"#);
    assert_eq!(keys["OPERATOR_NOTE"], "keep");

    let start = NaiveDateTime::parse_from_str(&keys["START_DATE"], RUN_DATE_FORMAT).unwrap();
    let end = NaiveDateTime::parse_from_str(&keys["END_DATE"], RUN_DATE_FORMAT).unwrap();
    let run_days: f64 = keys["RUN_DAYS"].parse().unwrap();
    assert_eq!((end - start).num_seconds() as f64, run_days * 86_400.0);
    assert_eq!(keys["RUN_HOURS"], "45");
    let run_hours: f64 = keys["RUN_HOURS"].parse().unwrap();
    assert_eq!(run_hours * 3600.0, run_days * 86_400.0);
    assert_eq!(keys["START_YEAR"], start.year().to_string());
    assert_eq!(keys["START_MONTH"], format!("{:02}", start.month()));
    assert_eq!(keys["START_DAY"], format!("{:02}", start.day()));
    assert_eq!(keys["START_HOUR"], format!("{:02}", start.hour()));
    assert_eq!(keys["END_DAY"], format!("{:02}", end.day()));
    assert_eq!(keys["END_HOUR"], format!("{:02}", end.hour()));
    assert_eq!(keys["START_DATE"], "2025-07-30_18:00:00");
    assert_eq!(keys["END_DATE"], "2025-07-31_15:00:00");

    let run_dir = case.stage.join("edmonton/2025073018");
    assert!(run_dir.join("gfs.t18z.pgrb2.1p00.f045").as_std_path().is_file());
    let manifest = result.manifest.unwrap();
    assert_eq!(manifest, run_dir.join("handoff.json"));
    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(manifest.as_std_path()).unwrap()).unwrap();
    assert_eq!(manifest["files"].as_array().unwrap().len(), 16);
    assert_eq!(manifest["grid"]["inner"]["points"], 34);

    let log = fs::read_to_string(case.stage.join("edmonton/retrieval_log.csv").as_std_path()).unwrap();
    assert_eq!(log.lines().count(), 17);
}

#[test]
fn second_fetch_is_fully_cached() {
    let app = App::new(FakeNomads { published: vec!["2025073100"] }, NonEmpty);
    let case = init_case(&app);
    app.fetch(options(&case), &JsonOutput).unwrap();

    let offline = App::new(FakeNomads { published: vec![] }, NonEmpty);
    let mut rerun = options(&case);
    rerun.resolver.max_retreats = 0;
    let err = offline.fetch(rerun, &JsonOutput).unwrap_err();
    assert_matches!(err, StageError::CycleUnavailable { .. });

    let result = app.fetch(options(&case), &JsonOutput).unwrap();
    assert_eq!(result.counts.cached, 16);
    assert_eq!(result.counts.ok, 0);
    assert!(result.success);
}

#[test]
fn exhausted_fallback_records_last_attempted_cycle() {
    let app = App::new(FakeNomads { published: vec![] }, NonEmpty);
    let case = init_case(&app);

    let err = app.fetch(options(&case), &JsonOutput).unwrap_err();
    assert_matches!(
        err,
        StageError::CycleUnavailable { ref last_attempted, retreats: 4, .. }
            if last_attempted == "2025073000"
    );
    assert_eq!(read_keys(&case.config)["CYCLE"], "2025073000");
    assert!(!case.stage.as_std_path().exists());
}

#[test]
fn dry_run_leaves_config_and_disk_untouched() {
    let app = App::new(FakeNomads { published: vec!["2025073018"] }, NonEmpty);
    let case = init_case(&app);
    let before = fs::read_to_string(case.config.as_std_path()).unwrap();

    let mut options = options(&case);
    options.dry_run = true;
    let result = app.fetch(options, &JsonOutput).unwrap();

    assert_eq!(result.resolved.cycle.to_string(), "2025073018");
    assert_eq!(result.planned.len(), 16);
    assert!(result.outcomes.is_empty());
    assert_eq!(fs::read_to_string(case.config.as_std_path()).unwrap(), before);
    assert!(!case.stage.as_std_path().exists());
}

#[test]
fn failed_lead_times_are_reported_not_raised() {
    let app = App::new(FakeNomads { published: vec!["2025073100"] }, NonEmpty);
    let case = init_case(&app);
    let mut options = options(&case);
    options.bounds.left = Some(250.0);
    options.bounds.right = Some(240.0);
    assert_matches!(
        app.fetch(options, &JsonOutput),
        Err(StageError::InvalidDomain(_))
    );

    let partial = App::new(FakeNomads { published: vec!["2025073100"] }, EmptyAfter(30));
    let result = partial.fetch(self::options(&case), &JsonOutput).unwrap();
    assert!(!result.success);
    assert_eq!(result.counts.failed, 5);
    assert_eq!(result.counts.ok, 11);
    assert!(result.manifest.is_none());
}

/// Rejects every lead time past the given hour.
struct EmptyAfter(u32);

impl StructuralValidator for EmptyAfter {
    fn validate(&self, path: &Path) -> Validation {
        let lead: u32 = path
            .to_string_lossy()
            .rsplit(".f")
            .next()
            .and_then(|tail| tail.get(..3))
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0);
        Validation {
            valid: lead <= self.0,
            records: 1,
        }
    }

    fn status(&self) -> ValidatorStatus {
        ValidatorStatus::Ready {
            tool: "fake".to_string(),
        }
    }
}

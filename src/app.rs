use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditLog, RetrievalOutcome, human_size};
use crate::config::{RunConfig, RunConfigStore};
use crate::cycle::{CycleResolver, ResolvedCycle, ResolverOptions, UpstreamProbe};
use crate::domain::{Bounds, Cycle, LeadInterval, Resolution, ValidHours};
use crate::error::StageError;
use crate::gfs::{Endpoint, GfsClient};
use crate::grid::{Center, DomainBox, GridSpec, derive_grid};
use crate::handoff::{HandoffCommand, HandoffManifest};
use crate::reconcile::{ConfigReconciler, HorizonPolicy, TimeRange, apply};
use crate::retriever::{FileRetriever, RetryPolicy};
use crate::scheduler::{RunPlan, Scheduler, SchedulerOptions, StatusCounts};
use crate::store::Store;
use crate::validator::{StructuralValidator, ValidatorStatus};

const START_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundsOverride {
    pub top: Option<f64>,
    pub bottom: Option<f64>,
    pub left: Option<f64>,
    pub right: Option<f64>,
}

impl BoundsOverride {
    pub fn is_empty(&self) -> bool {
        self.top.is_none() && self.bottom.is_none() && self.left.is_none() && self.right.is_none()
    }

    pub fn apply(&self, base: Option<Bounds>) -> Result<Option<Bounds>, StageError> {
        if self.is_empty() {
            return Ok(base);
        }
        let base = base.unwrap_or(Bounds {
            top: 90.0,
            bottom: -90.0,
            left: 0.0,
            right: 360.0,
        });
        let bounds = Bounds {
            top: self.top.unwrap_or(base.top),
            bottom: self.bottom.unwrap_or(base.bottom),
            left: self.left.map(east_longitude).unwrap_or(base.left),
            right: self.right.map(east_longitude).unwrap_or(base.right),
        };
        if !(-90.0..=90.0).contains(&bounds.top) || !(-90.0..=90.0).contains(&bounds.bottom) {
            return Err(StageError::InvalidDomain(format!(
                "latitude bounds {}..{} outside [-90, 90]",
                bounds.bottom, bounds.top
            )));
        }
        if !(0.0..=360.0).contains(&bounds.left) || !(0.0..=360.0).contains(&bounds.right) {
            return Err(StageError::InvalidDomain(format!(
                "longitude bounds {}..{} outside [0, 360]",
                bounds.left, bounds.right
            )));
        }
        if bounds.bottom >= bounds.top || bounds.left >= bounds.right {
            return Err(StageError::InvalidDomain(format!(
                "empty box: top {} bottom {} left {} right {}",
                bounds.top, bounds.bottom, bounds.left, bounds.right
            )));
        }
        Ok(Some(bounds))
    }
}

// Western longitudes map into [0, 360); 360 itself stays the eastern edge.
fn east_longitude(lon: f64) -> f64 {
    if lon < 0.0 { lon + 360.0 } else { lon }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub config_path: Utf8PathBuf,
    pub cycle: Option<Cycle>,
    pub dry_run: bool,
    pub resolution: Option<Resolution>,
    pub bounds: BoundsOverride,
    pub valid_hours: Option<ValidHours>,
    pub dest_root: Option<Utf8PathBuf>,
    pub scheduler: SchedulerOptions,
    pub retry: RetryPolicy,
    pub resolver: ResolverOptions,
    pub horizon: HorizonPolicy,
    pub handoff_command: Option<String>,
    pub now: Option<DateTime<Utc>>,
}

impl FetchOptions {
    pub fn new(config_path: Utf8PathBuf) -> Self {
        Self {
            config_path,
            cycle: None,
            dry_run: false,
            resolution: None,
            bounds: BoundsOverride::default(),
            valid_hours: None,
            dest_root: None,
            scheduler: SchedulerOptions::default(),
            retry: RetryPolicy::default(),
            resolver: ResolverOptions::default(),
            horizon: HorizonPolicy::default(),
            handoff_command: None,
            now: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub config_path: Utf8PathBuf,
    pub area: String,
    pub resolution: Resolution,
    pub resolved: ResolvedCycle,
    pub range: TimeRange,
    pub dry_run: bool,
    pub planned: Vec<u32>,
    pub counts: StatusCounts,
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_size: String,
    pub elapsed_secs: f64,
    pub success: bool,
    pub failures: Vec<String>,
    pub outcomes: Vec<RetrievalOutcome>,
    pub audit_log: Option<Utf8PathBuf>,
    pub manifest: Option<Utf8PathBuf>,
    pub validator: ValidatorStatus,
}

#[derive(Debug, Clone)]
pub struct InitRequest {
    pub config_path: Utf8PathBuf,
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
    pub forecast_days: Option<f64>,
    pub case_name: String,
    pub dest_root: Option<Utf8PathBuf>,
    pub start_date: Option<DateTime<Utc>>,
    pub interval_hours: u32,
    pub resolution: Resolution,
    pub valid_hours: ValidHours,
    pub geog_data_path: Option<String>,
    pub cycle: Option<Cycle>,
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitResult {
    pub config_path: Utf8PathBuf,
    pub area: String,
    pub cycle: Cycle,
    pub domain: DomainBox,
    pub grid: GridSpec,
    pub range: TimeRange,
}

pub struct App<C: GfsClient, V: StructuralValidator> {
    client: C,
    validator: V,
    endpoint: Endpoint,
}

impl<C: GfsClient, V: StructuralValidator> App<C, V> {
    pub fn new(client: C, validator: V) -> Self {
        Self::with_endpoint(client, validator, Endpoint::default())
    }

    pub fn with_endpoint(client: C, validator: V, endpoint: Endpoint) -> Self {
        Self {
            client,
            validator,
            endpoint,
        }
    }

    pub fn init(&self, request: InitRequest, sink: &dyn ProgressSink) -> Result<InitResult, StageError> {
        sink.event(ProgressEvent {
            message: "phase=Prepare; deriving domain".to_string(),
            elapsed: None,
        });
        let center = Center::new(request.lat, request.lon)?;
        let domain = DomainBox::new(center, request.radius_km)?;
        let grid = derive_grid(center, request.radius_km, request.resolution)?;

        let policy = HorizonPolicy::default();
        let step = request.interval_hours;
        let total = policy.horizon_hours(request.forecast_days, step.max(1));
        let requested = LeadInterval::new(0, step, total)?;

        let now = request.now.unwrap_or_else(Utc::now);
        let cycle = match (request.cycle, request.start_date) {
            (Some(cycle), _) => cycle,
            (None, Some(start)) => Cycle::snap_down(start),
            (None, None) => Cycle::snap_down(now - ResolverOptions::default().safety_margin),
        };
        if !request.valid_hours.contains(cycle.hour()) {
            tracing::warn!(%cycle, valid_hours = %request.valid_hours, "initial cycle hour is filtered out");
        }

        let mut config = RunConfig {
            folder_name: Some(request.case_name.clone()),
            case_name: Some(request.case_name.clone()),
            cycle: Some(cycle),
            resolution: request.resolution,
            bounds: Some(domain.padded),
            intervals: vec![requested],
            valid_hours: request.valid_hours.clone(),
            dest_root: request.dest_root.clone(),
            center: Some(center),
            radius_km: Some(request.radius_km),
            forecast_days: request.forecast_days,
            geog_data_path: request.geog_data_path.clone(),
            start: None,
            end: None,
        };

        let store = RunConfigStore::new(request.config_path.clone());
        let reconciler = ConfigReconciler::new(&store, policy);
        let range = reconciler.plan(&config, cycle)?;
        apply(&mut config, &range);

        sink.event(ProgressEvent {
            message: format!("phase=Store; writing {}", request.config_path),
            elapsed: None,
        });
        store.persist(&config)?;
        tracing::info!(config = %request.config_path, %cycle, "run config initialised");

        Ok(InitResult {
            config_path: request.config_path,
            area: config.area().to_string(),
            cycle,
            domain,
            grid,
            range,
        })
    }

    pub fn fetch(&self, options: FetchOptions, sink: &dyn ProgressSink) -> Result<FetchResult, StageError> {
        let started = Instant::now();
        let store = RunConfigStore::new(options.config_path.clone());
        let mut config = store.load()?;

        let overrides = self.apply_overrides(&mut config, &options)?;
        if !overrides.is_empty() && !options.dry_run {
            store.persist_entries(&overrides)?;
        }

        let resolver_options = ResolverOptions {
            valid_hours: config.valid_hours.clone(),
            ..options.resolver.clone()
        };
        let first_lead = config.intervals.first().map(|interval| interval.start).unwrap_or(0);
        let probe = UpstreamProbe::new(&self.client, &self.endpoint, config.resolution, first_lead);
        let resolver = CycleResolver::new(&probe, resolver_options);
        let initial = resolver.initial_cycle(
            options.cycle.or(config.cycle),
            options.now.unwrap_or_else(Utc::now),
        );

        sink.event(ProgressEvent {
            message: format!("phase=Resolve; probing cycle {initial}"),
            elapsed: None,
        });
        let reconciler = ConfigReconciler::new(&store, options.horizon);
        let resolved = {
            let config = &mut config;
            resolver.resolve(initial, |candidate| {
                if options.dry_run {
                    config.cycle = Some(candidate);
                    Ok(())
                } else {
                    reconciler.record_candidate(config, candidate)
                }
            })?
        };

        let range = if options.dry_run {
            let range = reconciler.plan(&config, resolved.cycle)?;
            apply(&mut config, &range);
            range
        } else {
            reconciler.reconcile(&mut config, resolved.cycle)?
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; cycle {} ({} retreats), {} to {}",
                resolved.cycle, resolved.retreats, range.start, range.end
            ),
            elapsed: Some(started.elapsed()),
        });

        let staging = Store::new(match options.dest_root.clone().or(config.dest_root.clone()) {
            Some(root) => root,
            None => Store::default_root()?,
        });
        let area = config.area().to_string();
        let plan = RunPlan {
            cycle: resolved.cycle,
            area: area.clone(),
            resolution: config.resolution,
            bounds: config.bounds,
            intervals: range.intervals.clone(),
        };
        let tasks = plan.tasks(&staging, &self.endpoint);

        let audit = AuditLog::new(staging.audit_log_path(&area));
        let retriever = FileRetriever::new(&self.client, &self.validator, &audit, options.retry);
        let scheduler_options = SchedulerOptions {
            dry_run: options.dry_run,
            ..options.scheduler
        };
        sink.event(ProgressEvent {
            message: format!(
                "phase=Download; {} lead times, {} workers",
                tasks.len(),
                scheduler_options.max_parallel
            ),
            elapsed: Some(started.elapsed()),
        });
        let report = Scheduler::new(retriever, scheduler_options).run(&tasks);

        let mut manifest = None;
        if report.success() && !options.dry_run {
            sink.event(ProgressEvent {
                message: "phase=Handoff; writing manifest".to_string(),
                elapsed: Some(started.elapsed()),
            });
            let grid = match (config.center, config.radius_km) {
                (Some(center), Some(radius)) => derive_grid(center, radius, config.resolution).ok(),
                _ => None,
            };
            let files = staging.list_run_files(&area, resolved.cycle)?;
            let path = staging.manifest_path(&area, resolved.cycle);
            HandoffManifest::new(&area, config.resolution, &range, grid, store.path(), files)
                .write(&path)?;
            if let Some(program) = &options.handoff_command {
                HandoffCommand::resolve(program)?.run(store.path(), &path)?;
            }
            manifest = Some(path);
        }

        let counts = report.counts();
        let total_bytes = report.total_bytes();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} cached, {} downloaded, {} failed",
                counts.cached,
                counts.ok,
                report.failures.len()
            ),
            elapsed: Some(started.elapsed()),
        });

        Ok(FetchResult {
            config_path: options.config_path,
            area,
            resolution: config.resolution,
            resolved,
            range,
            dry_run: options.dry_run,
            total_files: report.outcomes.len(),
            planned: report.planned.clone(),
            counts,
            total_bytes,
            total_size: human_size(total_bytes),
            elapsed_secs: started.elapsed().as_secs_f64(),
            success: report.success(),
            failures: report.failures.iter().map(ToString::to_string).collect(),
            audit_log: (!options.dry_run).then(|| audit.path().to_path_buf()),
            outcomes: report.outcomes,
            manifest,
            validator: self.validator.status(),
        })
    }

    fn apply_overrides(
        &self,
        config: &mut RunConfig,
        options: &FetchOptions,
    ) -> Result<Vec<(&'static str, String)>, StageError> {
        let mut entries = Vec::new();
        if let Some(resolution) = options.resolution {
            config.resolution = resolution;
            entries.push(("RESOLUTION", resolution.product().to_string()));
        }
        if let Some(valid_hours) = &options.valid_hours {
            config.valid_hours = valid_hours.clone();
            entries.push(("VALID_HOURS", format!("\"{valid_hours}\"")));
        }
        if !options.bounds.is_empty() {
            config.bounds = options.bounds.apply(config.bounds)?;
            if let Some(bounds) = config.bounds {
                entries.push(("TOP", format!("{:.8}", bounds.top)));
                entries.push(("BOTTOM", format!("{:.8}", bounds.bottom)));
                entries.push(("LEFT", format!("{:.8}", bounds.left)));
                entries.push(("RIGHT", format!("{:.8}", bounds.right)));
            }
        }
        Ok(entries)
    }
}

pub fn parse_start_date(value: &str) -> Result<DateTime<Utc>, StageError> {
    NaiveDateTime::parse_from_str(value.trim(), START_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| StageError::InvalidStartDate(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_override_on_globe() {
        let overrides = BoundsOverride {
            top: Some(60.0),
            bottom: Some(45.0),
            left: Some(-120.0),
            right: None,
        };
        let bounds = overrides.apply(None).unwrap().unwrap();
        assert_eq!(bounds.left, 240.0);
        assert_eq!(bounds.right, 360.0);
        assert_eq!(bounds.top, 60.0);
    }

    #[test]
    fn bounds_override_keeps_eastern_edge_at_360() {
        let overrides = BoundsOverride {
            left: Some(300.0),
            right: Some(360.0),
            ..BoundsOverride::default()
        };
        let bounds = overrides.apply(None).unwrap().unwrap();
        assert_eq!((bounds.left, bounds.right), (300.0, 360.0));

        let western = BoundsOverride {
            left: Some(-60.0),
            right: Some(-10.0),
            ..BoundsOverride::default()
        };
        let bounds = western.apply(None).unwrap().unwrap();
        assert_eq!((bounds.left, bounds.right), (300.0, 350.0));

        let beyond = BoundsOverride {
            right: Some(400.0),
            ..BoundsOverride::default()
        };
        assert!(matches!(
            beyond.apply(None),
            Err(StageError::InvalidDomain(_))
        ));
    }

    #[test]
    fn bounds_override_rejects_inverted_box() {
        let overrides = BoundsOverride {
            top: Some(40.0),
            bottom: Some(50.0),
            ..BoundsOverride::default()
        };
        assert!(matches!(
            overrides.apply(None),
            Err(StageError::InvalidDomain(_))
        ));
        assert_eq!(BoundsOverride::default().apply(None).unwrap(), None);
    }

    #[test]
    fn start_date_parses_as_utc() {
        let start = parse_start_date("2025-07-30T19:30").unwrap();
        assert_eq!(Cycle::snap_down(start).to_string(), "2025073018");
        assert!(parse_start_date("2025/07/30").is_err());
    }
}

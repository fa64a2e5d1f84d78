use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use fs2::FileExt;
use regex::Regex;

use crate::domain::{
    Bounds, Cycle, LeadInterval, Resolution, ValidHours, format_interval_list,
    parse_interval_list,
};
use crate::error::StageError;
use crate::grid::Center;

pub const DEFAULT_CONFIG_NAME: &str = "gfs.cnf";

pub const RUN_DATE_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub folder_name: Option<String>,
    pub case_name: Option<String>,
    pub cycle: Option<Cycle>,
    pub resolution: Resolution,
    pub bounds: Option<Bounds>,
    pub intervals: Vec<LeadInterval>,
    pub valid_hours: ValidHours,
    pub dest_root: Option<Utf8PathBuf>,
    pub center: Option<Center>,
    pub radius_km: Option<f64>,
    pub forecast_days: Option<f64>,
    pub geog_data_path: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            folder_name: None,
            case_name: None,
            cycle: None,
            resolution: Resolution::Fine,
            bounds: None,
            intervals: Vec::new(),
            valid_hours: ValidHours::default(),
            dest_root: None,
            center: None,
            radius_km: None,
            forecast_days: None,
            geog_data_path: None,
            start: None,
            end: None,
        }
    }
}

impl RunConfig {
    pub fn area(&self) -> &str {
        self.folder_name
            .as_deref()
            .or(self.case_name.as_deref())
            .unwrap_or("default")
    }

    pub fn parse(content: &str) -> Result<Self, StageError> {
        let line_re = Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$")
            .map_err(|err| StageError::ConfigParse {
                line: 0,
                message: err.to_string(),
            })?;

        let mut config = RunConfig::default();
        let mut top = None;
        let mut bottom = None;
        let mut left = None;
        let mut right = None;
        let mut center_lat = None;
        let mut center_lon = None;

        for (index, raw) in content.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(caps) = line_re.captures(trimmed) else {
                return Err(StageError::ConfigParse {
                    line,
                    message: format!("expected KEY=value, got `{trimmed}`"),
                });
            };
            let key = &caps[1];
            let value = unquote(caps[2].trim());
            let bad = |message: String| StageError::ConfigParse { line, message };

            match key {
                "FOLDER_NAME" => config.folder_name = non_empty(value),
                "CASE_NAME" => config.case_name = non_empty(value),
                "CYCLE" => {
                    config.cycle = match value {
                        "" | "auto" => None,
                        other => Some(other.parse().map_err(|err: StageError| bad(err.to_string()))?),
                    }
                }
                "RESOLUTION" => config.resolution = Resolution::from_config_lenient(value),
                "TOP" => top = Some(parse_f64(value).map_err(bad)?),
                "BOTTOM" => bottom = Some(parse_f64(value).map_err(bad)?),
                "LEFT" => left = Some(parse_f64(value).map_err(bad)?),
                "RIGHT" => right = Some(parse_f64(value).map_err(bad)?),
                "INTERVALS" => {
                    config.intervals =
                        parse_interval_list(value).map_err(|err| bad(err.to_string()))?
                }
                "VALID_HOURS" => {
                    config.valid_hours = value.parse().map_err(|err: StageError| bad(err.to_string()))?
                }
                "WRF_DEST" => config.dest_root = non_empty(value).map(Utf8PathBuf::from),
                "CENTER_LAT" => center_lat = Some(parse_f64(value).map_err(bad)?),
                "CENTER_LON" => center_lon = Some(parse_f64(value).map_err(bad)?),
                "RADIUS_KM" => config.radius_km = Some(parse_f64(value).map_err(bad)?),
                "FORECAST_DAYS" => config.forecast_days = Some(parse_f64(value).map_err(bad)?),
                "GEOG_DATA_PATH" => config.geog_data_path = non_empty(value),
                "START_DATE" => config.start = Some(parse_run_date(value).map_err(bad)?),
                "END_DATE" => config.end = Some(parse_run_date(value).map_err(bad)?),
                _ => {}
            }
        }

        if let (Some(top), Some(bottom), Some(left), Some(right)) = (top, bottom, left, right) {
            config.bounds = Some(Bounds {
                top,
                bottom,
                left,
                right,
            });
        }
        if let (Some(lat), Some(lon)) = (center_lat, center_lon) {
            config.center = Some(Center::new(lat, lon).map_err(|err| StageError::ConfigParse {
                line: 0,
                message: err.to_string(),
            })?);
        }
        Ok(config)
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut entries = Vec::new();
        if let Some(name) = &self.folder_name {
            entries.push(("FOLDER_NAME", shell_value(name)));
        }
        if let Some(bounds) = &self.bounds {
            entries.push(("TOP", format!("{:.8}", bounds.top)));
            entries.push(("BOTTOM", format!("{:.8}", bounds.bottom)));
            entries.push(("LEFT", format!("{:.8}", bounds.left)));
            entries.push(("RIGHT", format!("{:.8}", bounds.right)));
        }
        if !self.intervals.is_empty() {
            entries.push(("INTERVALS", format_interval_list(&self.intervals)));
        }
        entries.push(("RESOLUTION", self.resolution.product().to_string()));
        entries.push(("VALID_HOURS", format!("\"{}\"", self.valid_hours)));
        if let Some(dest) = &self.dest_root {
            entries.push(("WRF_DEST", shell_value(dest.as_str())));
        }
        if let Some(center) = &self.center {
            entries.push(("CENTER_LAT", format!("{:.6}", center.lat)));
            entries.push(("CENTER_LON", format!("{:.6}", center.lon)));
        }
        if let Some(radius) = self.radius_km {
            entries.push(("RADIUS_KM", format!("{}", radius.round() as i64)));
        }
        entries.extend(self.time_entries());
        if let Some(days) = self.forecast_days {
            entries.push(("FORECAST_DAYS", days.to_string()));
        }
        if let Some(path) = &self.geog_data_path {
            entries.push(("GEOG_DATA_PATH", format!("\"{path}\"")));
        }
        if let Some(name) = &self.case_name {
            entries.push(("CASE_NAME", format!("\"{name}\"")));
        }
        entries.extend(self.cycle_entry());
        entries
    }

    pub fn cycle_entry(&self) -> Option<(&'static str, String)> {
        self.cycle.map(|cycle| ("CYCLE", cycle.id()))
    }

    /// Start/end timestamps, their calendar fields, and the run length.
    ///
    /// `RUN_DAYS` and `RUN_HOURS` are alternative views of the same length,
    /// not a days + hours split. A namelist generator picks one of them and
    /// sets the other namelist field to zero.
    pub fn time_entries(&self) -> Vec<(&'static str, String)> {
        let (Some(start), Some(end)) = (self.start, self.end) else {
            return Vec::new();
        };
        let run_seconds = (end - start).num_seconds();
        let run_hours = run_seconds / 3600;
        let run_days = run_seconds as f64 / 86_400.0;
        vec![
            ("START_DATE", start.format(RUN_DATE_FORMAT).to_string()),
            ("END_DATE", end.format(RUN_DATE_FORMAT).to_string()),
            ("RUN_DAYS", run_days.to_string()),
            ("RUN_HOURS", run_hours.to_string()),
            ("START_YEAR", start.year().to_string()),
            ("START_MONTH", format!("{:02}", start.month())),
            ("START_DAY", format!("{:02}", start.day())),
            ("START_HOUR", format!("{:02}", start.hour())),
            ("END_YEAR", end.year().to_string()),
            ("END_MONTH", format!("{:02}", end.month())),
            ("END_DAY", format!("{:02}", end.day())),
            ("END_HOUR", format!("{:02}", end.hour())),
        ]
    }
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_f64(value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .map_err(|_| format!("expected a number, got `{value}`"))
}

pub fn parse_run_date(value: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(value, RUN_DATE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("expected {RUN_DATE_FORMAT}, got `{value}`"))
}

fn shell_value(value: &str) -> String {
    if value.contains(' ') && !value.starts_with('(') && !value.starts_with('"') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

pub fn upsert_lines(existing: &str, updates: &[(&str, String)]) -> String {
    let mut written = vec![false; updates.len()];
    let mut out = String::with_capacity(existing.len() + 64);

    for line in existing.lines() {
        let key = line
            .trim_start()
            .trim_start_matches("export ")
            .split_once('=')
            .map(|(key, _)| key.trim());
        let position = key.and_then(|key| updates.iter().position(|(name, _)| *name == key));
        match position {
            Some(index) if written[index] => continue,
            Some(index) => {
                let (name, value) = &updates[index];
                out.push_str(&format!("{name}={value}\n"));
                written[index] = true;
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    for (index, (name, value)) in updates.iter().enumerate() {
        if !written[index] {
            out.push_str(&format!("{name}={value}\n"));
        }
    }
    out
}

#[derive(Debug)]
pub struct RunConfigStore {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl RunConfigStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.as_std_path().exists()
    }

    pub fn load(&self) -> Result<RunConfig, StageError> {
        if !self.exists() {
            return Err(StageError::MissingConfig(self.path.clone().into_std_path_buf()));
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|_| StageError::ConfigRead(self.path.clone().into_std_path_buf()))?;
        RunConfig::parse(&content)
    }

    pub fn persist(&self, config: &RunConfig) -> Result<(), StageError> {
        self.persist_entries(&config.entries())
    }

    pub fn persist_entries(&self, entries: &[(&str, String)]) -> Result<(), StageError> {
        let conflict = |message: String| StageError::ConfigWriteConflict {
            path: self.path.clone().into_std_path_buf(),
            message,
        };

        let _guard = self
            .lock
            .lock()
            .map_err(|_| conflict("config lock poisoned".to_string()))?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(parent.as_std_path()).map_err(|err| conflict(err.to_string()))?;

        let lock_path = Utf8PathBuf::from(format!("{}.lock", self.path));
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path.as_std_path())
            .map_err(|err| conflict(format!("open lock {lock_path}: {err}")))?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|err| conflict(format!("lock {lock_path}: {err}")))?;

        let existing = match fs::read_to_string(self.path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => format!(
                "# Auto-generated by gfs-stage {}\n",
                Utc::now().format("%Y-%m-%dT%H:%M:%SZ")
            ),
            Err(err) => return Err(conflict(err.to_string())),
        };
        let updated = upsert_lines(&existing, entries);

        let mut temp = tempfile::Builder::new()
            .prefix(".gfs-cnf")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| conflict(err.to_string()))?;
        temp.write_all(updated.as_bytes())
            .map_err(|err| conflict(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| conflict(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| conflict(err.to_string()))?;

        let _ = FileExt::unlock(&lock_file);
        tracing::debug!(path = %self.path, keys = entries.len(), "run config persisted");
        Ok(())
    }
}

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use serde::Serialize;

use crate::domain::{Bounds, Cycle, LeadInterval, Resolution};
use crate::error::StageError;
use crate::store::Store;

pub const AUDIT_HEADER: [&str; 17] = [
    "timestamp",
    "cycle",
    "area",
    "resolution",
    "left",
    "right",
    "top",
    "bottom",
    "interval",
    "lead_hour",
    "size_bytes",
    "size_human",
    "records",
    "elapsed_s",
    "status",
    "url",
    "destination",
];

const GLOBE: Bounds = Bounds {
    top: 90.0,
    bottom: -90.0,
    left: 0.0,
    right: 360.0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Cached,
    Ok,
    Fail,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Cached => write!(f, "CACHED"),
            OutcomeStatus::Ok => write!(f, "OK"),
            OutcomeStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub lead_hour: u32,
    pub status: OutcomeStatus,
    pub size_bytes: u64,
    pub records: u64,
    pub elapsed: Duration,
    pub attempts: u32,
    pub url: String,
    pub destination: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct AuditRecord<'a> {
    pub timestamp: DateTime<Utc>,
    pub cycle: Cycle,
    pub area: &'a str,
    pub resolution: Resolution,
    pub bounds: Option<Bounds>,
    pub interval: LeadInterval,
    pub outcome: &'a RetrievalOutcome,
}

impl AuditRecord<'_> {
    pub fn to_row(&self) -> String {
        let bounds = self.bounds.unwrap_or(GLOBE);
        let outcome = self.outcome;
        let fields = [
            csv_field(
                &self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                false,
            ),
            csv_field(&self.cycle.id(), false),
            csv_field(self.area, false),
            csv_field(self.resolution.product(), false),
            format!("{:.4}", bounds.left),
            format!("{:.4}", bounds.right),
            format!("{:.4}", bounds.top),
            format!("{:.4}", bounds.bottom),
            csv_field(&self.interval.to_string(), true),
            outcome.lead_hour.to_string(),
            outcome.size_bytes.to_string(),
            csv_field(&human_size(outcome.size_bytes), false),
            outcome.records.to_string(),
            format!("{:.3}", outcome.elapsed.as_secs_f64()),
            outcome.status.to_string(),
            csv_field(&outcome.url, true),
            csv_field(outcome.destination.as_str(), true),
        ];
        let mut row = fields.join(",");
        row.push('\n');
        row
    }
}

#[derive(Debug)]
pub struct AuditLog {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord<'_>) -> Result<(), StageError> {
        let row = record.to_row();
        self.with_locked_file(|file| {
            file.write_all(row.as_bytes())
                .map_err(|err| StageError::AuditWrite(err.to_string()))
        })
    }

    fn with_locked_file<F>(&self, write: F) -> Result<(), StageError>
    where
        F: FnOnce(&mut File) -> Result<(), StageError>,
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StageError::AuditWrite("audit log lock poisoned".to_string()))?;
        if let Some(parent) = self.path.parent() {
            Store::ensure_dir(parent).map_err(|err| StageError::AuditWrite(err.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_std_path())
            .map_err(|err| StageError::AuditWrite(format!("open {}: {err}", self.path)))?;
        FileExt::lock_exclusive(&file)
            .map_err(|err| StageError::AuditWrite(format!("lock {}: {err}", self.path)))?;

        let result = (|| {
            let len = file
                .metadata()
                .map_err(|err| StageError::AuditWrite(err.to_string()))?
                .len();
            if len == 0 {
                let mut header = AUDIT_HEADER.join(",");
                header.push('\n');
                file.write_all(header.as_bytes())
                    .map_err(|err| StageError::AuditWrite(err.to_string()))?;
            }
            write(&mut file)
        })();

        let _ = FileExt::unlock(&file);
        result
    }
}

fn csv_field(value: &str, force_quote: bool) -> String {
    let needs_quotes =
        force_quote || value.contains([',', '"', '\n', '\r']) || value.starts_with(' ');
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

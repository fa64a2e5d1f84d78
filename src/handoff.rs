use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RUN_DATE_FORMAT;
use crate::domain::{Cycle, LeadInterval, Resolution};
use crate::error::StageError;
use crate::gfs::SELECTION_VERSION;
use crate::grid::GridSpec;
use crate::reconcile::TimeRange;
use crate::store::Store;
use crate::validator::find_in_path;

#[derive(Debug, Clone, Serialize)]
pub struct HandoffManifest {
    pub cycle: Cycle,
    pub area: String,
    pub resolution: Resolution,
    pub selection: &'static str,
    pub start_date: String,
    pub end_date: String,
    pub run_hours: u32,
    pub intervals: Vec<String>,
    pub grid: Option<GridSpec>,
    pub config_path: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
    pub generated_at: DateTime<Utc>,
}

impl HandoffManifest {
    pub fn new(
        area: &str,
        resolution: Resolution,
        range: &TimeRange,
        grid: Option<GridSpec>,
        config_path: &Utf8Path,
        files: Vec<Utf8PathBuf>,
    ) -> Self {
        Self {
            cycle: range.cycle,
            area: area.to_string(),
            resolution,
            selection: SELECTION_VERSION,
            start_date: range.start.format(RUN_DATE_FORMAT).to_string(),
            end_date: range.end.format(RUN_DATE_FORMAT).to_string(),
            run_hours: range.run_hours,
            intervals: range.intervals.iter().map(LeadInterval::to_string).collect(),
            grid,
            config_path: config_path.to_path_buf(),
            files,
            generated_at: Utc::now(),
        }
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), StageError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|err| StageError::Handoff(format!("serialize manifest: {err}")))?;
        Store::write_bytes_atomic(path, &json)?;
        tracing::info!(path = %path, files = self.files.len(), "handoff manifest written");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HandoffCommand {
    program: PathBuf,
}

impl HandoffCommand {
    pub fn resolve(program: &str) -> Result<Self, StageError> {
        let candidate = Path::new(program);
        if candidate.components().count() > 1 {
            if candidate.is_file() {
                return Ok(Self {
                    program: candidate.to_path_buf(),
                });
            }
            return Err(StageError::MissingTool(program.to_string()));
        }
        find_in_path(program)
            .map(|program| Self { program })
            .ok_or_else(|| StageError::MissingTool(program.to_string()))
    }

    pub fn run(&self, config: &Utf8Path, manifest: &Utf8Path) -> Result<(), StageError> {
        tracing::info!(program = %self.program.display(), "invoking handoff");
        let output = Command::new(&self.program)
            .arg(config.as_std_path())
            .arg(manifest.as_std_path())
            .output()
            .map_err(|err| StageError::Handoff(format!("{}: {err}", self.program.display())))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{} exited with {}", self.program.display(), output.status)
        } else {
            stderr
        };
        Err(StageError::Handoff(message))
    }
}

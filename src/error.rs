use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    #[error("invalid cycle: {0} (expected YYYYMMDDHH on a 6 hour boundary)")]
    InvalidCycle(String),

    #[error("invalid lead-time interval: {0}")]
    InvalidInterval(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid valid-hours filter: {0}")]
    InvalidValidHours(String),

    #[error("invalid resolution: {0} (expected fine|medium|coarse or 0p25|0p50|1p00)")]
    InvalidResolution(String),

    #[error("invalid start date: {0} (expected YYYY-MM-DDTHH:MM)")]
    InvalidStartDate(String),

    #[error("missing run config at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read run config at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse run config line {line}: {message}")]
    ConfigParse { line: usize, message: String },

    #[error("cannot rewrite run config at {path}: {message}")]
    #[diagnostic(help("the downstream stage must not run against a stale config; fix permissions and re-run"))]
    ConfigWriteConflict { path: PathBuf, message: String },

    #[error(
        "no published cycle found: requested {requested}, gave up at {last_attempted} after {retreats} retreats"
    )]
    #[diagnostic(help("upstream may be lagging; retry later or pass --cycle explicitly"))]
    CycleUnavailable {
        requested: String,
        last_attempted: String,
        retreats: u32,
    },

    #[error("lead time f{lead_hour:03} failed after {attempts} attempts: {url}")]
    TaskRetryExhausted {
        lead_hour: u32,
        attempts: u32,
        url: String,
    },

    #[error("structural validation failed: {0}")]
    ValidationFailed(String),

    #[error("worker for lead time f{lead_hour:03} panicked")]
    WorkerPanicked { lead_hour: u32 },

    #[error("upstream request failed: {0}")]
    UpstreamHttp(String),

    #[error("upstream returned status {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("failed to append audit record: {0}")]
    AuditWrite(String),

    #[error("pipeline handoff failed: {0}")]
    Handoff(String),
}

impl StageError {
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            StageError::MissingConfig(_)
                | StageError::ConfigRead(_)
                | StageError::ConfigParse { .. }
                | StageError::ConfigWriteConflict { .. }
        )
    }
}

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::domain::Cycle;
use crate::error::StageError;
use crate::gfs::ForecastFile;

pub const AUDIT_LOG_NAME: &str = "retrieval_log.csv";
pub const MANIFEST_NAME: &str = "handoff.json";

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, StageError> {
        BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().join("gfs-stage")).ok())
            .ok_or_else(|| StageError::Filesystem("unable to resolve data directory".to_string()))
    }

    pub fn area_dir(&self, area: &str) -> Utf8PathBuf {
        self.root.join(sanitize_area(area))
    }

    pub fn run_dir(&self, area: &str, cycle: Cycle) -> Utf8PathBuf {
        self.area_dir(area).join(cycle.id())
    }

    pub fn file_path(&self, area: &str, file: &ForecastFile) -> Utf8PathBuf {
        self.run_dir(area, file.cycle).join(file.file_name())
    }

    pub fn audit_log_path(&self, area: &str) -> Utf8PathBuf {
        self.area_dir(area).join(AUDIT_LOG_NAME)
    }

    pub fn manifest_path(&self, area: &str, cycle: Cycle) -> Utf8PathBuf {
        self.run_dir(area, cycle).join(MANIFEST_NAME)
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), StageError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| StageError::Filesystem(format!("create {path}: {err}")))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), StageError> {
        let parent = path
            .parent()
            .ok_or_else(|| StageError::Filesystem(format!("invalid destination path {path}")))?;
        Self::ensure_dir(parent)?;
        let temp = tempfile::Builder::new()
            .prefix(".gfs-stage")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| StageError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| StageError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| StageError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn list_run_files(&self, area: &str, cycle: Cycle) -> Result<Vec<Utf8PathBuf>, StageError> {
        let dir = self.run_dir(area, cycle);
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in
            fs::read_dir(dir.as_std_path()).map_err(|err| StageError::Filesystem(err.to_string()))?
        {
            let entry = entry.map_err(|err| StageError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            let is_forecast = path
                .file_name()
                .map(|name| name.starts_with("gfs.") && !name.ends_with(".part"))
                .unwrap_or(false);
            if is_forecast && path.as_std_path().is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

fn sanitize_area(area: &str) -> String {
    let cleaned: String = area
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        "default".to_string()
    } else {
        cleaned
    }
}

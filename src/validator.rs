use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub records: u64,
}

impl Validation {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            records: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ValidatorStatus {
    Ready { tool: String },
    Degraded { message: String },
}

pub trait StructuralValidator: Send + Sync {
    fn validate(&self, path: &Path) -> Validation;
    fn status(&self) -> ValidatorStatus;
}

#[derive(Debug, Clone)]
pub struct Wgrib2Validator {
    wgrib2: Option<PathBuf>,
}

impl Wgrib2Validator {
    pub fn new() -> Self {
        Self::with_tool(find_in_path("wgrib2"))
    }

    pub fn with_tool(wgrib2: Option<PathBuf>) -> Self {
        let validator = Self { wgrib2 };
        if let ValidatorStatus::Degraded { message } = validator.status() {
            tracing::warn!(%message, "structural validator degraded to size-only check");
        }
        validator
    }

    fn count_records(&self, tool: &Path, path: &Path) -> Validation {
        let output = match Command::new(tool).arg("-s").arg(path).output() {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(tool = %tool.display(), error = %err, "failed to run validator");
                return Validation::invalid();
            }
        };
        if !output.status.success() {
            tracing::debug!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "validator rejected file"
            );
            return Validation::invalid();
        }
        let records = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count() as u64;
        Validation {
            valid: records > 0,
            records,
        }
    }
}

impl Default for Wgrib2Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl StructuralValidator for Wgrib2Validator {
    fn validate(&self, path: &Path) -> Validation {
        let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
        if size == 0 {
            return Validation::invalid();
        }
        match &self.wgrib2 {
            Some(tool) => self.count_records(tool, path),
            None => Validation {
                valid: true,
                records: 0,
            },
        }
    }

    fn status(&self) -> ValidatorStatus {
        match &self.wgrib2 {
            Some(tool) => ValidatorStatus::Ready {
                tool: tool.display().to_string(),
            },
            None => ValidatorStatus::Degraded {
                message: "wgrib2 not found on PATH".to_string(),
            },
        }
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_mode_checks_size_only() {
        let temp = tempfile::tempdir().unwrap();
        let empty = temp.path().join("empty.grb2");
        let filled = temp.path().join("filled.grb2");
        fs::write(&empty, b"").unwrap();
        fs::write(&filled, b"GRIB....7777").unwrap();

        let validator = Wgrib2Validator::with_tool(None);
        assert!(matches!(
            validator.status(),
            ValidatorStatus::Degraded { .. }
        ));
        assert!(!validator.validate(&empty).valid);
        assert!(!validator.validate(&temp.path().join("missing")).valid);
        assert_eq!(
            validator.validate(&filled),
            Validation {
                valid: true,
                records: 0
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn tool_inventory_lines_count_as_records() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let tool = temp.path().join("fake-wgrib2");
        fs::write(
            &tool,
            "#!/bin/sh\n[ \"$1\" = -s ] || exit 2\necho '1:0:d=2025073018:TMP'\necho '2:10:d=2025073018:UGRD'\n",
        )
        .unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        let data = temp.path().join("gfs.t18z.pgrb2.0p25.f000");
        fs::write(&data, b"GRIB").unwrap();

        let validator = Wgrib2Validator::with_tool(Some(tool));
        assert_eq!(
            validator.validate(&data),
            Validation {
                valid: true,
                records: 2
            }
        );
    }
}

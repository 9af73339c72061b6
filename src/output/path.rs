//! Output naming and the resume policy
//!
//! Every dataset maps to `<output_dir>/<sanitized title>_<identifier>.csv`.
//! Data is written to a `.csv.part` sibling while the transfer is running and
//! renamed on success, so a finished `.csv` is always complete.
//!
//! # Resume policy
//!
//! - non-empty finished `.csv` and no `--force` → [`ResumeDecision::AlreadyComplete`]
//! - non-empty `.csv.part` → [`ResumeDecision::Partial`], continue after its rows
//! - otherwise → [`ResumeDecision::Fresh`]

use super::{OutputError, OutputResult};
use crate::WorkItem;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Longest title fragment kept in a file name
const MAX_TITLE_CHARS: usize = 100;

/// In-progress suffix appended to the final file name
pub const PART_SUFFIX: &str = ".part";

/// Resolved output locations of one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    /// Finished CSV
    pub final_path: PathBuf,
    /// In-progress CSV
    pub part_path: PathBuf,
}

/// What to do with existing output before a transfer starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Finished file exists, nothing to fetch
    AlreadyComplete,
    /// Partial file exists, append to it
    Partial,
    /// Start from offset 0
    Fresh,
}

impl OutputPaths {
    /// Paths for `item` inside `output_dir`
    pub fn for_item(output_dir: &Path, item: &WorkItem) -> Self {
        let final_path = output_dir.join(file_name_for(item));
        let mut part = final_path.clone().into_os_string();
        part.push(PART_SUFFIX);
        Self {
            final_path,
            part_path: PathBuf::from(part),
        }
    }

    /// File name of the finished CSV (also the blob key suffix)
    pub fn file_name(&self) -> String {
        self.final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Decide how to treat existing output
    ///
    /// With `force`, previous output of either kind is removed.
    pub fn decide(&self, force: bool) -> OutputResult<ResumeDecision> {
        if force {
            remove_if_exists(&self.final_path)?;
            remove_if_exists(&self.part_path)?;
            return Ok(ResumeDecision::Fresh);
        }

        if non_empty(&self.final_path) {
            debug!(path = %self.final_path.display(), "Finished output already present");
            return Ok(ResumeDecision::AlreadyComplete);
        }

        if non_empty(&self.part_path) {
            debug!(path = %self.part_path.display(), "Partial output found");
            return Ok(ResumeDecision::Partial);
        }

        Ok(ResumeDecision::Fresh)
    }

    /// Promote the partial file to the finished name
    pub fn finalize(&self) -> OutputResult<()> {
        std::fs::rename(&self.part_path, &self.final_path).map_err(|e| {
            OutputError::Io(format!(
                "Failed to rename {} to {}: {}",
                self.part_path.display(),
                self.final_path.display(),
                e
            ))
        })
    }
}

/// `<sanitized title>_<identifier>.csv`
pub fn file_name_for(item: &WorkItem) -> String {
    let identifier = sanitize(&item.identifier, usize::MAX);
    let title = sanitize(&item.title, MAX_TITLE_CHARS);
    match (title.is_empty(), identifier.is_empty()) {
        (true, true) => "dataset.csv".to_string(),
        (true, false) => format!("{identifier}.csv"),
        (false, true) => format!("{title}.csv"),
        (false, false) => format!("{title}_{identifier}.csv"),
    }
}

/// Replace everything but ASCII alphanumerics, `-` and `_` with `_`,
/// collapsing runs and trimming the ends
pub fn sanitize(raw: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max_chars));
    let mut last_underscore = false;

    for ch in raw.trim().chars() {
        let mapped = if ch.is_ascii_alphanumeric() || ch == '-' {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
        if out.len() >= max_chars {
            break;
        }
    }

    out.trim_matches('_').to_string()
}

fn non_empty(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn remove_if_exists(path: &Path) -> OutputResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OutputError::Io(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

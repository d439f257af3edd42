//! Transition logs: one immutable JSON record per layer movement.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::Result;
use crate::layer::{Layer, LayerOutput};

/// Outcome of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStatus {
    Success,
    Partial,
    Failed,
}

/// Audit record of one layer-to-layer data movement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionLog {
    pub transition_id: Uuid,
    pub batch_id: String,
    pub source_layer: Layer,
    pub target_layer: Layer,
    pub source_files: Vec<PathBuf>,
    pub target_file: PathBuf,
    pub row_count_in: u64,
    pub row_count_out: u64,
    pub transforms_applied: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: TransitionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl TransitionLog {
    /// Successful transition described by a layer's output.
    pub fn from_output(output: &LayerOutput, source_file: &Path, started_at: DateTime<Utc>) -> Self {
        Self {
            transition_id: Uuid::new_v4(),
            batch_id: output.batch_id.clone(),
            source_layer: output.source_layer,
            target_layer: output.target_layer,
            source_files: vec![source_file.to_path_buf()],
            target_file: output.output_path.clone(),
            row_count_in: output.row_count_in,
            row_count_out: output.row_count_out,
            transforms_applied: output.transform_names.clone(),
            started_at,
            completed_at: Utc::now(),
            status: TransitionStatus::Success,
            errors: Vec::new(),
        }
    }

    /// Table name of the target file (its stem).
    pub fn target_table(&self) -> String {
        table_stem(&self.target_file)
    }

    pub fn is_failed(&self) -> bool {
        self.status == TransitionStatus::Failed
    }

    /// `{transition_id}.json`
    pub fn file_name(&self) -> String {
        format!("{}.json", self.transition_id)
    }

    /// Write this log into `dir`. An existing log file is never replaced.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        labourlake_core::persistence::write_json_once(&path, self)?;
        Ok(path)
    }
}

/// File stem of `path`, or the whole path when it has none.
pub fn table_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Load every transition log in `dir`, oldest first.
///
/// Files that do not parse as a [`TransitionLog`] are skipped with a warning.
/// A missing directory yields no logs.
pub fn load_transition_logs(dir: &Path) -> Result<Vec<TransitionLog>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut logs = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable lineage entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let parsed = std::fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<TransitionLog>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(log) => logs.push(log),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "Skipping malformed transition log");
            }
        }
    }
    logs.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.transition_id.cmp(&b.transition_id))
    });
    Ok(logs)
}

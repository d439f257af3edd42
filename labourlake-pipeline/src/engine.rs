//! Pipeline orchestration.
//!
//! The engine owns one instance of each layer, generates the batch id at
//! ingestion and writes exactly one [`TransitionLog`] per stage it runs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use labourlake_core::PipelineConfig;
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::CatalogManager;
use crate::error::{PipelineError, Result};
use crate::frame::columnar::{META_BATCH_ID, META_TABLE};
use crate::frame::read_file_metadata;
use crate::layer::{BronzeLayer, GoldLayer, Layer, LayerOutput, Promotion, SilverLayer, StagedLayer};
use crate::models::{TransitionLog, TransitionStatus, table_stem};
use crate::transform::{SchemaDirective, TransformOp, validate_ops};

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub batch_id: String,
    pub staged_path: PathBuf,
    pub row_count: u64,
    pub log: TransitionLog,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionResult {
    pub batch_id: String,
    pub output_path: PathBuf,
    pub rows_in: u64,
    pub rows_out: u64,
    pub log: TransitionLog,
    pub log_path: PathBuf,
}

/// Outcome of [`PipelineEngine::run_full_pipeline`]. Logs are in stage
/// order: ingest, bronze, silver, gold.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    pub batch_id: String,
    pub staged_path: PathBuf,
    pub bronze_path: PathBuf,
    pub silver_path: PathBuf,
    pub gold_path: PathBuf,
    pub logs: Vec<TransitionLog>,
    pub log_paths: Vec<PathBuf>,
}

/// Runs the staged, bronze, silver and gold layers and records each move.
#[derive(Debug, Clone)]
pub struct PipelineEngine {
    config: PipelineConfig,
    staged: StagedLayer,
    bronze: BronzeLayer,
    silver: SilverLayer,
    gold: GoldLayer,
    catalog: CatalogManager,
}

/// What is known about a stage before it runs, for the failure log.
struct Attempt<'a> {
    batch_id: Option<String>,
    source_layer: Layer,
    target_layer: Layer,
    source_file: &'a Path,
    target_file: PathBuf,
    started_at: DateTime<Utc>,
}

impl PipelineEngine {
    /// Create an engine rooted at `config.data_root`, creating the lake
    /// layout if needed.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.ensure_dirs()?;
        Ok(Self {
            staged: StagedLayer::new(config.clone()),
            bronze: BronzeLayer::new(config.clone()),
            silver: SilverLayer::new(config.clone()),
            gold: GoldLayer::new(config.clone()),
            catalog: CatalogManager::new(config.clone()),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CatalogManager {
        &self.catalog
    }

    fn persist(&self, log: &TransitionLog) -> Result<PathBuf> {
        let path = log.save(&self.config.lineage_dir())?;
        tracing::info!(
            batch_id = %log.batch_id,
            transition_id = %log.transition_id,
            source_layer = log.source_layer.as_str(),
            target_layer = log.target_layer.as_str(),
            rows_in = log.row_count_in,
            rows_out = log.row_count_out,
            status = ?log.status,
            "Recorded transition"
        );
        Ok(path)
    }

    /// Persist a `failed` log when the batch is known, then hand back the
    /// original error.
    fn fail(&self, attempt: Attempt<'_>, error: PipelineError) -> PipelineError {
        let Some(batch_id) = attempt.batch_id else {
            tracing::error!(%error, "Stage failed before its batch could be identified");
            return error;
        };
        let log = TransitionLog {
            transition_id: Uuid::new_v4(),
            batch_id,
            source_layer: attempt.source_layer,
            target_layer: attempt.target_layer,
            source_files: vec![attempt.source_file.to_path_buf()],
            target_file: attempt.target_file,
            row_count_in: 0,
            row_count_out: 0,
            transforms_applied: Vec::new(),
            started_at: attempt.started_at,
            completed_at: Utc::now(),
            status: TransitionStatus::Failed,
            errors: vec![error.to_string()],
        };
        if let Err(persist_error) = self.persist(&log) {
            tracing::warn!(%persist_error, "Could not record failed transition");
        }
        error
    }

    /// Read `source_path` into `{root}/staged/{table_name}.parquet` under a
    /// fresh batch id.
    pub fn ingest(&self, source_path: &Path, table_name: &str, domain: &str) -> Result<IngestResult> {
        let batch_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let output = match self.staged.ingest(source_path, table_name, domain, &batch_id) {
            Ok(output) => output,
            Err(error) => {
                let attempt = Attempt {
                    batch_id: Some(batch_id),
                    source_layer: Layer::External,
                    target_layer: Layer::Staged,
                    source_file: source_path,
                    target_file: self.config.table_path(Layer::Staged.as_str(), table_name),
                    started_at,
                };
                return Err(self.fail(attempt, error));
            }
        };
        let log = TransitionLog::from_output(&output, source_path, started_at);
        let log_path = self.persist(&log)?;
        Ok(IngestResult {
            batch_id,
            staged_path: output.output_path,
            row_count: output.row_count_out,
            log,
            log_path,
        })
    }

    fn promote(&self, layer: Layer, input_path: &Path, run: impl FnOnce() -> Result<LayerOutput>) -> Result<PromotionResult> {
        let started_at = Utc::now();
        let output = match run() {
            Ok(output) => output,
            Err(error) => {
                let metadata = read_file_metadata(input_path).unwrap_or_default();
                let table = metadata
                    .get(META_TABLE)
                    .cloned()
                    .unwrap_or_else(|| table_stem(input_path));
                let attempt = Attempt {
                    batch_id: metadata.get(META_BATCH_ID).cloned(),
                    source_layer: layer.previous().unwrap_or(Layer::External),
                    target_layer: layer,
                    source_file: input_path,
                    target_file: self.config.table_path(layer.as_str(), &table),
                    started_at,
                };
                return Err(self.fail(attempt, error));
            }
        };
        let log = TransitionLog::from_output(&output, input_path, started_at);
        let log_path = self.persist(&log)?;
        Ok(PromotionResult {
            batch_id: output.batch_id,
            output_path: output.output_path,
            rows_in: output.row_count_in,
            rows_out: output.row_count_out,
            log,
            log_path,
        })
    }

    /// Normalise a staged table with an optional rename/cast directive.
    pub fn promote_to_bronze(&self, input_path: &Path, schema: Option<&SchemaDirective>) -> Result<PromotionResult> {
        self.promote(Layer::Bronze, input_path, || self.bronze.promote(input_path, schema))
    }

    /// Apply cleaning and validation ops to a bronze table.
    pub fn promote_to_silver(&self, input_path: &Path, transforms: &[TransformOp]) -> Result<PromotionResult> {
        self.promote(Layer::Silver, input_path, || self.silver.process(input_path, transforms))
    }

    /// Apply business ops to a silver table and refresh its catalog entry.
    pub fn promote_to_gold(&self, input_path: &Path, transforms: &[TransformOp]) -> Result<PromotionResult> {
        let result = self.promote(Layer::Gold, input_path, || self.gold.process(input_path, transforms))?;
        if let Err(error) = self.catalog.register_table(&result.output_path, Layer::Gold, None) {
            tracing::warn!(
                path = %result.output_path.display(),
                %error,
                "Could not refresh catalog entry"
            );
        }
        Ok(result)
    }

    /// Ingest and promote one source file through every layer.
    ///
    /// All op lists are validated before ingestion. The first failing stage
    /// aborts the run; later stages are not attempted.
    pub fn run_full_pipeline(
        &self,
        source_path: &Path,
        table_name: &str,
        domain: &str,
        bronze_schema: Option<&SchemaDirective>,
        silver_transforms: &[TransformOp],
        gold_transforms: &[TransformOp],
    ) -> Result<PipelineRunResult> {
        if let Some(directive) = bronze_schema {
            validate_ops(&directive.to_ops(), Layer::Bronze)?;
        }
        validate_ops(silver_transforms, Layer::Silver)?;
        validate_ops(gold_transforms, Layer::Gold)?;

        let ingest = self.ingest(source_path, table_name, domain)?;
        let bronze = self.promote_to_bronze(&ingest.staged_path, bronze_schema)?;
        let silver = self.promote_to_silver(&bronze.output_path, silver_transforms)?;
        let gold = self.promote_to_gold(&silver.output_path, gold_transforms)?;

        tracing::info!(
            batch_id = %ingest.batch_id,
            table = table_name,
            rows_in = ingest.row_count,
            rows_out = gold.rows_out,
            "Pipeline run complete"
        );
        Ok(PipelineRunResult {
            batch_id: ingest.batch_id,
            staged_path: ingest.staged_path,
            bronze_path: bronze.output_path,
            silver_path: silver.output_path,
            gold_path: gold.output_path,
            logs: vec![ingest.log, bronze.log, silver.log, gold.log],
            log_paths: vec![ingest.log_path, bronze.log_path, silver.log_path, gold.log_path],
        })
    }
}

//! The four medallion layers.
//!
//! Staged is the only layer that reads foreign formats. Bronze, silver and
//! gold each load the previous layer's parquet file, run an op list that
//! the layer allows, restamp provenance and write `{root}/{layer}/{table}.parquet`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use labourlake_core::PipelineConfig;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::frame::columnar::{META_LAYER, META_TABLE};
use crate::frame::{FileMetadata, read_parquet, write_parquet};
use crate::provenance::{self, Provenance};
use crate::source::read_source;
use crate::transform::{SchemaDirective, TransformOp, apply_ops, validate_ops};

/// A position in the pipeline.
///
/// `External` marks files that live outside the lake; it only ever appears
/// as the source of an ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    External,
    Staged,
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub const ALL: [Layer; 5] = [
        Layer::External,
        Layer::Staged,
        Layer::Bronze,
        Layer::Silver,
        Layer::Gold,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::External => "external",
            Layer::Staged => "staged",
            Layer::Bronze => "bronze",
            Layer::Silver => "silver",
            Layer::Gold => "gold",
        }
    }

    pub fn previous(&self) -> Option<Layer> {
        match self {
            Layer::External => None,
            Layer::Staged => Some(Layer::External),
            Layer::Bronze => Some(Layer::Staged),
            Layer::Silver => Some(Layer::Bronze),
            Layer::Gold => Some(Layer::Silver),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Layer::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| PipelineError::invalid_transform(format!("unknown layer '{s}'")))
    }
}

/// What every layer reports back to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerOutput {
    pub output_path: PathBuf,
    pub batch_id: String,
    pub table_name: String,
    pub source_layer: Layer,
    pub target_layer: Layer,
    pub row_count_in: u64,
    pub row_count_out: u64,
    pub transform_names: Vec<String>,
}

pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    let ok = !table.is_empty()
        && table != "."
        && table != ".."
        && !table.contains(['/', '\\'])
        && !table.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(PipelineError::invalid_transform(format!("invalid table name '{table}'")))
    }
}

/// Reads external files into the lake without altering any value.
#[derive(Debug, Clone)]
pub struct StagedLayer {
    config: PipelineConfig,
}

impl StagedLayer {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Read `source_path`, stamp provenance and write the staged table.
    pub fn ingest(&self, source_path: &Path, table_name: &str, domain: &str, batch_id: &str) -> Result<LayerOutput> {
        validate_table_name(table_name)?;
        let batch = read_source(source_path)?;
        let row_count = batch.row_count() as u64;
        let source_file = source_path.display().to_string();
        let batch = provenance::stamp_new(batch, &source_file, batch_id, Layer::Staged)?;

        let prov = Provenance {
            source_file,
            batch_id: batch_id.to_string(),
            domain: Some(domain.to_string()),
        };
        let output_path = self.config.table_path(Layer::Staged.as_str(), table_name);
        write_parquet(
            &output_path,
            &batch,
            &prov.to_metadata(table_name, Layer::Staged),
            self.config.zstd_level,
        )?;
        tracing::info!(
            batch_id,
            table = table_name,
            layer = "staged",
            rows = row_count,
            path = %output_path.display(),
            "Ingested source file"
        );
        Ok(LayerOutput {
            output_path,
            batch_id: batch_id.to_string(),
            table_name: table_name.to_string(),
            source_layer: Layer::External,
            target_layer: Layer::Staged,
            row_count_in: row_count,
            row_count_out: row_count,
            transform_names: Vec::new(),
        })
    }
}

fn table_name_of(input_path: &Path, metadata: &FileMetadata) -> Result<String> {
    if let Some(table) = metadata.get(META_TABLE) {
        return Ok(table.clone());
    }
    input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::invalid_transform(format!("no table name for {}", input_path.display())))
}

/// A forward move from one layer's parquet file to the next layer.
pub trait Promotion {
    fn layer(&self) -> Layer;

    fn config(&self) -> &PipelineConfig;

    /// Load `input_path`, apply `ops` and write this layer's table.
    ///
    /// The op list is checked against the layer before the input is read.
    fn process(&self, input_path: &Path, ops: &[TransformOp]) -> Result<LayerOutput> {
        let layer = self.layer();
        validate_ops(ops, layer)?;

        let (batch, metadata) = read_parquet(input_path)?;
        let table_name = table_name_of(input_path, &metadata)?;
        validate_table_name(&table_name)?;
        let source_layer = match metadata.get(META_LAYER) {
            Some(name) => name.parse::<Layer>()?,
            None => layer.previous().unwrap_or(Layer::External),
        };
        if source_layer >= layer || source_layer == Layer::External {
            return Err(PipelineError::invalid_transform(format!(
                "cannot promote a {source_layer} table to {layer}"
            )));
        }
        let prov = Provenance::resolve(&batch, &metadata)?;

        let row_count_in = batch.row_count() as u64;
        let (batch, transform_names) = apply_ops(batch, ops)?;
        let batch = provenance::restamp_with(batch, &prov, layer)?;
        let row_count_out = batch.row_count() as u64;

        let output_path = self.config().table_path(layer.as_str(), &table_name);
        write_parquet(
            &output_path,
            &batch,
            &prov.to_metadata(&table_name, layer),
            self.config().zstd_level,
        )?;
        tracing::info!(
            batch_id = %prov.batch_id,
            table = %table_name,
            layer = layer.as_str(),
            rows_in = row_count_in,
            rows_out = row_count_out,
            path = %output_path.display(),
            "Promoted table"
        );
        Ok(LayerOutput {
            output_path,
            batch_id: prov.batch_id,
            table_name,
            source_layer,
            target_layer: layer,
            row_count_in,
            row_count_out,
            transform_names,
        })
    }
}

/// Schema normalisation: renames and casts only.
#[derive(Debug, Clone)]
pub struct BronzeLayer {
    config: PipelineConfig,
}

impl BronzeLayer {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Apply an optional schema directive. Without one this is a passthrough
    /// plus restamping.
    pub fn promote(&self, input_path: &Path, directive: Option<&SchemaDirective>) -> Result<LayerOutput> {
        let ops = directive.map(SchemaDirective::to_ops).unwrap_or_default();
        self.process(input_path, &ops)
    }
}

impl Promotion for BronzeLayer {
    fn layer(&self) -> Layer {
        Layer::Bronze
    }

    fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Cleaning, deduplication, null handling and validation filters.
#[derive(Debug, Clone)]
pub struct SilverLayer {
    config: PipelineConfig,
}

impl SilverLayer {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

impl Promotion for SilverLayer {
    fn layer(&self) -> Layer {
        Layer::Silver
    }

    fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

/// Business derivations: derived columns, aggregation, final selection.
#[derive(Debug, Clone)]
pub struct GoldLayer {
    config: PipelineConfig,
}

impl GoldLayer {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

impl Promotion for GoldLayer {
    fn layer(&self) -> Layer {
        Layer::Gold
    }

    fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

//! Table catalog, schema directives and business glossary.
//!
//! One JSON file per table under `catalog/tables/`, regenerated wholesale
//! after every gold promotion. Transition logs are read, never written, from
//! here.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use labourlake_core::PipelineConfig;
use labourlake_core::persistence::{atomic_write_json, list_json_files, load_json};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};
use crate::frame::columnar::{META_DOMAIN, META_SOURCE_FILE, META_TABLE};
use crate::frame::{ColumnType, read_parquet};
use crate::layer::{Layer, validate_table_name};
use crate::models::{TransitionLog, load_transition_logs, table_stem};
use crate::provenance::{BATCH_ID, INGESTED_AT, LAYER, SOURCE_FILE};
use crate::transform::SchemaDirective;

const EXAMPLE_VALUES: usize = 3;

/// Reference from a column to a column of another table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyRef>,
    #[serde(default)]
    pub example_values: Vec<String>,
}

/// Catalog entry for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_name: String,
    pub layer: Layer,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub row_count: u64,
    pub column_count: u64,
    pub file_size_bytes: u64,
    pub file_path: PathBuf,
    /// SHA-256 of the parquet file at profiling time.
    #[serde(default)]
    pub file_sha256: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub source_system: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub columns: Vec<ColumnMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TableMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn matches(&self, needle: &str) -> bool {
        let hit = |s: &str| s.to_lowercase().contains(needle);
        hit(&self.table_name)
            || self.description.as_deref().is_some_and(hit)
            || self.domain.as_deref().is_some_and(hit)
            || self.tags.iter().any(|t| hit(t))
            || self.columns.iter().any(|c| hit(&c.name))
    }
}

/// A business term and the tables that carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    pub definition: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub related_tables: Vec<String>,
}

/// Compute SHA-256 hash of file contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

fn provenance_description(column: &str) -> Option<String> {
    let text = match column {
        SOURCE_FILE => "File the row was ingested from",
        INGESTED_AT => "Time the row was last written by a layer",
        BATCH_ID => "Pipeline run that produced the row",
        LAYER => "Layer the row was last written to",
        _ => return None,
    };
    Some(text.to_string())
}

fn slug(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for ch in term.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Reads and writes catalog artifacts under `{root}/catalog`.
#[derive(Debug, Clone)]
pub struct CatalogManager {
    config: PipelineConfig,
}

impl CatalogManager {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    fn table_file(&self, table: &str) -> Result<PathBuf> {
        validate_table_name(table)?;
        Ok(self.config.tables_dir().join(format!("{table}.json")))
    }

    pub fn save_table_metadata(&self, metadata: &TableMetadata) -> Result<PathBuf> {
        let path = self.table_file(&metadata.table_name)?;
        atomic_write_json(&path, metadata)?;
        tracing::debug!(table = %metadata.table_name, path = %path.display(), "Saved table metadata");
        Ok(path)
    }

    pub fn get_table_metadata(&self, table: &str) -> Result<Option<TableMetadata>> {
        let path = self.table_file(table)?;
        load_json(&path).map_err(|e| PipelineError::catalog(format!("{}: {e}", path.display())))
    }

    /// All catalogued tables, optionally restricted to one layer, by name.
    ///
    /// Unreadable entries are skipped with a warning.
    pub fn list_tables(&self, layer: Option<Layer>) -> Result<Vec<TableMetadata>> {
        let mut tables = Vec::new();
        for path in list_json_files(&self.config.tables_dir())? {
            match load_json::<TableMetadata>(&path) {
                Ok(Some(meta)) if layer.is_none_or(|l| meta.layer == l) => tables.push(meta),
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "Skipping unreadable table metadata");
                }
            }
        }
        tables.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        Ok(tables)
    }

    /// Remove a table entry; returns whether it existed.
    pub fn delete_table_metadata(&self, table: &str) -> Result<bool> {
        let path = self.table_file(table)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Profile a parquet table into a fresh [`TableMetadata`].
    ///
    /// Without an explicit `domain` the one recorded in the file is used.
    pub fn generate_table_metadata(&self, parquet_path: &Path, layer: Layer, domain: Option<&str>) -> Result<TableMetadata> {
        if !parquet_path.exists() {
            return Err(PipelineError::not_found(parquet_path.display().to_string()));
        }
        let (batch, file_meta) = read_parquet(parquet_path)?;
        let table_name = file_meta
            .get(META_TABLE)
            .cloned()
            .unwrap_or_else(|| table_stem(parquet_path));
        let schema = batch.schema();
        let columns = schema
            .columns
            .into_iter()
            .enumerate()
            .map(|(idx, col)| {
                let mut examples: Vec<String> = Vec::new();
                for row in &batch.rows {
                    if examples.len() == EXAMPLE_VALUES {
                        break;
                    }
                    let rendered = match &row[idx] {
                        serde_json::Value::Null => continue,
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    if !examples.contains(&rendered) {
                        examples.push(rendered);
                    }
                }
                ColumnMetadata {
                    description: provenance_description(&col.name),
                    name: col.name,
                    data_type: col.dtype,
                    nullable: col.nullable,
                    foreign_key: None,
                    example_values: examples,
                }
            })
            .collect();
        let now = Utc::now();
        Ok(TableMetadata {
            table_name,
            layer,
            domain: domain
                .map(str::to_string)
                .or_else(|| file_meta.get(META_DOMAIN).cloned()),
            description: None,
            row_count: batch.row_count() as u64,
            column_count: batch.column_count() as u64,
            file_size_bytes: std::fs::metadata(parquet_path)?.len(),
            file_path: parquet_path.to_path_buf(),
            file_sha256: hash_file(parquet_path)?,
            owner: None,
            source_system: file_meta.get(META_SOURCE_FILE).cloned(),
            tags: Vec::new(),
            columns,
            created_at: now,
            updated_at: now,
        })
    }

    /// Profile and save, replacing any previous entry for the table.
    pub fn register_table(&self, parquet_path: &Path, layer: Layer, domain: Option<&str>) -> Result<TableMetadata> {
        let metadata = self.generate_table_metadata(parquet_path, layer, domain)?;
        self.save_table_metadata(&metadata)?;
        tracing::info!(
            table = %metadata.table_name,
            layer = layer.as_str(),
            rows = metadata.row_count,
            "Registered table in catalog"
        );
        Ok(metadata)
    }

    /// Case-insensitive search over names, descriptions, domains, tags and
    /// column names.
    pub fn search_tables(&self, query: &str) -> Result<Vec<TableMetadata>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .list_tables(None)?
            .into_iter()
            .filter(|t| t.matches(&needle))
            .collect())
    }

    pub fn get_lineage_logs(&self) -> Result<Vec<TransitionLog>> {
        load_transition_logs(&self.config.lineage_dir())
    }

    /// Logs that read or wrote `table`.
    pub fn get_logs_for_table(&self, table: &str) -> Result<Vec<TransitionLog>> {
        Ok(self
            .get_lineage_logs()?
            .into_iter()
            .filter(|log| {
                log.target_table() == table || log.source_files.iter().any(|f| table_stem(f) == table)
            })
            .collect())
    }

    pub fn get_logs_for_batch(&self, batch_id: &str) -> Result<Vec<TransitionLog>> {
        Ok(self
            .get_lineage_logs()?
            .into_iter()
            .filter(|log| log.batch_id == batch_id)
            .collect())
    }

    pub fn save_schema_directive(&self, table: &str, directive: &SchemaDirective) -> Result<PathBuf> {
        validate_table_name(table)?;
        let path = self.config.schemas_dir().join(format!("{table}.json"));
        atomic_write_json(&path, directive)?;
        Ok(path)
    }

    pub fn load_schema_directive(&self, table: &str) -> Result<Option<SchemaDirective>> {
        validate_table_name(table)?;
        let path = self.config.schemas_dir().join(format!("{table}.json"));
        load_json(&path).map_err(|e| PipelineError::catalog(format!("{}: {e}", path.display())))
    }

    pub fn save_glossary_term(&self, term: &GlossaryTerm) -> Result<PathBuf> {
        let key = slug(&term.term);
        if key.is_empty() {
            return Err(PipelineError::catalog("glossary term must not be blank"));
        }
        let path = self.config.glossary_dir().join(format!("{key}.json"));
        atomic_write_json(&path, term)?;
        Ok(path)
    }

    pub fn get_glossary_term(&self, term: &str) -> Result<Option<GlossaryTerm>> {
        let key = slug(term);
        if key.is_empty() {
            return Ok(None);
        }
        let path = self.config.glossary_dir().join(format!("{key}.json"));
        load_json(&path).map_err(|e| PipelineError::catalog(format!("{}: {e}", path.display())))
    }

    pub fn list_glossary_terms(&self) -> Result<Vec<GlossaryTerm>> {
        let mut seen = BTreeSet::new();
        let mut terms = Vec::new();
        for path in list_json_files(&self.config.glossary_dir())? {
            if let Ok(Some(term)) = load_json::<GlossaryTerm>(&path)
                && seen.insert(term.term.clone())
            {
                terms.push(term);
            }
        }
        terms.sort_by_key(|t| t.term.to_lowercase());
        Ok(terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DataBatch, FileMetadata, write_parquet};
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    fn write_gold(config: &PipelineConfig, table: &str) -> PathBuf {
        let batch = DataBatch::from_rows(
            vec!["noc_code".into(), "title".into(), "layer".into()],
            vec![
                vec![json!("21231"), json!("Software engineers"), json!("gold")],
                vec![json!("21232"), Value::Null, json!("gold")],
            ],
        );
        let mut meta = FileMetadata::new();
        meta.insert(META_TABLE.into(), table.into());
        meta.insert(META_SOURCE_FILE.into(), "noc.csv".into());
        let path = config.table_path("gold", table);
        write_parquet(&path, &batch, &meta, 3).unwrap();
        path
    }

    #[test]
    fn test_register_profiles_table() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path());
        let catalog = CatalogManager::new(config.clone());
        let path = write_gold(&config, "noc");

        let meta = catalog.register_table(&path, Layer::Gold, Some("occupations")).unwrap();
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.column_count, 3);
        assert_eq!(meta.source_system.as_deref(), Some("noc.csv"));
        assert_eq!(meta.file_sha256, hash_file(&path).unwrap());
        let title = meta.column("title").unwrap();
        assert!(title.nullable);
        assert_eq!(title.example_values, vec!["Software engineers"]);
        assert!(meta.column("layer").unwrap().description.is_some());

        let loaded = catalog.get_table_metadata("noc").unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn test_list_search_delete() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path());
        let catalog = CatalogManager::new(config.clone());
        catalog
            .register_table(&write_gold(&config, "noc"), Layer::Gold, Some("occupations"))
            .unwrap();
        catalog
            .register_table(&write_gold(&config, "cops"), Layer::Silver, Some("projections"))
            .unwrap();

        assert_eq!(catalog.list_tables(None).unwrap().len(), 2);
        let gold = catalog.list_tables(Some(Layer::Gold)).unwrap();
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0].table_name, "noc");

        let hits = catalog.search_tables("PROJECT").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].table_name, "cops");
        assert_eq!(catalog.search_tables("noc_code").unwrap().len(), 2);

        assert!(catalog.delete_table_metadata("cops").unwrap());
        assert!(!catalog.delete_table_metadata("cops").unwrap());
        assert!(catalog.get_table_metadata("cops").unwrap().is_none());
    }

    #[test]
    fn test_schema_directive_and_glossary() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogManager::new(PipelineConfig::new(dir.path()));
        let directive = SchemaDirective::default().with_rename("Code", "noc_code");
        catalog.save_schema_directive("noc", &directive).unwrap();
        assert_eq!(catalog.load_schema_directive("noc").unwrap(), Some(directive));
        assert_eq!(catalog.load_schema_directive("oasis").unwrap(), None);

        let term = GlossaryTerm {
            term: "TEER Category".into(),
            definition: "Training, education, experience and responsibilities".into(),
            synonyms: vec!["teer".into()],
            related_tables: vec!["noc".into()],
        };
        catalog.save_glossary_term(&term).unwrap();
        assert_eq!(catalog.get_glossary_term("teer category").unwrap(), Some(term.clone()));
        assert_eq!(catalog.list_glossary_terms().unwrap(), vec![term]);
        assert!(catalog
            .save_glossary_term(&GlossaryTerm {
                term: " - ".into(),
                definition: String::new(),
                synonyms: vec![],
                related_tables: vec![],
            })
            .is_err());
    }

    #[test]
    fn test_missing_parquet_is_not_found() {
        let dir = TempDir::new().unwrap();
        let catalog = CatalogManager::new(PipelineConfig::new(dir.path()));
        let err = catalog
            .generate_table_metadata(&dir.path().join("gold/none.parquet"), Layer::Gold, None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}

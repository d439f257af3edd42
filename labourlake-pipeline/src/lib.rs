//! # labourlake-pipeline: medallion engine for labour-market tables
//!
//! Source files move through four layers, each persisted as one parquet
//! table per logical name:
//!
//! 1. **staged**: the file as read, plus provenance columns
//! 2. **bronze**: schema normalisation (renames and casts)
//! 3. **silver**: cleaning, deduplication and validation filters
//! 4. **gold**: business derivations, registered in the catalog
//!
//! Every move writes an immutable transition log; the lineage graph is
//! rebuilt from those logs on demand.

// Foundation
pub mod error;
pub mod frame;

// Inputs and row-level contracts
pub mod provenance;
pub mod source;
pub mod transform;

// Layers and orchestration
pub mod engine;
pub mod layer;
pub mod lock;
pub mod models;

// Governance
pub mod catalog;
pub mod lineage;

// Re-exports
pub use catalog::{CatalogManager, ColumnMetadata, ForeignKeyRef, GlossaryTerm, TableMetadata};
pub use engine::{IngestResult, PipelineEngine, PipelineRunResult, PromotionResult};
pub use error::{PipelineError, Result};
pub use frame::{ColumnType, DataBatch};
pub use layer::{BronzeLayer, GoldLayer, Layer, LayerOutput, Promotion, SilverLayer, StagedLayer};
pub use lineage::{LineageExport, LineageGraph, LineageNode};
pub use lock::{SerializedPipeline, TableLease, TableLockManager};
pub use models::{TransitionLog, TransitionStatus, load_transition_logs};
pub use transform::{Expr, Predicate, SchemaDirective, TransformOp};

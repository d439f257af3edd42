//! Configuration system for labourlake.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace `labourlake.toml` -> environment -> explicit overrides.
//!
//! There is no process-wide configuration. Callers load a [`LakeConfig`] once
//! and hand a clone of [`PipelineConfig`] to every component they construct.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Name of the workspace-level configuration file.
pub const WORKSPACE_CONFIG_FILE: &str = "labourlake.toml";

/// Prefix for environment overrides (`LABOURLAKE_PIPELINE__DATA_ROOT`, ...).
pub const ENV_PREFIX: &str = "LABOURLAKE_";

/// Physical layer directories under the data root, in promotion order.
pub const LAYER_DIRS: [&str; 4] = ["staged", "bronze", "silver", "gold"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LakeConfig {
    /// Data root and pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Data root plus path accessors for every artifact the pipeline writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the `staged/bronze/silver/gold/catalog` tree.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// ZSTD compression level for parquet outputs.
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
    /// Age after which an abandoned table lease may be taken over.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    /// How long to wait for a busy table lease before giving up.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    /// Poll interval while waiting for a table lease.
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            zstd_level: default_zstd_level(),
            lock_lease_secs: default_lock_lease_secs(),
            lock_wait_ms: default_lock_wait_ms(),
            lock_poll_ms: default_lock_poll_ms(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_zstd_level() -> i32 {
    3
}

fn default_lock_lease_secs() -> u64 {
    3600
}

fn default_lock_wait_ms() -> u64 {
    30_000
}

fn default_lock_poll_ms() -> u64 {
    250
}

impl PipelineConfig {
    /// Configuration rooted at `data_root` with default tuning.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }

    pub fn layer_dir(&self, layer: &str) -> PathBuf {
        self.data_root.join(layer)
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.layer_dir("staged")
    }

    pub fn bronze_dir(&self) -> PathBuf {
        self.layer_dir("bronze")
    }

    pub fn silver_dir(&self) -> PathBuf {
        self.layer_dir("silver")
    }

    pub fn gold_dir(&self) -> PathBuf {
        self.layer_dir("gold")
    }

    /// `{root}/{layer}/{table}.parquet`
    pub fn table_path(&self, layer: &str, table: &str) -> PathBuf {
        self.layer_dir(layer).join(format!("{table}.parquet"))
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.data_root.join("catalog")
    }

    /// Per-table `TableMetadata` JSON files.
    pub fn tables_dir(&self) -> PathBuf {
        self.catalog_dir().join("tables")
    }

    /// One JSON file per transition log.
    pub fn lineage_dir(&self) -> PathBuf {
        self.catalog_dir().join("lineage")
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.catalog_dir().join("schemas")
    }

    pub fn glossary_dir(&self) -> PathBuf {
        self.catalog_dir().join("glossary")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_root.join("locks")
    }

    /// Create the full directory layout under the data root.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for layer in LAYER_DIRS {
            std::fs::create_dir_all(self.layer_dir(layer))?;
        }
        for dir in [
            self.tables_dir(),
            self.lineage_dir(),
            self.schemas_dir(),
            self.glossary_dir(),
            self.locks_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive for the stderr layer.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write JSON logs to a daily-rolling file in `log_dir`.
    #[serde(default)]
    pub json_file: bool,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_file: false,
            log_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `LABOURLAKE_`, `__` separates sections)
/// 3. Workspace config (`labourlake.toml`)
/// 4. User config (`~/.config/labourlake/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&LakeConfig>,
) -> Result<LakeConfig, Box<figment::Error>> {
    let _ = dotenvy::dotenv();

    let mut figment = Figment::from(Serialized::defaults(LakeConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("ca", "labourlake", "labourlake") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG_FILE);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Write `config` as `labourlake.toml` in `workspace`, returning the path.
pub fn write_workspace_config(workspace: &Path, config: &LakeConfig) -> io::Result<PathBuf> {
    let rendered = toml::to_string_pretty(config).map_err(io::Error::other)?;
    let path = workspace.join(WORKSPACE_CONFIG_FILE);
    crate::persistence::atomic_write(&path, rendered.as_bytes())?;
    Ok(path)
}

//! Layered configuration, assembled the way `iggy-rs-iggy`'s
//! `server/src/configs/config_provider.rs` assembles its own config: built-in
//! defaults, overridden by a TOML file, overridden by environment variables
//! (`SPECTRE_`-prefixed). Where that config provider hand-walks TOML values
//! into `figment::value::Value` to support a custom merge policy, this
//! config's shape is flat enough to hand straight to `figment`'s own
//! `Serialized`/`Toml`/`Env` providers instead.

use crate::error::{Error, Result};
use crate::listener::BatcherConfig;
use crate::pipeline::PipelineConfig;
use crate::rebuild::RebuildConfig;
use crate::storage::store::StoreConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub root: PathBuf,
    pub bucket_duration_secs: u64,
    pub fsync_interval_millis: u64,
    pub expected_events_per_segment: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/segments"),
            bucket_duration_secs: 3600,
            fsync_interval_millis: 250,
            expected_events_per_segment: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    pub batch_size: usize,
    pub flush_interval_millis: u64,
    pub max_buffer: usize,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self { batch_size: 500, flush_interval_millis: 2_000, max_buffer: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub graph_max_concurrency: usize,
    pub transient_causes: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { graph_max_concurrency: 4, transient_causes: crate::core::status::default_transient_causes() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildSettings {
    pub rebuild_on_start: bool,
    pub rebuild_if_empty_only: bool,
    pub window_secs: u64,
    pub batch_size: usize,
}

impl Default for RebuildSettings {
    fn default() -> Self {
        Self { rebuild_on_start: true, rebuild_if_empty_only: true, window_secs: 24 * 3600, batch_size: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    pub uri: String,
    pub user: String,
    pub password: String,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self { uri: "bolt://127.0.0.1:7687".to_string(), user: "neo4j".to_string(), password: "neo4j".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrpcSettings {
    pub bind_addr: String,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:50051".to_string() }
    }
}

/// The fully layered configuration. `serde(default)` on every section means
/// a TOML file only needs to set the fields it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageSettings,
    pub listener: ListenerSettings,
    pub pipeline: PipelineSettings,
    pub rebuild: RebuildSettings,
    pub graph: GraphSettings,
    pub grpc: GrpcSettings,
}

impl Config {
    /// Build the defaults -> file -> env layering. `file` is optional: a
    /// missing path is not an error, matching `spec.md`'s "sane defaults
    /// with no config file present" requirement.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }
        figment = figment.merge(Env::prefixed("SPECTRE_").split("__"));
        figment.extract().map_err(|e| Error::Invariant(format!("invalid configuration: {e}")))
    }

    pub fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::new(&self.storage.root);
        config.bucket_duration_nanos = Duration::from_secs(self.storage.bucket_duration_secs).as_nanos() as i64;
        config.fsync_interval = Duration::from_millis(self.storage.fsync_interval_millis);
        config.expected_events_per_segment = self.storage.expected_events_per_segment;
        config
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            batch_size: self.listener.batch_size,
            flush_interval: Duration::from_millis(self.listener.flush_interval_millis),
            max_buffer: self.listener.max_buffer,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            transient_causes: self.pipeline.transient_causes.clone(),
            graph_max_concurrency: self.pipeline.graph_max_concurrency,
        }
    }

    pub fn rebuild_config(&self) -> RebuildConfig {
        RebuildConfig {
            rebuild_on_start: self.rebuild.rebuild_on_start,
            rebuild_if_empty_only: self.rebuild.rebuild_if_empty_only,
            window: Duration::from_secs(self.rebuild.window_secs),
            batch_size: self.rebuild.batch_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_with_no_file_present() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.grpc.bind_addr, "0.0.0.0:50051");
        assert_eq!(config.pipeline.graph_max_concurrency, 4);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectre.toml");
        std::fs::write(&path, "[grpc]\nbind_addr = \"127.0.0.1:9000\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.grpc.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.pipeline.graph_max_concurrency, 4);
    }

    #[test]
    fn env_vars_override_file_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spectre.toml");
        std::fs::write(&path, "[grpc]\nbind_addr = \"127.0.0.1:9000\"\n").unwrap();
        std::env::set_var("SPECTRE_GRPC__BIND_ADDR", "127.0.0.1:9100");
        let config = Config::load(Some(&path)).unwrap();
        std::env::remove_var("SPECTRE_GRPC__BIND_ADDR");
        assert_eq!(config.grpc.bind_addr, "127.0.0.1:9100");
    }

    #[test]
    fn missing_file_path_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/spectre.toml"))).unwrap();
        assert_eq!(config.storage.bucket_duration_secs, 3600);
    }
}

//! Configuration for the SfM service.

use crate::registry::{ConfField, ConfigRegistry, StageConf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main configuration for the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-request workspace configuration
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Configuration keys used when a request omits them
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Stage execution configuration
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Vision backend configuration
    #[serde(default)]
    pub vision: VisionConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Extra stage configurations merged over the built-in tables
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Maximum accepted request body in MiB
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Path of the reconstruction endpoint
    #[serde(default = "default_route")]
    pub route: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_upload_mb: default_max_upload_mb(),
            route: default_route(),
        }
    }
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

/// Workspace allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Parent directory for request workspaces (default: system temp dir)
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Name prefix of each workspace directory
    #[serde(default = "default_workspace_prefix")]
    pub prefix: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: None,
            prefix: default_workspace_prefix(),
        }
    }
}

impl WorkspaceConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Default stage configuration keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_retrieval_conf")]
    pub retrieval_conf: String,

    #[serde(default = "default_feature_conf")]
    pub feature_conf: String,

    #[serde(default = "default_matcher_conf")]
    pub matcher_conf: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            retrieval_conf: default_retrieval_conf(),
            feature_conf: default_feature_conf(),
            matcher_conf: default_matcher_conf(),
        }
    }
}

impl DefaultsConfig {
    pub fn key(&self, field: ConfField) -> &str {
        match field {
            ConfField::Retrieval => &self.retrieval_conf,
            ConfField::Feature => &self.feature_conf,
            ConfField::Matcher => &self.matcher_conf,
        }
    }
}

/// What to do when two uploads carry the same filename.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep both, suffixing later ones with `_1`, `_2`, ...
    #[default]
    Rename,
    /// Fail the request
    Reject,
}

/// Stage execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Upper bound on retrieval candidates per image
    #[serde(default = "default_max_num_matched")]
    pub max_num_matched: usize,

    /// Run feature extraction alongside retrieval and pair generation
    #[serde(default)]
    pub parallel_feature_extraction: bool,

    /// Deadline per stage in seconds (unset = wait indefinitely)
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,

    /// Handling of repeated upload filenames
    #[serde(default)]
    pub duplicate_filenames: DuplicatePolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_num_matched: default_max_num_matched(),
            parallel_feature_extraction: false,
            stage_timeout_secs: None,
            duplicate_filenames: DuplicatePolicy::default(),
        }
    }
}

/// Vision backend (hloc subprocess) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Python interpreter used to run the stages
    #[serde(default = "default_python")]
    pub python: String,

    /// Python package providing the stage modules
    #[serde(default = "default_vision_package")]
    pub package: String,

    /// Extra environment variables for stage processes
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            package: default_vision_package(),
            env: BTreeMap::new(),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Log a metrics line periodically
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interval_secs: default_metrics_interval(),
        }
    }
}

/// Additional stage configurations, keyed by registry key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub extractors: BTreeMap<String, StageConf>,

    #[serde(default)]
    pub matchers: BTreeMap<String, StageConf>,
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Build the stage configuration registry described by this config.
    pub fn build_registry(&self) -> ConfigRegistry {
        ConfigRegistry::builtin().with_overrides(&self.registry.extractors, &self.registry.matchers)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.server.bind_addr, e))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;

        if !self.server.route.starts_with('/') {
            anyhow::bail!("Route must start with '/': {}", self.server.route);
        }
        if self.server.max_upload_mb == 0 {
            anyhow::bail!("max_upload_mb must be > 0");
        }
        if self.pipeline.max_num_matched == 0 {
            anyhow::bail!("max_num_matched must be > 0");
        }
        if self.pipeline.stage_timeout_secs == Some(0) {
            anyhow::bail!("stage_timeout_secs must be > 0 when set");
        }
        if self.metrics.enable && self.metrics.interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0");
        }
        if self.workspace.prefix.contains(std::path::is_separator) {
            anyhow::bail!("Workspace prefix must not contain path separators");
        }
        if self.vision.python.is_empty() || self.vision.package.is_empty() {
            anyhow::bail!("Vision python and package must be set");
        }

        // Defaults must be servable, otherwise every keyless request fails
        let registry = self.build_registry();
        for field in ConfField::ALL {
            let key = self.defaults.key(field);
            if registry.resolve(key, field.family()).is_none() {
                anyhow::bail!(
                    "Default {} '{}' not found in {}",
                    field,
                    key,
                    field.family()
                );
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_bind_addr() -> String { "0.0.0.0:8000".to_string() }
fn default_max_upload_mb() -> usize { 1024 }
fn default_route() -> String { "/sfm".to_string() }
fn default_workspace_prefix() -> String { "sfm-".to_string() }
fn default_retrieval_conf() -> String { "netvlad".to_string() }
fn default_feature_conf() -> String { "superpoint_aachen".to_string() }
fn default_matcher_conf() -> String { "superpoint+lightglue".to_string() }
fn default_max_num_matched() -> usize { 5 }
fn default_python() -> String { "python3".to_string() }
fn default_vision_package() -> String { "hloc".to_string() }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 60 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.defaults.retrieval_conf, "netvlad");
        assert_eq!(config.defaults.feature_conf, "superpoint_aachen");
        assert_eq!(config.defaults.matcher_conf, "superpoint+lightglue");
        assert_eq!(config.pipeline.max_num_matched, 5);
        assert_eq!(config.pipeline.duplicate_filenames, DuplicatePolicy::Rename);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.server.route, "/sfm");
        assert!(config.pipeline.stage_timeout_secs.is_none());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
server:
  bind_addr: "127.0.0.1:9000"
pipeline:
  parallel_feature_extraction: true
  stage_timeout_secs: 600
  duplicate_filenames: reject
defaults:
  feature_conf: disk
  matcher_conf: disk+lightglue
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
        assert!(config.pipeline.parallel_feature_extraction);
        assert_eq!(config.pipeline.stage_timeout_secs, Some(600));
        assert_eq!(config.pipeline.duplicate_filenames, DuplicatePolicy::Reject);
        assert_eq!(config.defaults.key(ConfField::Feature), "disk");
        // Untouched defaults survive
        assert_eq!(config.defaults.retrieval_conf, "netvlad");
    }

    #[test]
    fn test_json_registry_extension() {
        let json = r#"{
            "defaults": {"retrieval_conf": "my_retrieval"},
            "registry": {
                "extractors": {
                    "my_retrieval": {"output": "global-feats-mine", "model": {"name": "netvlad"}}
                }
            }
        }"#;
        let config = Config::from_json(json).unwrap();
        assert!(config.validate().is_ok());

        let registry = config.build_registry();
        let conf = registry
            .resolve("my_retrieval", crate::registry::ConfFamily::Extractors)
            .unwrap();
        assert_eq!(conf.name, "my_retrieval");
        assert_eq!(conf.output, "global-feats-mine");
    }

    #[test]
    fn test_validation_invalid() {
        let mut config = Config::default();
        config.server.bind_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.max_num_matched = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stage_timeout_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.defaults.matcher_conf = "netvlad".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("match_features.confs"));
    }

    #[test]
    fn test_yaml_roundtrip_preserves_policy() {
        let mut config = Config::default();
        config.pipeline.duplicate_filenames = DuplicatePolicy::Reject;
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("duplicate_filenames: reject"));
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.pipeline.duplicate_filenames, DuplicatePolicy::Reject);
    }
}

//! Named stage configurations and request-key resolution.
//!
//! The registry is built once at startup (built-in tables plus any overrides
//! from the config file) and shared read-only between requests.

mod builtin;

use crate::config::DefaultsConfig;
use crate::error::{Result, SfmError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A resolved stage configuration object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConf {
    /// Registry key. Filled from the table key when loaded from a config file.
    #[serde(default)]
    pub name: String,

    /// Artifact name produced by the stage using this configuration
    pub output: String,

    /// Model parameters, passed through to the vision backend untouched
    #[serde(default)]
    pub model: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<serde_json::Value>,
}

impl StageConf {
    pub fn new(name: &str, output: &str, model: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
            model,
            preprocessing: None,
        }
    }

    pub fn with_preprocessing(mut self, preprocessing: serde_json::Value) -> Self {
        self.preprocessing = Some(preprocessing);
        self
    }
}

/// Table a configuration key is looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfFamily {
    Extractors,
    Matchers,
}

impl ConfFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfFamily::Extractors => "extract_features.confs",
            ConfFamily::Matchers => "match_features.confs",
        }
    }
}

impl std::fmt::Display for ConfFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request field selecting a stage configuration.
///
/// Retrieval and feature keys share the extractor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfField {
    Retrieval,
    Feature,
    Matcher,
}

impl ConfField {
    /// Validation order. The first field that fails to resolve is reported.
    pub const ALL: [ConfField; 3] = [ConfField::Retrieval, ConfField::Feature, ConfField::Matcher];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfField::Retrieval => "retrieval_conf_key",
            ConfField::Feature => "feature_conf_key",
            ConfField::Matcher => "matcher_conf_key",
        }
    }

    pub fn family(&self) -> ConfFamily {
        match self {
            ConfField::Retrieval | ConfField::Feature => ConfFamily::Extractors,
            ConfField::Matcher => ConfFamily::Matchers,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl std::fmt::Display for ConfField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration keys as supplied by a caller. Missing keys fall back to the
/// service defaults at resolution time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfKeys {
    #[serde(default)]
    pub retrieval_conf_key: Option<String>,
    #[serde(default)]
    pub feature_conf_key: Option<String>,
    #[serde(default)]
    pub matcher_conf_key: Option<String>,
}

impl ConfKeys {
    pub fn set(&mut self, field: ConfField, value: String) {
        let slot = match field {
            ConfField::Retrieval => &mut self.retrieval_conf_key,
            ConfField::Feature => &mut self.feature_conf_key,
            ConfField::Matcher => &mut self.matcher_conf_key,
        };
        *slot = Some(value);
    }

    pub fn get(&self, field: ConfField) -> Option<&str> {
        match field {
            ConfField::Retrieval => self.retrieval_conf_key.as_deref(),
            ConfField::Feature => self.feature_conf_key.as_deref(),
            ConfField::Matcher => self.matcher_conf_key.as_deref(),
        }
    }

    /// Keys set here take precedence over keys in `other`.
    pub fn or(mut self, other: ConfKeys) -> Self {
        self.retrieval_conf_key = self.retrieval_conf_key.or(other.retrieval_conf_key);
        self.feature_conf_key = self.feature_conf_key.or(other.feature_conf_key);
        self.matcher_conf_key = self.matcher_conf_key.or(other.matcher_conf_key);
        self
    }
}

/// The three resolved configurations one pipeline run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub retrieval: StageConf,
    pub feature: StageConf,
    pub matcher: StageConf,
}

/// Immutable lookup tables for every stage configuration family.
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    extractors: BTreeMap<String, StageConf>,
    matchers: BTreeMap<String, StageConf>,
}

/// Extractor confs always carry a `preprocessing` object: the extraction
/// stage reads it unconditionally.
fn normalize(family: ConfFamily, mut conf: StageConf) -> StageConf {
    if family == ConfFamily::Extractors && conf.preprocessing.is_none() {
        conf.preprocessing = Some(serde_json::json!({}));
    }
    conf
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ConfigRegistry {
    /// Build a registry from explicit tables.
    pub fn new(extractors: Vec<StageConf>, matchers: Vec<StageConf>) -> Self {
        let index = |confs: Vec<StageConf>| {
            confs
                .into_iter()
                .map(|conf| (conf.name.clone(), conf))
                .collect::<BTreeMap<_, _>>()
        };
        let extractors = extractors
            .into_iter()
            .map(|conf| normalize(ConfFamily::Extractors, conf))
            .collect();
        Self {
            extractors: index(extractors),
            matchers: index(matchers),
        }
    }

    /// Registry holding the built-in tables only.
    pub fn builtin() -> Self {
        Self::new(builtin::extractors(), builtin::matchers())
    }

    /// Merge extra tables over this registry. An existing key is replaced.
    pub fn with_overrides(
        mut self,
        extractors: &BTreeMap<String, StageConf>,
        matchers: &BTreeMap<String, StageConf>,
    ) -> Self {
        for (family, table) in [(ConfFamily::Extractors, extractors), (ConfFamily::Matchers, matchers)] {
            for (key, conf) in table {
                let mut conf = normalize(family, conf.clone());
                conf.name = key.clone();
                self.table_mut(family).insert(key.clone(), conf);
            }
        }
        self
    }

    fn table(&self, family: ConfFamily) -> &BTreeMap<String, StageConf> {
        match family {
            ConfFamily::Extractors => &self.extractors,
            ConfFamily::Matchers => &self.matchers,
        }
    }

    fn table_mut(&mut self, family: ConfFamily) -> &mut BTreeMap<String, StageConf> {
        match family {
            ConfFamily::Extractors => &mut self.extractors,
            ConfFamily::Matchers => &mut self.matchers,
        }
    }

    /// Look up `key` in `family`.
    pub fn resolve(&self, key: &str, family: ConfFamily) -> Option<&StageConf> {
        self.table(family).get(key)
    }

    /// Look up the key supplied for `field`, naming the field on failure.
    pub fn resolve_field(&self, field: ConfField, key: &str) -> Result<&StageConf> {
        self.resolve(key, field.family())
            .ok_or_else(|| SfmError::UnknownConfig {
                field,
                value: key.to_string(),
                family: field.family(),
            })
    }

    /// Resolve all three request keys, falling back to `defaults` for
    /// missing ones. Stops at the first key that does not resolve.
    pub fn resolve_request(&self, keys: &ConfKeys, defaults: &DefaultsConfig) -> Result<PipelineConfig> {
        let key_for = |field: ConfField| keys.get(field).unwrap_or_else(|| defaults.key(field));

        let retrieval = self.resolve_field(ConfField::Retrieval, key_for(ConfField::Retrieval))?;
        let feature = self.resolve_field(ConfField::Feature, key_for(ConfField::Feature))?;
        let matcher = self.resolve_field(ConfField::Matcher, key_for(ConfField::Matcher))?;

        Ok(PipelineConfig {
            retrieval: retrieval.clone(),
            feature: feature.clone(),
            matcher: matcher.clone(),
        })
    }

    /// Sorted keys of one family.
    pub fn keys(&self, family: ConfFamily) -> impl Iterator<Item = &str> {
        self.table(family).keys().map(String::as_str)
    }

    pub fn len(&self, family: ConfFamily) -> usize {
        self.table(family).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults_resolve() {
        let registry = ConfigRegistry::builtin();
        let confs = registry
            .resolve_request(&ConfKeys::default(), &DefaultsConfig::default())
            .unwrap();

        assert_eq!(confs.retrieval.name, "netvlad");
        assert_eq!(confs.retrieval.output, "global-feats-netvlad");
        assert_eq!(confs.feature.output, "feats-superpoint-n4096-r1024");
        assert_eq!(confs.matcher.output, "matches-superpoint-lightglue");
    }

    #[test]
    fn test_retrieval_and_feature_share_family() {
        let registry = ConfigRegistry::builtin();
        // A retrieval key may name any extractor, including local features
        assert!(registry.resolve("superpoint_aachen", ConfFamily::Extractors).is_some());
        assert!(registry.resolve("netvlad", ConfFamily::Extractors).is_some());
        assert!(registry.resolve("netvlad", ConfFamily::Matchers).is_none());
        assert!(registry.resolve("superglue", ConfFamily::Matchers).is_some());
    }

    #[test]
    fn test_unknown_key_names_field_and_family() {
        let registry = ConfigRegistry::builtin();
        let keys = ConfKeys {
            matcher_conf_key: Some("nope".to_string()),
            ..Default::default()
        };
        let err = registry
            .resolve_request(&keys, &DefaultsConfig::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "matcher_conf_key 'nope' not found in match_features.confs");
    }

    #[test]
    fn test_first_failure_wins() {
        let registry = ConfigRegistry::builtin();
        let keys = ConfKeys {
            retrieval_conf_key: Some("bad-retrieval".to_string()),
            feature_conf_key: Some("bad-feature".to_string()),
            matcher_conf_key: Some("bad-matcher".to_string()),
        };
        match registry.resolve_request(&keys, &DefaultsConfig::default()) {
            Err(SfmError::UnknownConfig { field, value, .. }) => {
                assert_eq!(field, ConfField::Retrieval);
                assert_eq!(value, "bad-retrieval");
            }
            other => panic!("expected UnknownConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides_replace_and_extend() {
        let mut extractors = BTreeMap::new();
        extractors.insert(
            "netvlad".to_string(),
            StageConf::new("", "global-feats-netvlad-custom", serde_json::json!({"name": "netvlad"})),
        );
        extractors.insert(
            "my_feats".to_string(),
            StageConf::new("", "feats-custom", serde_json::json!({"name": "superpoint"})),
        );

        let registry = ConfigRegistry::builtin().with_overrides(&extractors, &BTreeMap::new());

        let netvlad = registry.resolve("netvlad", ConfFamily::Extractors).unwrap();
        assert_eq!(netvlad.output, "global-feats-netvlad-custom");
        let custom = registry.resolve("my_feats", ConfFamily::Extractors).unwrap();
        assert_eq!(custom.name, "my_feats");
        assert_eq!(registry.len(ConfFamily::Matchers), 9);
    }

    #[test]
    fn test_extractor_override_gets_empty_preprocessing() {
        let mut extractors = BTreeMap::new();
        extractors.insert(
            "my".to_string(),
            StageConf::new("", "feats-my", serde_json::json!({"name": "superpoint"})),
        );
        let mut matchers = BTreeMap::new();
        matchers.insert(
            "my+nn".to_string(),
            StageConf::new("", "matches-my", serde_json::json!({"name": "nearest_neighbor"})),
        );

        let registry = ConfigRegistry::builtin().with_overrides(&extractors, &matchers);

        let conf = registry.resolve("my", ConfFamily::Extractors).unwrap();
        let json = serde_json::to_value(conf).unwrap();
        assert_eq!(json["preprocessing"], serde_json::json!({}));
        assert_eq!(json["model"]["name"], "superpoint");

        // Matchers take no preprocessing
        let matcher = registry.resolve("my+nn", ConfFamily::Matchers).unwrap();
        let json = serde_json::to_value(matcher).unwrap();
        assert!(json.get("preprocessing").is_none());
    }

    #[test]
    fn test_builtin_extractor_preprocessing_is_kept() {
        let registry = ConfigRegistry::new(
            vec![StageConf::new("bare", "feats-bare", serde_json::json!({}))],
            Vec::new(),
        );
        let conf = registry.resolve("bare", ConfFamily::Extractors).unwrap();
        assert_eq!(conf.preprocessing, Some(serde_json::json!({})));

        let builtin = ConfigRegistry::builtin();
        let sift = builtin.resolve("sift", ConfFamily::Extractors).unwrap();
        assert_eq!(
            sift.preprocessing,
            Some(serde_json::json!({"grayscale": true, "resize_max": 1600}))
        );
    }

    #[test]
    fn test_conf_keys_precedence() {
        let form = ConfKeys {
            feature_conf_key: Some("disk".to_string()),
            ..Default::default()
        };
        let query = ConfKeys {
            feature_conf_key: Some("sift".to_string()),
            matcher_conf_key: Some("NN-ratio".to_string()),
            ..Default::default()
        };
        let merged = form.or(query);
        assert_eq!(merged.get(ConfField::Feature), Some("disk"));
        assert_eq!(merged.get(ConfField::Matcher), Some("NN-ratio"));
        assert_eq!(merged.get(ConfField::Retrieval), None);
    }

    #[test]
    fn test_field_lookup_by_name() {
        assert_eq!(ConfField::from_name("matcher_conf_key"), Some(ConfField::Matcher));
        assert_eq!(ConfField::from_name("images"), None);
    }
}

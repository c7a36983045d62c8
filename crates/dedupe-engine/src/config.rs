use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dedupe_api::HttpCatalogConfig;
use dedupe_core::{IdentifierType, RetainPolicy, RunId, Scope};
use serde::Deserialize;

use crate::deduper::{DeduperOptions, DEFAULT_BATCH_SIZE};

/// Scopes to process, as listed in a targets YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetsFile {
    #[serde(default)]
    pub organizations: Vec<String>,
    #[serde(default)]
    pub harvest_sources: Vec<String>,
}

impl TargetsFile {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing targets yaml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn scopes(&self) -> Vec<Scope> {
        self.organizations
            .iter()
            .cloned()
            .map(Scope::Organization)
            .chain(self.harvest_sources.iter().cloned().map(Scope::HarvestSource))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DedupeConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub reports_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub run_id: RunId,
    /// Read-only unless explicitly committed.
    pub dry_run: bool,
    pub retain: RetainPolicy,
    pub update_name: bool,
    pub identifier_type: IdentifierType,
    pub collections_only: bool,
    pub reverse: bool,
    /// Run two engines per scope over the two halves of the identifier list.
    pub split: bool,
    pub batch_size: u64,
    /// Empty means every organization the API lists.
    pub targets: Vec<Scope>,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://catalog.data.gov".to_string(),
            api_key: None,
            user_agent: "catalog-dedupe/0.1".to_string(),
            http_timeout_secs: 60,
            reports_dir: PathBuf::from("./reports"),
            audit_dir: PathBuf::from("."),
            run_id: RunId::generate(),
            dry_run: true,
            retain: RetainPolicy::default(),
            update_name: false,
            identifier_type: IdentifierType::default(),
            collections_only: false,
            reverse: false,
            split: false,
            batch_size: DEFAULT_BATCH_SIZE,
            targets: Vec::new(),
        }
    }
}

impl DedupeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_url: std::env::var("CATALOG_API_URL").unwrap_or(defaults.api_url),
            api_key: std::env::var("CATALOG_API_KEY").ok().filter(|k| !k.is_empty()),
            user_agent: std::env::var("DEDUPE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("DEDUPE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            reports_dir: std::env::var("DEDUPE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            audit_dir: std::env::var("DEDUPE_AUDIT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.audit_dir),
            batch_size: std::env::var("DEDUPE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &u64| *v > 0)
                .unwrap_or(defaults.batch_size),
            ..defaults
        }
    }

    pub fn with_targets_file(mut self, path: &Path) -> Result<Self> {
        self.targets.extend(TargetsFile::load(path)?.scopes());
        Ok(self)
    }

    pub fn deduper_options(&self) -> DeduperOptions {
        DeduperOptions {
            run_id: self.run_id.clone(),
            retain: self.retain,
            identifier_type: self.identifier_type,
            collections_only: self.collections_only,
            update_name: self.update_name,
            reverse: self.reverse,
            batch_size: self.batch_size,
        }
    }

    pub fn http_config(&self) -> HttpCatalogConfig {
        HttpCatalogConfig {
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            dry_run: self.dry_run,
            page_size: self.batch_size,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_yaml_lists_organizations_then_harvest_sources() {
        let targets = TargetsFile::from_yaml_str(
            "organizations:\n  - epa-gov\n  - doi-gov\nharvest_sources:\n  - 5f2c\n",
        )
        .unwrap();
        assert_eq!(
            targets.scopes(),
            vec![
                Scope::Organization("epa-gov".into()),
                Scope::Organization("doi-gov".into()),
                Scope::HarvestSource("5f2c".into()),
            ]
        );
        assert!(TargetsFile::from_yaml_str("{}").unwrap().scopes().is_empty());
    }

    #[test]
    fn defaults_are_read_only_and_keep_oldest() {
        let config = DedupeConfig::default();
        assert!(config.dry_run);
        assert_eq!(config.retain, RetainPolicy::Oldest);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.http_config().timeout, Duration::from_secs(60));
        assert!(config.http_config().dry_run);

        let options = DedupeConfig {
            reverse: true,
            run_id: RunId::from("r1"),
            ..config
        }
        .deduper_options();
        assert!(options.reverse);
        assert_eq!(options.run_id.as_str(), "r1");
    }
}

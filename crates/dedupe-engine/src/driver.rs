use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dedupe_api::{CatalogApi, HttpCatalog, ReadOnly};
use dedupe_audit::{AuditSink, FileAudit};
use dedupe_core::Scope;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::DedupeConfig;
use crate::deduper::{Deduper, DeduperOptions, ScopeSummary, StopSignal};
use crate::report::{write_run_reports, RunReport};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub report: RunReport,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

/// Build the catalog client for a config. Dry runs get the read-only wrapper
/// on top of a client that itself refuses writes.
pub fn connect(config: &DedupeConfig) -> Result<Arc<dyn CatalogApi>> {
    let http = HttpCatalog::new(config.http_config()).context("building catalog client")?;
    info!(api_url = %http.api_url(), dry_run = config.dry_run, "using catalog api");
    if config.dry_run {
        Ok(Arc::new(ReadOnly::new(http)))
    } else {
        Ok(Arc::new(http))
    }
}

/// The configured scopes, or every organization the catalog lists.
pub async fn resolve_targets(api: &dyn CatalogApi, targets: &[Scope]) -> Result<Vec<Scope>> {
    if !targets.is_empty() {
        return Ok(targets.to_vec());
    }
    info!("no targets given, fetching organizations");
    let organizations = api
        .list_organizations()
        .await
        .context("listing organizations")?;
    info!(count = organizations.len(), "found organizations");
    Ok(organizations.into_iter().map(Scope::Organization).collect())
}

/// One deduplication run across all target scopes.
pub struct DedupeRun {
    config: DedupeConfig,
    api: Arc<dyn CatalogApi>,
    audit: Arc<dyn AuditSink>,
    stop: StopSignal,
}

impl DedupeRun {
    pub fn new(
        config: DedupeConfig,
        api: Arc<dyn CatalogApi>,
        audit: Arc<dyn AuditSink>,
        stop: StopSignal,
    ) -> Self {
        Self {
            config,
            api,
            audit,
            stop,
        }
    }

    pub async fn from_config(config: DedupeConfig, stop: StopSignal) -> Result<Self> {
        let api = connect(&config)?;
        let audit = FileAudit::open(
            &config.audit_dir,
            &config.run_id,
            config.api_url.clone(),
            config.identifier_type,
        )
        .await
        .context("opening audit logs")?;
        Ok(Self::new(config, api, Arc::new(audit), stop))
    }

    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        info!(
            run_id = %self.config.run_id,
            dry_run = self.config.dry_run,
            retain = ?self.config.retain,
            identifier_type = %self.config.identifier_type,
            "starting deduplication run"
        );

        let scopes = resolve_targets(self.api.as_ref(), &self.config.targets).await?;
        let mut summaries = Vec::with_capacity(scopes.len());
        for (index, scope) in scopes.iter().enumerate() {
            if self.stop.is_stopped() {
                warn!("stop requested, not starting further scopes");
                break;
            }
            info!(progress = index + 1, total = scopes.len(), scope = %scope, "deduplicating scope");
            summaries.push(self.run_scope(scope.clone()).await);
        }

        let stopped = self.stop.is_stopped() || summaries.iter().any(|s| s.stopped);
        let report = RunReport {
            run_id: self.config.run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            stopped,
            scopes: summaries,
        };
        let paths = write_run_reports(&self.config.reports_dir, &report).await?;
        info!(
            duplicates = report.total_duplicates(),
            removed = report.total_removed(),
            reports_dir = %paths.reports_dir.display(),
            "run finished"
        );

        Ok(RunSummary {
            report,
            reports_dir: paths.reports_dir.display().to_string(),
            parquet_manifest: paths.manifest.display().to_string(),
        })
    }

    async fn run_scope(&self, scope: Scope) -> ScopeSummary {
        let options = self.config.deduper_options();
        if !self.config.split {
            return Deduper::new(scope, self.api.clone(), self.audit.clone(), options, self.stop.clone())
                .dedupe()
                .await;
        }

        let mut identifiers = match self
            .api
            .list_duplicate_identifiers(&scope, options.identifier_type, options.collections_only)
            .await
        {
            Ok(identifiers) => identifiers,
            Err(err) => {
                error!(scope = %scope, error = %err, "failed to fetch duplicate identifiers for scope");
                return ScopeSummary::aborted(scope, err);
            }
        };
        if options.reverse {
            identifiers.reverse();
        }
        let second_half = identifiers.split_off(identifiers.len() / 2);
        info!(
            scope = %scope,
            first = identifiers.len(),
            second = second_half.len(),
            "splitting identifiers between two engines"
        );

        let forward = Deduper::new(
            scope.clone(),
            self.api.clone(),
            self.audit.clone(),
            DeduperOptions {
                reverse: false,
                ..options.clone()
            },
            self.stop.clone(),
        );
        let backward = Deduper::new(
            scope,
            self.api.clone(),
            self.audit.clone(),
            DeduperOptions {
                reverse: true,
                ..options
            },
            self.stop.clone(),
        );
        let (first, second) = tokio::join!(
            forward.dedupe_identifiers(identifiers),
            backward.dedupe_identifiers(second_half)
        );
        first.merge(second)
    }
}

pub async fn run_once_from_env(stop: StopSignal) -> Result<RunSummary> {
    let config = DedupeConfig::from_env();
    DedupeRun::from_config(config, stop).await?.run().await
}

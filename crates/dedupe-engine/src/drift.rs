//! Drift check between the search index and the record store.
//!
//! Every record a duplicate-group search returns is fetched directly; records
//! the store cannot show are written to a JSON lines file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dedupe_api::{CatalogApi, Group};
use dedupe_audit::DurableLog;
use dedupe_core::{IdentifierType, RunId, Scope};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::deduper::StopSignal;
use crate::pager::GroupPager;

pub fn broken_path(dir: &Path, run_id: &RunId) -> PathBuf {
    dir.join(format!("broken-datasets-{run_id}.jsonl"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftSummary {
    pub groups: usize,
    pub checked: u64,
    pub broken: u64,
    pub failed_groups: usize,
}

pub struct DriftCheck<'a> {
    api: &'a dyn CatalogApi,
    kind: IdentifierType,
    batch_size: u64,
    stop: StopSignal,
}

impl<'a> DriftCheck<'a> {
    pub fn new(api: &'a dyn CatalogApi, kind: IdentifierType, batch_size: u64, stop: StopSignal) -> Self {
        Self {
            api,
            kind,
            batch_size,
            stop,
        }
    }

    pub async fn run(&self, scopes: &[Scope], out: &Path) -> Result<DriftSummary> {
        let log = DurableLog::open(out)
            .await
            .with_context(|| format!("opening {}", out.display()))?;
        let mut summary = DriftSummary::default();
        for scope in scopes {
            if self.stop.is_stopped() {
                warn!("stop requested, ending drift check");
                break;
            }
            self.check_scope(scope, &log, &mut summary)
                .instrument(info_span!("drift", scope = %scope))
                .await?;
        }
        info!(
            checked = summary.checked,
            broken = summary.broken,
            path = %out.display(),
            "drift check finished"
        );
        Ok(summary)
    }

    async fn check_scope(&self, scope: &Scope, log: &DurableLog, summary: &mut DriftSummary) -> Result<()> {
        let identifiers = match self.api.list_duplicate_identifiers(scope, self.kind, false).await {
            Ok(identifiers) => identifiers,
            Err(err) => {
                error!(error = %err, "failed to fetch duplicate identifiers for scope");
                summary.failed_groups += 1;
                return Ok(());
            }
        };

        for entry in identifiers {
            if self.stop.is_stopped() {
                return Ok(());
            }
            summary.groups += 1;
            let group = Group::new(scope.clone(), self.kind, entry.identifier.as_str(), false);
            let mut pager = GroupPager::new(&group, entry.count, self.batch_size);
            loop {
                let page = match pager.next_page(self.api).await {
                    Ok(Some(page)) => page,
                    Ok(None) => break,
                    Err(err) => {
                        error!(identifier = %entry.identifier, error = %err, "failed to page group");
                        summary.failed_groups += 1;
                        break;
                    }
                };
                for record in page {
                    summary.checked += 1;
                    match self.api.show_record(&record.id).await {
                        Ok(_) => debug!(record_name = %record.name, "record checks out"),
                        Err(err) if err.is_record_recoverable() => {
                            error!(
                                record_id = %record.id,
                                record_name = %record.name,
                                error = %err,
                                "record is indexed but does not exist"
                            );
                            log.append_json(&record)
                                .await
                                .with_context(|| format!("writing {}", log.path().display()))?;
                            summary.broken += 1;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(())
    }
}

//! Read-only duplicate survey: how much of each scope is duplicated, across
//! both identifier types.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dedupe_api::{ApiError, CatalogApi};
use dedupe_audit::{CsvLog, SurveyRow, SURVEY_HEADER};
use dedupe_core::{IdentifierType, RunId, Scope};
use tracing::{error, info, info_span, warn, Instrument};

use crate::deduper::StopSignal;

pub fn survey_path(dir: &Path, run_id: &RunId) -> PathBuf {
    dir.join(format!("org-duplicates-{run_id}.csv"))
}

/// Count duplicates in one scope.
///
/// Groups are keyed by identifier type as well as value, so a `guid` group
/// never replaces an `identifier` group that happens to share its value.
pub async fn survey_scope(api: &dyn CatalogApi, scope: &Scope) -> Result<SurveyRow, ApiError> {
    let total_datasets = api.count_in_scope(scope).await?;

    let mut groups: BTreeMap<(IdentifierType, String), u64> = BTreeMap::new();
    for kind in [IdentifierType::Identifier, IdentifierType::Guid] {
        for entry in api.list_duplicate_identifiers(scope, kind, false).await? {
            groups.insert((kind, entry.identifier), entry.count);
        }
    }

    let total_duplicate_count: u64 = groups.values().map(|count| count.saturating_sub(1)).sum();
    let percent = total_duplicate_count as f64 / total_datasets.max(1) as f64 * 100.0;
    Ok(SurveyRow {
        name: scope.name().to_string(),
        number_datasets_duplicated: groups.len(),
        total_duplicate_count,
        total_datasets,
        percent_duplicate: (percent * 100.0).round() / 100.0,
    })
}

/// Survey every scope in order, appending one CSV row per scope.
///
/// A scope whose queries fail is logged and left out of the report.
pub async fn run_survey(
    api: &dyn CatalogApi,
    scopes: &[Scope],
    out: &Path,
    stop: &StopSignal,
) -> Result<Vec<SurveyRow>> {
    let log = CsvLog::open(out, &SURVEY_HEADER)
        .await
        .with_context(|| format!("opening {}", out.display()))?;
    info!(scopes = scopes.len(), path = %out.display(), "checking scopes for duplicates");

    let mut rows = Vec::new();
    for scope in scopes {
        if stop.is_stopped() {
            warn!("stop requested, ending survey");
            break;
        }
        let span = info_span!("survey", scope = %scope);
        match survey_scope(api, scope).instrument(span.clone()).await {
            Ok(row) => {
                info!(
                    parent: &span,
                    duplicated = row.number_datasets_duplicated,
                    duplicates = row.total_duplicate_count,
                    total = row.total_datasets,
                    percent = row.percent_duplicate,
                    "scope surveyed"
                );
                log.append_row(&row)
                    .await
                    .with_context(|| format!("writing {}", out.display()))?;
                rows.push(row);
            }
            Err(err) => error!(parent: &span, error = %err, "failed to survey scope"),
        }
    }
    Ok(rows)
}

//! Per-scope deduplication engine.
//!
//! Each identifier group moves through count -> select -> mark -> process ->
//! commit. The in-progress marker written before the first removal is what
//! lets an interrupted group resume on the next run without re-marking; group
//! counts are always re-derived from the API, never cached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dedupe_api::{ApiError, CatalogApi, DuplicateIdentifier, Group};
use dedupe_audit::{AuditError, AuditSink};
use dedupe_core::{IdentifierType, Record, RetainPolicy, RunId, Scope};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::pager::GroupPager;

pub const DEFAULT_BATCH_SIZE: u64 = 1000;

/// Cooperative cancellation shared between a driver and its engines.
///
/// Polled between identifier groups and between records; never interrupts a
/// call already in flight.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum DedupeError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl DedupeError {
    fn is_record_recoverable(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_record_recoverable())
    }

    fn is_consistency_fault(&self) -> bool {
        matches!(self, Self::Api(err) if err.is_consistency_fault())
    }
}

#[derive(Debug, Clone)]
pub struct DeduperOptions {
    pub run_id: RunId,
    pub retain: RetainPolicy,
    pub identifier_type: IdentifierType,
    pub collections_only: bool,
    /// Give the retained record a duplicate's name when that name is shorter.
    pub update_name: bool,
    /// Walk identifier groups from the end of the list.
    pub reverse: bool,
    pub batch_size: u64,
}

impl Default for DeduperOptions {
    fn default() -> Self {
        Self {
            run_id: RunId::generate(),
            retain: RetainPolicy::default(),
            identifier_type: IdentifierType::default(),
            collections_only: false,
            update_name: false,
            reverse: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupReport {
    pub retained_id: String,
    pub duplicates: u64,
    pub removed: u64,
    pub failed_removals: u64,
    pub relinked: u64,
    pub renamed_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Zero or one record; nothing to do.
    Unique { count: u64 },
    Committed(GroupReport),
    /// Stop observed mid-group; removals so far stand, retained not committed.
    Stopped(GroupReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeSummary {
    pub scope: Scope,
    pub identifiers: usize,
    pub groups_committed: usize,
    pub groups_unique: usize,
    pub groups_failed: usize,
    pub consistency_faults: usize,
    pub duplicates: u64,
    pub removed: u64,
    pub failed_removals: u64,
    pub relinked: u64,
    pub stopped: bool,
    pub aborted: Option<String>,
}

impl ScopeSummary {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            identifiers: 0,
            groups_committed: 0,
            groups_unique: 0,
            groups_failed: 0,
            consistency_faults: 0,
            duplicates: 0,
            removed: 0,
            failed_removals: 0,
            relinked: 0,
            stopped: false,
            aborted: None,
        }
    }

    pub fn aborted(scope: Scope, reason: impl ToString) -> Self {
        Self {
            aborted: Some(reason.to_string()),
            ..Self::new(scope)
        }
    }

    fn absorb(&mut self, report: &GroupReport) {
        self.duplicates += report.duplicates;
        self.removed += report.removed;
        self.failed_removals += report.failed_removals;
        self.relinked += report.relinked;
    }

    /// Combine the halves of a split run over the same scope.
    pub fn merge(mut self, other: ScopeSummary) -> Self {
        self.identifiers += other.identifiers;
        self.groups_committed += other.groups_committed;
        self.groups_unique += other.groups_unique;
        self.groups_failed += other.groups_failed;
        self.consistency_faults += other.consistency_faults;
        self.duplicates += other.duplicates;
        self.removed += other.removed;
        self.failed_removals += other.failed_removals;
        self.relinked += other.relinked;
        self.stopped |= other.stopped;
        self.aborted = self.aborted.or(other.aborted);
        self
    }
}

pub struct Deduper {
    scope: Scope,
    api: Arc<dyn CatalogApi>,
    audit: Arc<dyn AuditSink>,
    options: DeduperOptions,
    stop: StopSignal,
}

impl Deduper {
    pub fn new(
        scope: Scope,
        api: Arc<dyn CatalogApi>,
        audit: Arc<dyn AuditSink>,
        options: DeduperOptions,
        stop: StopSignal,
    ) -> Self {
        Self {
            scope,
            api,
            audit,
            options,
            stop,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn options(&self) -> &DeduperOptions {
        &self.options
    }

    /// Discover duplicate identifiers for the scope and deduplicate each group.
    pub async fn dedupe(&self) -> ScopeSummary {
        let span = info_span!("scope", scope = %self.scope, run_id = %self.options.run_id);
        async {
            debug!("fetching duplicate identifiers");
            let identifiers = match self
                .api
                .list_duplicate_identifiers(
                    &self.scope,
                    self.options.identifier_type,
                    self.options.collections_only,
                )
                .await
            {
                Ok(identifiers) => identifiers,
                Err(err) => {
                    error!(error = %err, "failed to fetch duplicate identifiers for scope");
                    return ScopeSummary::aborted(self.scope.clone(), err);
                }
            };
            info!(count = identifiers.len(), "found duplicate identifiers");
            self.dedupe_identifiers(identifiers).await
        }
        .instrument(span)
        .await
    }

    /// Deduplicate the given identifier groups in order (or reversed).
    pub async fn dedupe_identifiers(
        &self,
        mut identifiers: Vec<DuplicateIdentifier>,
    ) -> ScopeSummary {
        if self.options.reverse {
            identifiers.reverse();
        }

        let mut summary = ScopeSummary::new(self.scope.clone());
        summary.identifiers = identifiers.len();
        let total = identifiers.len();

        for (index, entry) in identifiers.iter().enumerate() {
            if self.stop.is_stopped() {
                warn!("stop requested, not starting further identifier groups");
                summary.stopped = true;
                break;
            }

            let identifier = entry.identifier.as_str();
            let span = info_span!("group", scope = %self.scope, identifier);
            info!(parent: &span, progress = index + 1, total, "deduplicating identifier");

            match self.dedupe_group(identifier).instrument(span.clone()).await {
                Ok(GroupOutcome::Unique { .. }) => summary.groups_unique += 1,
                Ok(GroupOutcome::Committed(report)) => {
                    summary.groups_committed += 1;
                    summary.absorb(&report);
                }
                Ok(GroupOutcome::Stopped(report)) => {
                    summary.absorb(&report);
                    summary.stopped = true;
                    break;
                }
                Err(err) if err.is_consistency_fault() => {
                    summary.groups_failed += 1;
                    summary.consistency_faults += 1;
                    error!(
                        parent: &span,
                        error = %err,
                        "search count disagrees with results; index may need a resync, skipping identifier"
                    );
                }
                Err(err) => {
                    summary.groups_failed += 1;
                    error!(parent: &span, error = %err, "failed to dedupe identifier");
                }
            }
        }

        info!(
            scope = %self.scope,
            duplicates = summary.duplicates,
            removed = summary.removed,
            failed = summary.groups_failed,
            "scope summary"
        );
        summary
    }

    /// Remove the duplicates of one identifier group.
    pub async fn dedupe_group(&self, identifier: &str) -> Result<GroupOutcome, DedupeError> {
        let group = Group::new(
            self.scope.clone(),
            self.options.identifier_type,
            identifier,
            self.options.collections_only,
        );

        debug!("fetching number of records for identifier");
        let count = self.api.count_in_group(&group).await?;
        info!(count, "found records");
        if count <= 1 {
            debug!("no duplicates for identifier");
            return Ok(GroupOutcome::Unique { count });
        }

        let mut retained = self
            .api
            .select_record(&group, self.options.retain.sort_order())
            .await?;
        match retained.bookkeeping.in_progress.as_deref() {
            Some(started_by) => info!(
                record_id = %retained.id,
                record_name = %retained.name,
                started_by,
                "retained record already marked, resuming"
            ),
            None => self.mark_retained(&mut retained).await?,
        }

        let mut report = GroupReport {
            retained_id: retained.id.clone(),
            ..GroupReport::default()
        };
        let mut pending_name: Option<String> = None;
        let mut pager = GroupPager::new(&group, count, self.options.batch_size);
        // Read-only clients accept removals without shrinking the index.
        let removals_shift_pages = !self.api.is_read_only();

        while let Some(page) = pager.next_page(self.api.as_ref()).await? {
            for record in page {
                if self.stop.is_stopped() {
                    warn!(
                        retained_id = %retained.id,
                        removed = report.removed,
                        dropped_rename = pending_name.as_deref().unwrap_or("<none>"),
                        "stop requested, leaving group uncommitted and dropping any pending rename"
                    );
                    return Ok(GroupOutcome::Stopped(report));
                }

                if !self.scope.contains(&record) {
                    warn!(
                        owner = self.scope.owner_of(&record).unwrap_or("<none>"),
                        record_id = %record.id,
                        record_name = %record.name,
                        "record matched identifier but is outside scope, skipping"
                    );
                    continue;
                }

                if record.id == retained.id {
                    debug!(record_id = %record.id, "retained record, not removing");
                    continue;
                }

                report.duplicates += 1;
                let removed = self
                    .remove_duplicate(&record, &mut retained, &mut pending_name, &mut report)
                    .await?;
                if removed && removals_shift_pages {
                    pager.record_removed();
                }
            }
        }

        report.renamed_to = pending_name.clone();
        self.commit_retained(&mut retained, pending_name).await?;
        Ok(GroupOutcome::Committed(report))
    }

    /// Stamp the retained record as in progress before anything is removed.
    async fn mark_retained(&self, retained: &mut Record) -> Result<(), DedupeError> {
        info!(
            record_id = %retained.id,
            record_name = %retained.name,
            "marking retained record for idempotency"
        );
        retained.mark_in_progress(&self.options.run_id);
        self.api.update_record(retained).await?;
        Ok(())
    }

    /// Clear the in-progress marker, stamp the run and apply a pending rename.
    async fn commit_retained(
        &self,
        retained: &mut Record,
        rename: Option<String>,
    ) -> Result<(), DedupeError> {
        if let Some(name) = rename {
            info!(record_id = %retained.id, from = %retained.name, to = %name, "renaming retained record");
            // The retained record's previous name disappears from the catalog.
            self.audit.record_removed(retained).await?;
            retained.name = name;
        }
        retained.commit_retained(&self.options.run_id);
        info!(record_id = %retained.id, record_name = %retained.name, "committing retained record");
        self.api.update_record(retained).await?;
        Ok(())
    }

    /// Returns whether the duplicate was removed.
    async fn remove_duplicate(
        &self,
        duplicate: &Record,
        retained: &mut Record,
        pending_name: &mut Option<String>,
        report: &mut GroupReport,
    ) -> Result<bool, DedupeError> {
        info!(record_id = %duplicate.id, record_name = %duplicate.name, "removing duplicate");
        self.audit.record_removed(duplicate).await?;
        self.audit
            .record_duplicate(self.scope.name(), duplicate, retained)
            .await?;

        match self.relink_members(duplicate, retained).await {
            Ok(relinked) => report.relinked += relinked,
            Err(err) if err.is_record_recoverable() => {
                error!(
                    record_id = %duplicate.id,
                    record_name = %duplicate.name,
                    error = %err,
                    "failed to relink collection members, leaving duplicate in place"
                );
                report.failed_removals += 1;
                return Ok(false);
            }
            Err(err) => return Err(err),
        }

        match self.api.remove_record(&duplicate.id).await {
            Ok(()) => report.removed += 1,
            Err(err) if err.is_record_recoverable() => {
                error!(
                    record_id = %duplicate.id,
                    record_name = %duplicate.name,
                    error = %err,
                    "failed to remove duplicate"
                );
                report.failed_removals += 1;
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        if self.options.update_name {
            harmonize_name(duplicate, retained, pending_name);
        }
        Ok(true)
    }

    /// Point every collection member of `duplicate` at the retained record.
    async fn relink_members(
        &self,
        duplicate: &Record,
        retained: &mut Record,
    ) -> Result<u64, DedupeError> {
        let members = self.api.list_collection_members(&duplicate.id).await?;
        let retained_id = retained.id.clone();
        let mut relinked = 0;

        for mut member in members {
            if member.id == duplicate.id {
                continue;
            }
            // The retained copy in memory is written back at commit, so it has
            // to carry the new pointer itself.
            let target = if member.id == retained_id {
                &mut *retained
            } else {
                &mut member
            };
            let from = target
                .relink_collection(&retained_id)
                .unwrap_or_else(|| duplicate.id.clone());
            info!(
                record_id = %target.id,
                record_name = %target.name,
                from = %from,
                to = %retained_id,
                "relinking collection member"
            );
            self.api.update_record(target).await?;
            self.audit.record_relink(target, &from, &retained_id).await?;
            relinked += 1;
        }
        Ok(relinked)
    }

}

/// Queue the duplicate's name for the retained record when it is shorter.
/// Nothing is written until commit.
fn harmonize_name(duplicate: &Record, retained: &Record, pending_name: &mut Option<String>) {
    let current = pending_name.as_deref().unwrap_or(retained.name.as_str());
    if duplicate.name.len() >= current.len() {
        return;
    }
    info!(
        record_id = %retained.id,
        from = %current,
        to = %duplicate.name,
        "retained record will take the shorter duplicate name"
    );
    *pending_name = Some(duplicate.name.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_is_shared_between_clones() {
        let stop = StopSignal::new();
        let engine_side = stop.clone();
        assert!(!engine_side.is_stopped());
        stop.stop();
        assert!(engine_side.is_stopped());
    }

    #[test]
    fn split_summaries_merge() {
        let scope = Scope::Organization("epa-gov".into());
        let mut a = ScopeSummary::new(scope.clone());
        a.identifiers = 3;
        a.removed = 4;
        let mut b = ScopeSummary::aborted(scope, "boom");
        b.identifiers = 2;
        b.stopped = true;
        let merged = a.merge(b);
        assert_eq!(merged.identifiers, 5);
        assert_eq!(merged.removed, 4);
        assert!(merged.stopped);
        assert_eq!(merged.aborted.as_deref(), Some("boom"));
    }

    #[test]
    fn only_transport_and_api_faults_are_record_recoverable() {
        let status = DedupeError::Api(ApiError::Status {
            status: 500,
            url: "u".into(),
            body: String::new(),
        });
        let dry = DedupeError::Api(ApiError::DryRun {
            method: "POST".into(),
            action: "package_delete".into(),
        });
        let mismatch = DedupeError::Api(ApiError::CountMismatch {
            identifier: "x".into(),
            count: 2,
        });
        assert!(status.is_record_recoverable());
        assert!(!dry.is_record_recoverable());
        assert!(mismatch.is_consistency_fault());
    }
}

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dedupe_api::{ApiError, CatalogApi, DuplicateIdentifier, Group};
use dedupe_audit::{AuditError, AuditSink};
use dedupe_core::{IdentifierType, Record, Scope, SortOrder};
use dedupe_engine::StopSignal;

pub fn dataset(id: &str, name: &str, org: &str, identifier: &str, created: &str) -> Record {
    Record::new(id, name)
        .with_title(format!("Title of {name}"))
        .with_organization(org)
        .with_created(created)
        .with_extra("identifier", identifier)
}

#[derive(Default)]
pub struct CatalogState {
    /// Index order; what searches return before sorting.
    pub records: Vec<Record>,
    pub organizations: Vec<String>,
    pub removed: Vec<String>,
    pub updates: Vec<Record>,
    pub fail_remove: BTreeSet<String>,
    /// Identifiers whose count request fails with a server error.
    pub fail_count: BTreeSet<String>,
    /// Record ids whose collection member listing fails with a server error.
    pub fail_members: BTreeSet<String>,
    /// Identifiers whose search counts matches but returns no rows.
    pub drifted: BTreeSet<String>,
    pub unshowable: BTreeSet<String>,
    /// Page searches ignore the scope filter, so records of another
    /// organization that share the identifier show up in group pages.
    pub leak_scope: bool,
    pub stop_after_removals: Option<(usize, StopSignal)>,
}

/// In-memory catalog backing the scenario tests.
#[derive(Default)]
pub struct FakeCatalog {
    state: Mutex<CatalogState>,
}

impl FakeCatalog {
    pub fn with_records(records: Vec<Record>) -> Arc<Self> {
        let mut organizations = records
            .iter()
            .filter_map(|r| r.organization_name().map(str::to_string))
            .collect::<Vec<_>>();
        organizations.sort();
        organizations.dedup();
        Arc::new(Self {
            state: Mutex::new(CatalogState {
                records,
                organizations,
                ..CatalogState::default()
            }),
        })
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn updates(&self) -> Vec<Record> {
        self.state().updates.clone()
    }

    pub fn record(&self, id: &str) -> Option<Record> {
        self.state().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.state().records.iter().map(|r| r.id.clone()).collect()
    }
}

fn in_group(group: &Group, record: &Record, scoped: bool) -> bool {
    record.external_identifier(group.kind) == Some(group.identifier.as_str())
        && (!group.collections_only || record.is_collection())
        && (!scoped || group.scope.contains(record))
}

fn group_records(state: &CatalogState, group: &Group, scoped: bool) -> Vec<Record> {
    state
        .records
        .iter()
        .filter(|r| in_group(group, r, scoped))
        .cloned()
        .collect()
}

fn server_error(action: &str) -> ApiError {
    ApiError::Status {
        status: 500,
        url: format!("fake://{action}"),
        body: "Internal Server Error".to_string(),
    }
}

fn not_found(record_id: &str) -> ApiError {
    ApiError::Status {
        status: 404,
        url: format!("fake://package_show?id={record_id}"),
        body: "Not found".to_string(),
    }
}

#[async_trait]
impl CatalogApi for FakeCatalog {
    async fn count_in_group(&self, group: &Group) -> Result<u64, ApiError> {
        let state = self.state();
        if state.fail_count.contains(&group.identifier) {
            return Err(server_error("package_search"));
        }
        Ok(group_records(&state, group, true).len() as u64)
    }

    async fn select_record(&self, group: &Group, sort: SortOrder) -> Result<Record, ApiError> {
        let state = self.state();
        let mut records = group_records(&state, group, true);
        if state.drifted.contains(&group.identifier) || records.is_empty() {
            return Err(ApiError::CountMismatch {
                identifier: group.identifier.clone(),
                count: records.len() as u64,
            });
        }
        records.sort_by(|a, b| a.metadata_created.cmp(&b.metadata_created));
        if sort == SortOrder::CreatedDesc {
            records.reverse();
        }
        Ok(records.remove(0))
    }

    async fn list_duplicate_identifiers(
        &self,
        scope: &Scope,
        kind: IdentifierType,
        collections_only: bool,
    ) -> Result<Vec<DuplicateIdentifier>, ApiError> {
        let state = self.state();
        let mut order = Vec::new();
        let mut counts: HashMap<String, u64> = HashMap::new();
        for record in &state.records {
            if !scope.contains(record) || (collections_only && !record.is_collection()) {
                continue;
            }
            if let Some(identifier) = record.external_identifier(kind) {
                let count = counts.entry(identifier.to_string()).or_insert(0);
                if *count == 0 {
                    order.push(identifier.to_string());
                }
                *count += 1;
            }
        }
        Ok(order
            .into_iter()
            .filter_map(|identifier| {
                let count = counts[&identifier];
                (count > 1).then_some(DuplicateIdentifier { identifier, count })
            })
            .collect())
    }

    async fn page_records(
        &self,
        group: &Group,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError> {
        let state = self.state();
        if state.drifted.contains(&group.identifier) {
            return Ok(Vec::new());
        }
        Ok(group_records(&state, group, !state.leak_scope)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn list_collection_members(&self, record_id: &str) -> Result<Vec<Record>, ApiError> {
        let state = self.state();
        if state.fail_members.contains(record_id) {
            return Err(server_error("package_search"));
        }
        Ok(state
            .records
            .iter()
            .filter(|r| r.collection_package_id() == Some(record_id))
            .cloned()
            .collect())
    }

    async fn update_record(&self, record: &Record) -> Result<(), ApiError> {
        let mut state = self.state();
        match state.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => return Err(not_found(&record.id)),
        }
        state.updates.push(record.clone());
        Ok(())
    }

    async fn remove_record(&self, record_id: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        if state.fail_remove.contains(record_id) {
            return Err(server_error("package_delete"));
        }
        state.records.retain(|r| r.id != record_id);
        state.removed.push(record_id.to_string());
        if let Some((after, stop)) = &state.stop_after_removals {
            if state.removed.len() >= *after {
                stop.stop();
            }
        }
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.state().organizations.clone())
    }

    async fn count_in_scope(&self, scope: &Scope) -> Result<u64, ApiError> {
        let state = self.state();
        Ok(state.records.iter().filter(|r| scope.contains(r)).count() as u64)
    }

    async fn show_record(&self, record_id: &str) -> Result<Record, ApiError> {
        let state = self.state();
        if state.unshowable.contains(record_id) {
            return Err(not_found(record_id));
        }
        state
            .records
            .iter()
            .find(|r| r.id == record_id)
            .cloned()
            .ok_or_else(|| not_found(record_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateEntry {
    pub organization: String,
    pub duplicate_id: String,
    pub retained_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelinkEntry {
    pub member_id: String,
    pub from_id: String,
    pub to_id: String,
}

#[derive(Default)]
pub struct RecordingAudit {
    pub removed: Mutex<Vec<Record>>,
    pub duplicates: Mutex<Vec<DuplicateEntry>>,
    pub relinks: Mutex<Vec<RelinkEntry>>,
}

impl RecordingAudit {
    pub fn removed_ids(&self) -> Vec<String> {
        self.removed.lock().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    pub fn removed_names(&self) -> Vec<String> {
        self.removed.lock().unwrap().iter().map(|r| r.name.clone()).collect()
    }

    pub fn duplicates(&self) -> Vec<DuplicateEntry> {
        self.duplicates.lock().unwrap().clone()
    }

    pub fn relinks(&self) -> Vec<RelinkEntry> {
        self.relinks.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record_removed(&self, record: &Record) -> Result<(), AuditError> {
        self.removed.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn record_duplicate(
        &self,
        organization: &str,
        duplicate: &Record,
        retained: &Record,
    ) -> Result<(), AuditError> {
        self.duplicates.lock().unwrap().push(DuplicateEntry {
            organization: organization.to_string(),
            duplicate_id: duplicate.id.clone(),
            retained_id: retained.id.clone(),
        });
        Ok(())
    }

    async fn record_relink(
        &self,
        member: &Record,
        from_id: &str,
        to_id: &str,
    ) -> Result<(), AuditError> {
        self.relinks.lock().unwrap().push(RelinkEntry {
            member_id: member.id.clone(),
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
        });
        Ok(())
    }
}

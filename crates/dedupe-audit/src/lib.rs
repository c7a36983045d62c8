//! Append-only audit trail for deduplication runs.
//!
//! Every append is flushed and synced before returning so a crash right after
//! a removal still leaves a durable record for manual reconciliation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dedupe_core::{IdentifierType, Record, RunId};
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "dedupe-audit";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding csv row: {0}")]
    Csv(#[from] csv::Error),
    #[error("encoding json line: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AuditError + '_ {
    move |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_removed(&self, record: &Record) -> Result<(), AuditError>;

    async fn record_duplicate(
        &self,
        organization: &str,
        duplicate: &Record,
        retained: &Record,
    ) -> Result<(), AuditError>;

    async fn record_relink(
        &self,
        member: &Record,
        from_id: &str,
        to_id: &str,
    ) -> Result<(), AuditError>;
}

#[derive(Debug, Default)]
pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    async fn record_removed(&self, _record: &Record) -> Result<(), AuditError> {
        Ok(())
    }

    async fn record_duplicate(
        &self,
        _organization: &str,
        _duplicate: &Record,
        _retained: &Record,
    ) -> Result<(), AuditError> {
        Ok(())
    }

    async fn record_relink(
        &self,
        _member: &Record,
        _from_id: &str,
        _to_id: &str,
    ) -> Result<(), AuditError> {
        Ok(())
    }
}

/// A file opened for appending whose writes are synced to disk.
#[derive(Debug)]
pub struct DurableLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl DurableLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err(&path))?;
        info!(path = %path.display(), "opened audit log for writing");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_empty(&self) -> Result<bool, AuditError> {
        let file = self.file.lock().await;
        let meta = file.metadata().await.map_err(io_err(&self.path))?;
        Ok(meta.len() == 0)
    }

    pub async fn append(&self, bytes: &[u8]) -> Result<(), AuditError> {
        let mut file = self.file.lock().await;
        file.write_all(bytes).await.map_err(io_err(&self.path))?;
        file.flush().await.map_err(io_err(&self.path))?;
        file.sync_all().await.map_err(io_err(&self.path))?;
        Ok(())
    }

    pub async fn append_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.append(&line).await
    }
}

/// CSV report with a header row written once per file.
#[derive(Debug)]
pub struct CsvLog {
    log: DurableLog,
}

impl CsvLog {
    pub async fn open(path: impl Into<PathBuf>, header: &[&str]) -> Result<Self, AuditError> {
        let log = DurableLog::open(path).await?;
        if log.is_empty().await? {
            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(header)?;
            log.append(&finish(writer)?).await?;
        }
        Ok(Self { log })
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub async fn append_row<T: Serialize>(&self, row: &T) -> Result<(), AuditError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.serialize(row)?;
        self.log.append(&finish(writer)?).await
    }
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, AuditError> {
    writer
        .into_inner()
        .map_err(|err| AuditError::Csv(err.into_error().into()))
}

/// Column order of the duplicate report.
pub const DUPLICATE_REPORT_HEADER: [&str; 15] = [
    "organization",
    "duplicate_id",
    "duplicate_title",
    "duplicate_name",
    "duplicate_url",
    "duplicate_metadata_created",
    "duplicate_identifier",
    "duplicate_source_hash",
    "duplicate_is_collection",
    "duplicate_is_collection_member",
    "duplicate_harvest_source",
    "retained_id",
    "retained_url",
    "retained_metadata_created",
    "retained_harvest_source",
];

/// Correlates one removed duplicate with the record kept in its place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateRow {
    pub organization: String,
    pub duplicate_id: String,
    pub duplicate_title: String,
    pub duplicate_name: String,
    pub duplicate_url: String,
    pub duplicate_metadata_created: String,
    pub duplicate_identifier: String,
    pub duplicate_source_hash: String,
    pub duplicate_is_collection: bool,
    pub duplicate_is_collection_member: bool,
    pub duplicate_harvest_source: String,
    pub retained_id: String,
    pub retained_url: String,
    pub retained_metadata_created: String,
    pub retained_harvest_source: String,
}

impl DuplicateRow {
    pub fn new(
        site_url: &str,
        kind: IdentifierType,
        organization: &str,
        duplicate: &Record,
        retained: &Record,
    ) -> Self {
        Self {
            organization: duplicate
                .organization_name()
                .unwrap_or(organization)
                .to_string(),
            duplicate_id: duplicate.id.clone(),
            duplicate_title: duplicate.title.clone().unwrap_or_default(),
            duplicate_name: duplicate.name.clone(),
            duplicate_url: dataset_url(site_url, &duplicate.name),
            duplicate_metadata_created: owned(duplicate.metadata_created.as_deref()),
            duplicate_identifier: owned(duplicate.external_identifier(kind)),
            duplicate_source_hash: owned(duplicate.source_hash()),
            duplicate_is_collection: duplicate.is_collection(),
            duplicate_is_collection_member: duplicate.is_collection_member(),
            duplicate_harvest_source: owned(duplicate.harvest_source_id()),
            retained_id: retained.id.clone(),
            retained_url: dataset_url(site_url, &retained.name),
            retained_metadata_created: owned(retained.metadata_created.as_deref()),
            retained_harvest_source: owned(retained.harvest_source_id()),
        }
    }
}

fn owned(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

pub fn dataset_url(site_url: &str, name: &str) -> String {
    format!("{}/dataset/{}", site_url.trim_end_matches('/'), name)
}

#[derive(Debug, Clone, Serialize)]
struct RelinkEntry<'a> {
    run_id: &'a str,
    member_id: &'a str,
    member_name: &'a str,
    from_collection: &'a str,
    to_collection: &'a str,
}

/// File-backed audit trail: removed records, duplicate report and collection
/// re-links, one file each per run.
#[derive(Debug)]
pub struct FileAudit {
    run_id: RunId,
    site_url: String,
    kind: IdentifierType,
    removed: DurableLog,
    duplicates: CsvLog,
    relinks: DurableLog,
}

impl FileAudit {
    pub async fn open(
        dir: impl AsRef<Path>,
        run_id: &RunId,
        site_url: impl Into<String>,
        kind: IdentifierType,
    ) -> Result<Self, AuditError> {
        let dir = dir.as_ref();
        let removed = DurableLog::open(dir.join(format!("removed-packages-{run_id}.log"))).await?;
        let duplicates = CsvLog::open(
            dir.join(format!("duplicate-packages-{run_id}.csv")),
            &DUPLICATE_REPORT_HEADER,
        )
        .await?;
        let relinks =
            DurableLog::open(dir.join(format!("collection-packages-{run_id}.log"))).await?;
        Ok(Self {
            run_id: run_id.clone(),
            site_url: site_url.into(),
            kind,
            removed,
            duplicates,
            relinks,
        })
    }

    pub fn paths(&self) -> [&Path; 3] {
        [self.removed.path(), self.duplicates.path(), self.relinks.path()]
    }
}

#[async_trait]
impl AuditSink for FileAudit {
    async fn record_removed(&self, record: &Record) -> Result<(), AuditError> {
        debug!(record_id = %record.id, "saving record to removed log");
        self.removed.append_json(record).await
    }

    async fn record_duplicate(
        &self,
        organization: &str,
        duplicate: &Record,
        retained: &Record,
    ) -> Result<(), AuditError> {
        debug!(record_id = %duplicate.id, "recording duplicate to report");
        let row = DuplicateRow::new(&self.site_url, self.kind, organization, duplicate, retained);
        self.duplicates.append_row(&row).await
    }

    async fn record_relink(
        &self,
        member: &Record,
        from_id: &str,
        to_id: &str,
    ) -> Result<(), AuditError> {
        debug!(record_id = %member.id, from_id, to_id, "recording collection relink");
        self.relinks
            .append_json(&RelinkEntry {
                run_id: self.run_id.as_str(),
                member_id: &member.id,
                member_name: &member.name,
                from_collection: from_id,
                to_collection: to_id,
            })
            .await
    }
}

/// Column order of the organization duplicate survey.
pub const SURVEY_HEADER: [&str; 5] = [
    "name",
    "number_datasets_duplicated",
    "total_duplicate_count",
    "total_datasets",
    "percent_duplicate",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyRow {
    pub name: String,
    pub number_datasets_duplicated: usize,
    pub total_duplicate_count: u64,
    pub total_datasets: u64,
    pub percent_duplicate: f64,
}

//! Per-run report directory: `summary.md`, `summary.json` and a parquet
//! snapshot of the scope summaries with its sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use dedupe_core::RunId;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::deduper::ScopeSummary;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub stopped: bool,
    pub scopes: Vec<ScopeSummary>,
}

impl RunReport {
    /// Counted even for groups that later failed.
    pub fn total_duplicates(&self) -> u64 {
        self.scopes.iter().map(|s| s.duplicates).sum()
    }

    pub fn total_removed(&self) -> u64 {
        self.scopes.iter().map(|s| s.removed).sum()
    }

    pub fn failed_groups(&self) -> usize {
        self.scopes.iter().map(|s| s.groups_failed).sum()
    }

    pub fn aborted_scopes(&self) -> usize {
        self.scopes.iter().filter(|s| s.aborted.is_some()).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub reports_dir: PathBuf,
    pub manifest: PathBuf,
}

/// Write `<reports_root>/<run_id>/` for a finished run.
pub async fn write_run_reports(reports_root: &Path, report: &RunReport) -> Result<ReportPaths> {
    let reports_dir = reports_root.join(report.run_id.as_str());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    write_atomic(&reports_dir.join("summary.md"), render_markdown(report).as_bytes()).await?;
    let json = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    write_atomic(&reports_dir.join("summary.json"), &json).await?;

    let manifest = export_parquet_snapshot(&reports_dir, &report.scopes).await?;
    Ok(ReportPaths {
        reports_dir,
        manifest,
    })
}

pub fn render_markdown(report: &RunReport) -> String {
    let mode = if report.dry_run { "dry-run" } else { "commit" };
    let rows = report
        .scopes
        .iter()
        .map(|s| {
            let status = match (&s.aborted, s.stopped) {
                (Some(reason), _) => format!("aborted: {reason}"),
                (None, true) => "stopped".to_string(),
                (None, false) => "ok".to_string(),
            };
            format!(
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                s.scope,
                s.identifiers,
                s.groups_committed,
                s.groups_failed,
                s.duplicates,
                s.removed,
                s.relinked,
                status
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Catalog Dedupe Run\n\n- Run ID: `{}`\n- Mode: {}\n- Started: {}\n- Finished: {}\n- Stopped early: {}\n- Duplicates found: {}\n- Records removed: {}\n- Failed groups: {}\n\n## Scopes\n\n| scope | identifiers | committed | failed | duplicates | removed | relinked | status |\n|---|---|---|---|---|---|---|---|\n{}\n",
        report.run_id,
        mode,
        report.started_at,
        report.finished_at,
        report.stopped,
        report.total_duplicates(),
        report.total_removed(),
        report.failed_groups(),
        rows
    )
}

async fn export_parquet_snapshot(reports_dir: &Path, scopes: &[ScopeSummary]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let scopes_path = snapshot_dir.join("scopes.parquet");
    write_scopes_parquet(&scopes_path, scopes)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("scopes", reports_dir, &scopes_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    write_atomic(&manifest_path, &bytes).await?;
    Ok(manifest_path)
}

/// Temp file in the target directory, then rename over the destination.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("creating temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_scopes_parquet(path: &Path, scopes: &[ScopeSummary]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("scope_kind", DataType::Utf8, false),
        ArrowField::new("scope_name", DataType::Utf8, false),
        ArrowField::new("identifiers", DataType::UInt64, false),
        ArrowField::new("groups_committed", DataType::UInt64, false),
        ArrowField::new("groups_failed", DataType::UInt64, false),
        ArrowField::new("consistency_faults", DataType::UInt64, false),
        ArrowField::new("duplicates", DataType::UInt64, false),
        ArrowField::new("removed", DataType::UInt64, false),
        ArrowField::new("failed_removals", DataType::UInt64, false),
        ArrowField::new("relinked", DataType::UInt64, false),
        ArrowField::new("stopped", DataType::Boolean, false),
        ArrowField::new("aborted", DataType::Utf8, true),
    ]));

    let kinds = StringArray::from(scopes.iter().map(|s| Some(s.scope.kind())).collect::<Vec<_>>());
    let names = StringArray::from(
        scopes
            .iter()
            .map(|s| Some(s.scope.name()))
            .collect::<Vec<_>>(),
    );
    let counts = |f: fn(&ScopeSummary) -> u64| {
        Arc::new(UInt64Array::from(scopes.iter().map(f).collect::<Vec<_>>()))
    };
    let stopped = BooleanArray::from(scopes.iter().map(|s| s.stopped).collect::<Vec<_>>());
    let aborted = StringArray::from(
        scopes
            .iter()
            .map(|s| s.aborted.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(kinds),
            Arc::new(names),
            counts(|s| s.identifiers as u64),
            counts(|s| s.groups_committed as u64),
            counts(|s| s.groups_failed as u64),
            counts(|s| s.consistency_faults as u64),
            counts(|s| s.duplicates),
            counts(|s| s.removed),
            counts(|s| s.failed_removals),
            counts(|s| s.relinked),
            Arc::new(stopped),
            Arc::new(aborted),
        ],
    )
    .context("building scopes record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

mod support;

use std::sync::Arc;

use dedupe_core::{IdentifierType, RunId, Scope};
use dedupe_engine::{
    broken_path, run_survey, survey_path, survey_scope, DedupeConfig, DedupeRun, DriftCheck,
    StopSignal,
};
use support::{dataset, FakeCatalog, RecordingAudit};

fn config(reports_dir: &std::path::Path, run_id: &str) -> DedupeConfig {
    DedupeConfig {
        reports_dir: reports_dir.to_path_buf(),
        audit_dir: reports_dir.to_path_buf(),
        run_id: RunId::from(run_id),
        dry_run: false,
        ..DedupeConfig::default()
    }
}

fn two_organizations() -> Vec<dedupe_core::Record> {
    vec![
        dataset("e1", "epa-one", "epa-gov", "E", "2019-01-01T00:00:00"),
        dataset("e2", "epa-one-1", "epa-gov", "E", "2020-01-01T00:00:00"),
        dataset("d1", "doi-one", "doi-gov", "D", "2019-01-01T00:00:00"),
        dataset("d2", "doi-one-1", "doi-gov", "D", "2020-01-01T00:00:00"),
        dataset("d3", "doi-one-2", "doi-gov", "D", "2021-01-01T00:00:00"),
    ]
}

#[tokio::test]
async fn run_without_targets_covers_every_organization_and_writes_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeCatalog::with_records(two_organizations());
    let audit = Arc::new(RecordingAudit::default());
    let run = DedupeRun::new(config(dir.path(), "run-all"), fake.clone(), audit, StopSignal::new());

    let summary = run.run().await.expect("run");

    let scopes = summary
        .report
        .scopes
        .iter()
        .map(|s| s.scope.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        scopes,
        vec![
            Scope::Organization("doi-gov".into()),
            Scope::Organization("epa-gov".into()),
        ]
    );
    assert_eq!(summary.report.total_duplicates(), 3);
    assert_eq!(summary.report.total_removed(), 3);
    assert!(!summary.report.stopped);
    assert_eq!(fake.ids(), vec!["e1", "d1"]);

    let reports_dir = dir.path().join("run-all");
    assert_eq!(summary.reports_dir, reports_dir.display().to_string());
    assert!(reports_dir.join("summary.md").exists());
    assert!(reports_dir.join("summary.json").exists());
    assert!(reports_dir.join("snapshots/manifest.json").exists());
}

#[tokio::test]
async fn configured_targets_limit_the_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeCatalog::with_records(two_organizations());
    let audit = Arc::new(RecordingAudit::default());
    let config = DedupeConfig {
        targets: vec![Scope::Organization("epa-gov".into())],
        ..config(dir.path(), "run-epa")
    };

    let summary = DedupeRun::new(config, fake.clone(), audit, StopSignal::new())
        .run()
        .await
        .expect("run");

    assert_eq!(summary.report.scopes.len(), 1);
    assert_eq!(fake.removed(), vec!["e2"]);
}

#[tokio::test]
async fn split_run_covers_both_halves_of_the_identifier_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    let records = ["A", "B", "C", "D", "E"]
        .iter()
        .flat_map(|id| {
            [
                dataset(&format!("{id}-keep"), &format!("{id}-keep"), "epa-gov", id, "2019-01-01T00:00:00"),
                dataset(&format!("{id}-dup"), &format!("{id}-dup"), "epa-gov", id, "2020-01-01T00:00:00"),
            ]
        })
        .collect::<Vec<_>>();
    let fake = FakeCatalog::with_records(records);
    let audit = Arc::new(RecordingAudit::default());
    let config = DedupeConfig {
        split: true,
        targets: vec![Scope::Organization("epa-gov".into())],
        ..config(dir.path(), "run-split")
    };

    let summary = DedupeRun::new(config, fake.clone(), audit, StopSignal::new())
        .run()
        .await
        .expect("run");

    let scope = &summary.report.scopes[0];
    assert_eq!(scope.identifiers, 5);
    assert_eq!(scope.groups_committed, 5);
    assert_eq!(scope.removed, 5);
    let mut removed = fake.removed();
    removed.sort();
    assert_eq!(removed, vec!["A-dup", "B-dup", "C-dup", "D-dup", "E-dup"]);
}

#[tokio::test]
async fn stop_before_start_still_writes_a_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeCatalog::with_records(two_organizations());
    let audit = Arc::new(RecordingAudit::default());
    let stop = StopSignal::new();
    stop.stop();

    let summary = DedupeRun::new(config(dir.path(), "run-stop"), fake.clone(), audit, stop)
        .run()
        .await
        .expect("run");

    assert!(summary.report.stopped);
    assert!(summary.report.scopes.is_empty());
    assert!(fake.removed().is_empty());
    assert!(dir.path().join("run-stop/summary.json").exists());
}

fn survey_records() -> Vec<dedupe_core::Record> {
    vec![
        dataset("i1", "a-1", "epa-gov", "A", "2019-01-01T00:00:00"),
        dataset("i2", "a-2", "epa-gov", "A", "2019-01-02T00:00:00"),
        dataset("i3", "a-3", "epa-gov", "A", "2019-01-03T00:00:00"),
        dataset("g1", "geo-1", "epa-gov", "unused-1", "2019-01-01T00:00:00").with_extra("guid", "A"),
        dataset("g2", "geo-2", "epa-gov", "unused-2", "2019-01-02T00:00:00").with_extra("guid", "A"),
        dataset("u1", "unique", "epa-gov", "B", "2019-01-01T00:00:00"),
    ]
}

#[tokio::test]
async fn survey_counts_identifier_and_guid_groups_separately() {
    let fake = FakeCatalog::with_records(survey_records());

    let row = survey_scope(fake.as_ref(), &Scope::Organization("epa-gov".into()))
        .await
        .expect("survey");

    assert_eq!(row.name, "epa-gov");
    assert_eq!(row.number_datasets_duplicated, 2);
    assert_eq!(row.total_duplicate_count, 3);
    assert_eq!(row.total_datasets, 6);
    assert_eq!(row.percent_duplicate, 50.0);
}

#[tokio::test]
async fn survey_writes_one_row_per_scope() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeCatalog::with_records(survey_records());
    let out = survey_path(dir.path(), &RunId::from("run-s"));
    let scopes = vec![
        Scope::Organization("epa-gov".into()),
        Scope::Organization("empty-gov".into()),
    ];

    let rows = run_survey(fake.as_ref(), &scopes, &out, &StopSignal::new())
        .await
        .expect("survey");

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].total_datasets, 0);
    assert_eq!(rows[1].percent_duplicate, 0.0);
    let text = std::fs::read_to_string(&out).expect("csv");
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(
        lines[0],
        "name,number_datasets_duplicated,total_duplicate_count,total_datasets,percent_duplicate"
    );
    assert_eq!(lines[1], "epa-gov,2,3,6,50.0");
    assert_eq!(lines.len(), 3);
    assert!(out.ends_with("org-duplicates-run-s.csv"));
}

#[tokio::test]
async fn drift_check_logs_records_the_store_cannot_show() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fake = FakeCatalog::with_records(two_organizations());
    fake.state().unshowable.insert("d2".into());
    let out = broken_path(dir.path(), &RunId::from("run-drift"));

    let summary = DriftCheck::new(fake.as_ref(), IdentifierType::Identifier, 2, StopSignal::new())
        .run(&[Scope::Organization("doi-gov".into())], &out)
        .await
        .expect("drift");

    assert_eq!(summary.groups, 1);
    assert_eq!(summary.checked, 3);
    assert_eq!(summary.broken, 1);
    let text = std::fs::read_to_string(&out).expect("jsonl");
    let lines = text.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 1);
    let broken: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
    assert_eq!(broken["id"], "d2");
    assert!(fake.removed().is_empty());
}

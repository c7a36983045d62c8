//! Deduplication runs over a CKAN-style catalog: per-scope engines, the run
//! driver with its reports, plus the read-only survey and drift check.

pub mod config;
pub mod deduper;
pub mod drift;
pub mod driver;
pub mod pager;
pub mod report;
pub mod survey;

pub use config::{DedupeConfig, TargetsFile};
pub use deduper::{
    DedupeError, Deduper, DeduperOptions, GroupOutcome, GroupReport, ScopeSummary, StopSignal,
    DEFAULT_BATCH_SIZE,
};
pub use drift::{broken_path, DriftCheck, DriftSummary};
pub use driver::{connect, resolve_targets, run_once_from_env, DedupeRun, RunSummary};
pub use report::{write_run_reports, RunReport};
pub use survey::{run_survey, survey_path, survey_scope};

pub const CRATE_NAME: &str = "dedupe-engine";

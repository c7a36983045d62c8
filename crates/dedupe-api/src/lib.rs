//! Catalog API capability contract + reqwest-backed CKAN client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dedupe_core::{IdentifierType, Record, Scope, SortOrder};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, error, info, info_span, Instrument};

pub const CRATE_NAME: &str = "dedupe-api";

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http status {status} for {url}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("api reported failure for {url}: {message}")]
    Failure { url: String, message: String },
    #[error("search count {count} for identifier {identifier} but no records returned")]
    CountMismatch { identifier: String, count: u64 },
    #[error("refusing {method} {action} in dry-run mode")]
    DryRun { method: String, action: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding {action} response")]
    Decode {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    /// Faults that only cost the single record being worked on.
    pub fn is_record_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Status { .. } | Self::Failure { .. } | Self::Request(_)
        )
    }

    /// Count and result set disagree; usually means the search index drifted.
    pub fn is_consistency_fault(&self) -> bool {
        matches!(self, Self::CountMismatch { .. })
    }
}

/// One identifier group inside a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub scope: Scope,
    pub kind: IdentifierType,
    pub identifier: String,
    pub collections_only: bool,
}

impl Group {
    pub fn new(
        scope: Scope,
        kind: IdentifierType,
        identifier: impl Into<String>,
        collections_only: bool,
    ) -> Self {
        Self {
            scope,
            kind,
            identifier: identifier.into(),
            collections_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateIdentifier {
    pub identifier: String,
    pub count: u64,
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn count_in_group(&self, group: &Group) -> Result<u64, ApiError>;

    /// First record of the group under `sort`; `CountMismatch` when the
    /// search reports matches but returns none.
    async fn select_record(&self, group: &Group, sort: SortOrder) -> Result<Record, ApiError>;

    /// Identifiers with two or more records, in the order the index returns them.
    async fn list_duplicate_identifiers(
        &self,
        scope: &Scope,
        kind: IdentifierType,
        collections_only: bool,
    ) -> Result<Vec<DuplicateIdentifier>, ApiError>;

    async fn page_records(
        &self,
        group: &Group,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError>;

    /// Records whose `collection_package_id` points at `record_id`.
    async fn list_collection_members(&self, record_id: &str) -> Result<Vec<Record>, ApiError>;

    async fn update_record(&self, record: &Record) -> Result<(), ApiError>;

    async fn remove_record(&self, record_id: &str) -> Result<(), ApiError>;

    async fn list_organizations(&self) -> Result<Vec<String>, ApiError>;

    async fn count_in_scope(&self, scope: &Scope) -> Result<u64, ApiError>;

    async fn show_record(&self, record_id: &str) -> Result<Record, ApiError>;

    /// Whether successful writes leave the catalog untouched.
    fn is_read_only(&self) -> bool {
        false
    }
}

#[async_trait]
impl<T: CatalogApi + ?Sized> CatalogApi for Arc<T> {
    async fn count_in_group(&self, group: &Group) -> Result<u64, ApiError> {
        (**self).count_in_group(group).await
    }

    async fn select_record(&self, group: &Group, sort: SortOrder) -> Result<Record, ApiError> {
        (**self).select_record(group, sort).await
    }

    async fn list_duplicate_identifiers(
        &self,
        scope: &Scope,
        kind: IdentifierType,
        collections_only: bool,
    ) -> Result<Vec<DuplicateIdentifier>, ApiError> {
        (**self)
            .list_duplicate_identifiers(scope, kind, collections_only)
            .await
    }

    async fn page_records(
        &self,
        group: &Group,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError> {
        (**self).page_records(group, offset, limit).await
    }

    async fn list_collection_members(&self, record_id: &str) -> Result<Vec<Record>, ApiError> {
        (**self).list_collection_members(record_id).await
    }

    async fn update_record(&self, record: &Record) -> Result<(), ApiError> {
        (**self).update_record(record).await
    }

    async fn remove_record(&self, record_id: &str) -> Result<(), ApiError> {
        (**self).remove_record(record_id).await
    }

    async fn list_organizations(&self) -> Result<Vec<String>, ApiError> {
        (**self).list_organizations().await
    }

    async fn count_in_scope(&self, scope: &Scope) -> Result<u64, ApiError> {
        (**self).count_in_scope(scope).await
    }

    async fn show_record(&self, record_id: &str) -> Result<Record, ApiError> {
        (**self).show_record(record_id).await
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

/// Dry-run decorator: reads pass through, writes are logged and dropped.
#[derive(Debug)]
pub struct ReadOnly<A> {
    inner: A,
    suppressed: AtomicUsize,
}

impl<A> ReadOnly<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            suppressed: AtomicUsize::new(0),
        }
    }

    pub fn suppressed_writes(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn into_inner(self) -> A {
        self.inner
    }
}

#[async_trait]
impl<A: CatalogApi> CatalogApi for ReadOnly<A> {
    async fn count_in_group(&self, group: &Group) -> Result<u64, ApiError> {
        self.inner.count_in_group(group).await
    }

    async fn select_record(&self, group: &Group, sort: SortOrder) -> Result<Record, ApiError> {
        self.inner.select_record(group, sort).await
    }

    async fn list_duplicate_identifiers(
        &self,
        scope: &Scope,
        kind: IdentifierType,
        collections_only: bool,
    ) -> Result<Vec<DuplicateIdentifier>, ApiError> {
        self.inner
            .list_duplicate_identifiers(scope, kind, collections_only)
            .await
    }

    async fn page_records(
        &self,
        group: &Group,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError> {
        self.inner.page_records(group, offset, limit).await
    }

    async fn list_collection_members(&self, record_id: &str) -> Result<Vec<Record>, ApiError> {
        self.inner.list_collection_members(record_id).await
    }

    async fn update_record(&self, record: &Record) -> Result<(), ApiError> {
        info!(record_id = %record.id, record_name = %record.name, "not updating record in dry-run");
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_record(&self, record_id: &str) -> Result<(), ApiError> {
        info!(record_id, "not removing record in dry-run");
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<String>, ApiError> {
        self.inner.list_organizations().await
    }

    async fn count_in_scope(&self, scope: &Scope) -> Result<u64, ApiError> {
        self.inner.count_in_scope(scope).await
    }

    async fn show_record(&self, record_id: &str) -> Result<Record, ApiError> {
        self.inner.show_record(record_id).await
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpCatalogConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub dry_run: bool,
    pub page_size: u64,
    /// Applied to GETs only; writes are never retried.
    pub backoff: BackoffPolicy,
}

impl Default for HttpCatalogConfig {
    fn default() -> Self {
        Self {
            api_url: "https://catalog.data.gov".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            user_agent: None,
            dry_run: false,
            page_size: 1000,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    count: u64,
    #[serde(default)]
    results: Vec<Record>,
    #[serde(default)]
    search_facets: HashMap<String, SearchFacet>,
}

#[derive(Debug, Deserialize)]
struct SearchFacet {
    #[serde(default)]
    items: Vec<FacetItem>,
}

#[derive(Debug, Deserialize)]
struct FacetItem {
    name: String,
    count: u64,
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

fn scope_filter(scope: &Scope) -> String {
    match scope {
        Scope::Organization(name) => format!("organization:{}", quote(name)),
        Scope::HarvestSource(id) => format!("harvest_source_id:{}", quote(id)),
    }
}

fn group_filters(group: &Group) -> (String, String) {
    let q = format!("{}:{}", group.kind.extra_key(), quote(&group.identifier));
    let mut fq = format!("type:dataset AND {}", scope_filter(&group.scope));
    if group.collections_only {
        fq.push_str(" AND collection_metadata:true");
    }
    (q, fq)
}

fn decode_envelope<T: DeserializeOwned>(
    action: &str,
    url: &str,
    bytes: &[u8],
) -> Result<T, ApiError> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).map_err(|source| ApiError::Decode {
            action: action.to_string(),
            source,
        })?;
    match (envelope.success, envelope.result) {
        (true, Some(result)) => Ok(result),
        (_, _) => Err(ApiError::Failure {
            url: url.to_string(),
            message: envelope
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "success: false".to_string()),
        }),
    }
}

fn first_or_mismatch(group: &Group, search: SearchResult) -> Result<Record, ApiError> {
    search
        .results
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::CountMismatch {
            identifier: group.identifier.clone(),
            count: search.count,
        })
}

fn facet_items(kind: IdentifierType, search: SearchResult) -> Vec<DuplicateIdentifier> {
    let mut facets = search.search_facets;
    facets
        .remove(kind.extra_key())
        .map(|facet| facet.items)
        .unwrap_or_default()
        .into_iter()
        .map(|item| DuplicateIdentifier {
            identifier: item.name,
            count: item.count,
        })
        .collect()
}

fn truncate_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars().take(MAX_ERROR_BODY).collect()
}

/// CKAN action API client. One instance is one API session.
#[derive(Debug)]
pub struct HttpCatalog {
    client: reqwest::Client,
    api_url: String,
    dry_run: bool,
    page_size: u64,
    backoff: BackoffPolicy,
}

impl HttpCatalog {
    pub fn new(config: HttpCatalogConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = reqwest::header::HeaderValue::from_str(key)
                .context("api key is not a valid header value")?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            dry_run: config.dry_run,
            page_size: config.page_size.max(1),
            backoff: config.backoff,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}/api/action/{}", self.api_url, action)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        action: &str,
        query: &[(&str, String)],
        body: Option<&JsonValue>,
    ) -> Result<T, ApiError> {
        if self.dry_run && method != Method::GET {
            return Err(ApiError::DryRun {
                method: method.to_string(),
                action: action.to_string(),
            });
        }

        let url = self.action_url(action);
        let retries = if method == Method::GET {
            self.backoff.max_retries
        } else {
            0
        };
        let span = info_span!("catalog_api", %method, action);

        async {
            for attempt in 0..=retries {
                let mut request = self.client.request(method.clone(), &url).query(query);
                if let Some(body) = body {
                    request = request.json(body);
                }

                let response = match request.send().await {
                    Ok(response) => response,
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < retries
                        {
                            debug!(attempt, error = %err, "retrying request");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(ApiError::Request(err));
                    }
                };

                let status = response.status();
                let bytes = response.bytes().await?;
                if status.as_u16() >= 400 {
                    if classify_status(status) == RetryDisposition::Retryable && attempt < retries {
                        debug!(attempt, status = status.as_u16(), "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let body = truncate_body(&bytes);
                    error!(status = status.as_u16(), %url, %body, "unsuccessful status code");
                    return Err(ApiError::Status {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }

                return decode_envelope(action, &url, &bytes).inspect_err(|err| {
                    if let ApiError::Failure { message, .. } = err {
                        error!(status = status.as_u16(), %url, %message, "api reported failure");
                    }
                });
            }
            unreachable!("retry loop always returns on its final attempt")
        }
        .instrument(span)
        .await
    }

    async fn search(&self, params: Vec<(&str, String)>) -> Result<SearchResult, ApiError> {
        self.call(Method::GET, "package_search", &params, None).await
    }
}

#[async_trait]
impl CatalogApi for HttpCatalog {
    async fn count_in_group(&self, group: &Group) -> Result<u64, ApiError> {
        let (q, fq) = group_filters(group);
        let result = self
            .search(vec![("q", q), ("fq", fq), ("rows", "0".to_string())])
            .await?;
        Ok(result.count)
    }

    async fn select_record(&self, group: &Group, sort: SortOrder) -> Result<Record, ApiError> {
        let (q, fq) = group_filters(group);
        let result = self
            .search(vec![
                ("q", q),
                ("fq", fq),
                ("sort", sort.as_query().to_string()),
                ("rows", "1".to_string()),
            ])
            .await?;
        first_or_mismatch(group, result)
    }

    async fn list_duplicate_identifiers(
        &self,
        scope: &Scope,
        kind: IdentifierType,
        collections_only: bool,
    ) -> Result<Vec<DuplicateIdentifier>, ApiError> {
        let mut fq = scope_filter(scope);
        if collections_only {
            fq.push_str(" AND collection_metadata:true");
        }
        let result = self
            .search(vec![
                ("q", "*:*".to_string()),
                ("fq", fq),
                ("rows", "0".to_string()),
                ("facet.field", format!("[\"{}\"]", kind.extra_key())),
                ("facet.limit", "-1".to_string()),
                ("facet.mincount", "2".to_string()),
            ])
            .await?;
        Ok(facet_items(kind, result))
    }

    async fn page_records(
        &self,
        group: &Group,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError> {
        let (q, fq) = group_filters(group);
        let result = self
            .search(vec![
                ("q", q),
                ("fq", fq),
                ("sort", SortOrder::CreatedAsc.as_query().to_string()),
                ("start", offset.to_string()),
                ("rows", limit.to_string()),
            ])
            .await?;
        Ok(result.results)
    }

    async fn list_collection_members(&self, record_id: &str) -> Result<Vec<Record>, ApiError> {
        let mut members = Vec::new();
        loop {
            let result = self
                .search(vec![
                    ("q", format!("collection_package_id:{}", quote(record_id))),
                    ("start", members.len().to_string()),
                    ("rows", self.page_size.to_string()),
                ])
                .await?;
            let total = result.count;
            if result.results.is_empty() {
                break;
            }
            members.extend(result.results);
            if members.len() as u64 >= total {
                break;
            }
        }
        Ok(members)
    }

    async fn update_record(&self, record: &Record) -> Result<(), ApiError> {
        let body = serde_json::to_value(record).map_err(|source| ApiError::Decode {
            action: "package_update".to_string(),
            source,
        })?;
        let _: JsonValue = self
            .call(Method::POST, "package_update", &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn remove_record(&self, record_id: &str) -> Result<(), ApiError> {
        let body = json!({ "id": record_id });
        let _: JsonValue = self
            .call(Method::POST, "package_delete", &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<String>, ApiError> {
        self.call(Method::GET, "organization_list", &[], None).await
    }

    async fn count_in_scope(&self, scope: &Scope) -> Result<u64, ApiError> {
        let result = self
            .search(vec![
                ("q", "*:*".to_string()),
                ("fq", scope_filter(scope)),
                ("rows", "0".to_string()),
            ])
            .await?;
        Ok(result.count)
    }

    async fn show_record(&self, record_id: &str) -> Result<Record, ApiError> {
        self.call(
            Method::GET,
            "package_show",
            &[("id", record_id.to_string())],
            None,
        )
        .await
    }

    fn is_read_only(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Group {
        Group::new(
            Scope::Organization("test-organization".into()),
            IdentifierType::Identifier,
            "package-123",
            false,
        )
    }

    #[test]
    fn empty_results_with_positive_count_is_a_consistency_fault() {
        let body = br#"{"success": true, "result": {"count": 2, "results": []}}"#;
        let search: SearchResult = decode_envelope("package_search", "http://test", body).unwrap();
        let err = first_or_mismatch(&group(), search).unwrap_err();
        assert!(err.is_consistency_fault());
        assert!(!err.is_record_recoverable());
    }

    #[test]
    fn success_false_is_a_failure() {
        let body = br#"{"success": false, "error": {"message": "Not found"}}"#;
        let err = decode_envelope::<SearchResult>("package_search", "http://test", body).unwrap_err();
        assert!(matches!(err, ApiError::Failure { .. }));
        assert!(err.is_record_recoverable());
    }

    #[test]
    fn duplicate_facets_keep_index_order() {
        let body = br#"{"success": true, "result": {"count": 9, "results": [],
            "search_facets": {"identifier": {"items": [
                {"name": "b", "count": 4}, {"name": "a", "count": 2}
            ]}}}}"#;
        let search: SearchResult = decode_envelope("package_search", "http://test", body).unwrap();
        let items = facet_items(IdentifierType::Identifier, search);
        assert_eq!(
            items,
            vec![
                DuplicateIdentifier { identifier: "b".into(), count: 4 },
                DuplicateIdentifier { identifier: "a".into(), count: 2 },
            ]
        );
    }

    #[test]
    fn group_filters_scope_and_escape_identifier() {
        let mut g = group();
        g.identifier = "say \"hi\"".into();
        g.collections_only = true;
        let (q, fq) = group_filters(&g);
        assert_eq!(q, r#"identifier:"say \"hi\"""#);
        assert_eq!(
            fq,
            r#"type:dataset AND organization:"test-organization" AND collection_metadata:true"#
        );

        let hs = Group::new(Scope::HarvestSource("hs-1".into()), IdentifierType::Guid, "g", false);
        let (q, fq) = group_filters(&hs);
        assert_eq!(q, r#"guid:"g""#);
        assert_eq!(fq, r#"type:dataset AND harvest_source_id:"hs-1""#);
    }

    #[tokio::test]
    async fn dry_run_refuses_mutating_requests() {
        let api = HttpCatalog::new(HttpCatalogConfig {
            api_url: "http://test".into(),
            dry_run: true,
            ..Default::default()
        })
        .unwrap();

        let err = api.remove_record("package-123").await.unwrap_err();
        assert!(matches!(err, ApiError::DryRun { .. }));
        let err = api.update_record(&Record::new("package-123", "p")).await.unwrap_err();
        assert!(matches!(err, ApiError::DryRun { ref action, .. } if action == "package_update"));
        assert!(api.is_read_only());
        assert!(ReadOnly::new(api).is_read_only());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::none().max_retries, 0);
    }
}

//! Core catalog record model and run bookkeeping types for catalog-dedupe.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "dedupe-core";

/// Wire key of the transient "dedupe in progress" marker.
pub const IN_PROGRESS_KEY: &str = "datagov_dedupe";
/// Wire key of the permanent "retained by run" stamp.
pub const RETAINED_KEY: &str = "datagov_dedupe_retained";

pub const COLLECTION_PACKAGE_ID: &str = "collection_package_id";
pub const COLLECTION_METADATA: &str = "collection_metadata";
pub const SOURCE_HASH: &str = "source_hash";
pub const HARVEST_SOURCE_ID: &str = "harvest_source_id";

const CREATED_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Metadata field that defines an identifier group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    /// DCAT / data.json `identifier`.
    #[default]
    Identifier,
    /// Geospatial harvest `guid`.
    Guid,
}

impl IdentifierType {
    pub fn extra_key(self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Guid => "guid",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extra_key())
    }
}

impl FromStr for IdentifierType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identifier" => Ok(Self::Identifier),
            "guid" => Ok(Self::Guid),
            other => Err(format!("unknown identifier type `{other}`")),
        }
    }
}

/// Which record of a group survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetainPolicy {
    #[default]
    Oldest,
    Newest,
}

impl RetainPolicy {
    pub fn sort_order(self) -> SortOrder {
        match self {
            Self::Oldest => SortOrder::CreatedAsc,
            Self::Newest => SortOrder::CreatedDesc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    CreatedAsc,
    CreatedDesc,
}

impl SortOrder {
    pub fn as_query(self) -> &'static str {
        match self {
            Self::CreatedAsc => "metadata_created asc",
            Self::CreatedDesc => "metadata_created desc",
        }
    }
}

/// The administrative unit one engine instance works inside.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Scope {
    Organization(String),
    HarvestSource(String),
}

impl Scope {
    pub fn name(&self) -> &str {
        match self {
            Self::Organization(name) | Self::HarvestSource(name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Organization(_) => "organization",
            Self::HarvestSource(_) => "harvest_source",
        }
    }

    /// Whether a fetched record actually belongs to this scope. Identifier
    /// searches can match records owned by other organizations.
    pub fn contains(&self, record: &Record) -> bool {
        match self {
            Self::Organization(name) => record.organization_name() == Some(name.as_str()),
            Self::HarvestSource(id) => record.harvest_source_id() == Some(id.as_str()),
        }
    }

    /// Name recorded on a record for this scope kind, used in log lines.
    pub fn owner_of<'a>(&self, record: &'a Record) -> Option<&'a str> {
        match self {
            Self::Organization(_) => record.organization_name(),
            Self::HarvestSource(_) => record.harvest_source_id(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// Token identifying one execution; stamped into markers and audit files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        Self(Utc::now().format("%Y%m%d%H%M%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtraEntry {
    pub key: String,
    pub value: JsonValue,
}

/// Domain metadata extras, keyed lookup over the wire list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extras(Vec<ExtraEntry>);

impl Extras {
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(JsonValue::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|e| e.key == key)
    }

    /// Replace the value for `key`, or append it when absent.
    pub fn set(&mut self, key: &str, value: impl Into<JsonValue>) -> Option<JsonValue> {
        let value = value.into();
        match self.0.iter_mut().find(|e| e.key == key) {
            Some(entry) => Some(std::mem::replace(&mut entry.value, value)),
            None => {
                self.0.push(ExtraEntry {
                    key: key.to_string(),
                    value,
                });
                None
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<JsonValue> {
        let pos = self.0.iter().position(|e| e.key == key)?;
        Some(self.0.remove(pos).value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtraEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Loose truthiness of an extra, matching how catalogs store flags as text.
    pub fn is_truthy(&self, key: &str) -> bool {
        match self.get(key) {
            None | Some(JsonValue::Null) => false,
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::String(s)) => !s.is_empty() && !s.eq_ignore_ascii_case("false"),
            Some(JsonValue::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
            Some(JsonValue::Array(a)) => !a.is_empty(),
            Some(JsonValue::Object(o)) => !o.is_empty(),
        }
    }
}

impl FromIterator<(String, JsonValue)> for Extras {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        let mut extras = Extras::default();
        for (key, value) in iter {
            extras.set(&key, value);
        }
        extras
    }
}

/// Engine-owned extras, kept apart from domain metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bookkeeping {
    /// Run id that started deduplicating this record's group.
    pub in_progress: Option<String>,
    /// Run id that committed this record as the retained one.
    pub retained_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizationRef {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

/// A catalog dataset as returned by the remote API.
///
/// Fields the engine does not interpret are carried in `other` so an update
/// writes back everything that was fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RecordWire", into = "RecordWire")]
pub struct Record {
    pub id: String,
    pub name: String,
    pub title: Option<String>,
    pub organization: Option<OrganizationRef>,
    pub metadata_created: Option<String>,
    pub extras: Extras,
    pub bookkeeping: Bookkeeping,
    pub other: Map<String, JsonValue>,
}

#[derive(Serialize, Deserialize)]
struct RecordWire {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    organization: Option<OrganizationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_created: Option<String>,
    #[serde(default)]
    extras: Vec<ExtraEntry>,
    #[serde(flatten)]
    other: Map<String, JsonValue>,
}

fn marker_text(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) if s.is_empty() => None,
        JsonValue::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl From<RecordWire> for Record {
    fn from(wire: RecordWire) -> Self {
        let mut extras = Extras::default();
        let mut bookkeeping = Bookkeeping::default();
        for entry in wire.extras {
            match entry.key.as_str() {
                IN_PROGRESS_KEY => bookkeeping.in_progress = marker_text(entry.value),
                RETAINED_KEY => bookkeeping.retained_by = marker_text(entry.value),
                _ => extras.0.push(entry),
            }
        }
        Self {
            id: wire.id,
            name: wire.name,
            title: wire.title,
            organization: wire.organization,
            metadata_created: wire.metadata_created,
            extras,
            bookkeeping,
            other: wire.other,
        }
    }
}

impl From<Record> for RecordWire {
    fn from(record: Record) -> Self {
        let mut extras = record.extras.0;
        if let Some(run) = record.bookkeeping.in_progress {
            extras.push(ExtraEntry {
                key: IN_PROGRESS_KEY.to_string(),
                value: JsonValue::String(run),
            });
        }
        if let Some(run) = record.bookkeeping.retained_by {
            extras.push(ExtraEntry {
                key: RETAINED_KEY.to_string(),
                value: JsonValue::String(run),
            });
        }
        Self {
            id: record.id,
            name: record.name,
            title: record.title,
            organization: record.organization,
            metadata_created: record.metadata_created,
            extras,
            other: record.other,
        }
    }
}

impl Record {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            title: None,
            organization: None,
            metadata_created: None,
            extras: Extras::default(),
            bookkeeping: Bookkeeping::default(),
            other: Map::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_organization(mut self, name: impl Into<String>) -> Self {
        self.organization = Some(OrganizationRef {
            name: name.into(),
            other: Map::new(),
        });
        self
    }

    pub fn with_created(mut self, created: impl Into<String>) -> Self {
        self.metadata_created = Some(created.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.extras.set(key, value);
        self
    }

    pub fn organization_name(&self) -> Option<&str> {
        self.organization.as_ref().map(|o| o.name.as_str())
    }

    pub fn external_identifier(&self, kind: IdentifierType) -> Option<&str> {
        self.extras.get_str(kind.extra_key())
    }

    pub fn source_hash(&self) -> Option<&str> {
        self.extras.get_str(SOURCE_HASH)
    }

    pub fn harvest_source_id(&self) -> Option<&str> {
        self.extras.get_str(HARVEST_SOURCE_ID)
    }

    pub fn collection_package_id(&self) -> Option<&str> {
        self.extras.get_str(COLLECTION_PACKAGE_ID)
    }

    pub fn is_collection(&self) -> bool {
        self.extras.is_truthy(COLLECTION_METADATA)
    }

    pub fn is_collection_member(&self) -> bool {
        self.extras.is_truthy(COLLECTION_PACKAGE_ID)
    }

    pub fn created_at(&self) -> Option<NaiveDateTime> {
        let raw = self.metadata_created.as_deref()?;
        NaiveDateTime::parse_from_str(raw.trim_end_matches('Z'), CREATED_FORMAT).ok()
    }

    pub fn is_in_progress(&self) -> bool {
        self.bookkeeping.in_progress.is_some()
    }

    pub fn mark_in_progress(&mut self, run_id: &RunId) {
        self.bookkeeping.in_progress = Some(run_id.to_string());
    }

    /// Clears the in-progress marker and stamps the permanent retained marker.
    pub fn commit_retained(&mut self, run_id: &RunId) {
        self.bookkeeping.in_progress = None;
        self.bookkeeping.retained_by = Some(run_id.to_string());
    }

    /// Points this collection member at `parent_id`, returning the old parent.
    pub fn relink_collection(&mut self, parent_id: &str) -> Option<String> {
        self.extras
            .set(COLLECTION_PACKAGE_ID, parent_id)
            .and_then(|previous| previous.as_str().map(str::to_string))
    }
}

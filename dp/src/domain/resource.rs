//! Resource document model
//!
//! Field names serialize in camelCase so documents in the store match
//! the public API representation. Every field except `id` is optional
//! or defaulted: resources are created by the API layer and the
//! pipeline must tolerate sparse documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File formats that can be indexed directly, without normalization
pub const BASIC_TYPES: [&str; 2] = ["text/csv", "application/geo+json"];

/// Tabular formats handled by the CSV analyzer
pub const CSV_TYPES: [&str; 2] = ["text/csv", "text/tab-separated-values"];

/// Geographic format handled by the GeoJSON analyzer
pub const GEOJSON_TYPE: &str = "application/geo+json";

/// The three kinds of managed resources, in scheduling priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Application,
    Catalog,
    Dataset,
}

impl ResourceKind {
    /// Fixed priority order used by the scheduler loop
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Application, ResourceKind::Catalog, ResourceKind::Dataset];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::Catalog => "catalog",
            Self::Dataset => "dataset",
        }
    }

    /// Store collection holding this kind of resource
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Application => "applications",
            Self::Catalog => "catalogs",
            Self::Dataset => "datasets",
        }
    }

    /// Lock service key for one resource
    pub fn lock_key(&self, id: &str) -> String {
        format!("{}:{id}", self.as_str())
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application" => Ok(Self::Application),
            "catalog" => Ok(Self::Catalog),
            "dataset" => Ok(Self::Dataset),
            _ => Err(format!("Unknown resource kind: {s}. Use: application, catalog, or dataset")),
        }
    }
}

/// Pipeline status of a resource
///
/// Statuses only advance forward along the pipeline or move to
/// `error`; they never regress except through an explicit
/// administrative action outside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    #[default]
    Created,
    Imported,
    Loaded,
    Stored,
    Normalized,
    Analyzed,
    ValidationUpdated,
    Validated,
    Extended,
    Updated,
    Indexed,
    Finalized,
    Error,
    Draft,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Imported => "imported",
            Self::Loaded => "loaded",
            Self::Stored => "stored",
            Self::Normalized => "normalized",
            Self::Analyzed => "analyzed",
            Self::ValidationUpdated => "validation-updated",
            Self::Validated => "validated",
            Self::Extended => "extended",
            Self::Updated => "updated",
            Self::Indexed => "indexed",
            Self::Finalized => "finalized",
            Self::Error => "error",
            Self::Draft => "draft",
        }
    }

    /// Terminal statuses end a draft's life and stop the usual sequence
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Error)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored or original file metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FileInfo {
    pub name: Option<String>,
    pub mimetype: String,
}

/// A remote-service extension attached to a dataset
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Extension {
    pub active: bool,
    pub needs_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_update: Option<DateTime<Utc>>,
}

/// Publication request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationStatus {
    Waiting,
    Published,
    Deleted,
}

/// A request to publish the resource to an external catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: PublicationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

/// Periodic refresh schedule (remote files, catalogs)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoUpdate {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_update: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

/// Remote origin of a file dataset
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteFile {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<AutoUpdate>,
}

/// Time-to-live configuration for REST dataset lines
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Ttl {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

/// REST dataset parameters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RestParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Ttl>,
}

/// Scheduled CSV export of a REST dataset
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RestExport {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_export: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_export: Option<DateTime<Utc>>,
}

/// Export configurations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Exports {
    #[serde(rename = "restToCSV", skip_serializing_if = "Option::is_none")]
    pub rest_to_csv: Option<RestExport>,
}

/// Read-only API key with periodic rotation
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadApiKey {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
}

/// Parallel in-flight revision of a resource
///
/// The draft's own `status` / `errorStatus` / `errorRetry` are
/// manipulated independently of the top-level ones; a failing draft
/// never touches the production fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Draft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_retry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_file: Option<FileInfo>,
}

/// A managed resource document
///
/// Only the fields consumed by the orchestration core are typed here;
/// stage implementations read and write their own fields through store
/// patches.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Resource {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_retry: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<Box<Draft>>,
    pub is_rest: bool,
    pub is_meta_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_file: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_file: Option<RemoteFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Extension>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exports: Option<Exports>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_api_key: Option<ReadApiKey>,
    /// Partial pipeline status of an already-finalized REST dataset
    #[serde(rename = "_partialRestStatus", skip_serializing_if = "Option::is_none")]
    pub partial_rest_status: Option<Status>,
    /// Catalog refresh schedule (catalog kind only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<AutoUpdate>,
}

impl Resource {
    /// Minimal resource for tests and tooling
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// True when a draft exists whose stage is not terminal
    ///
    /// Such a draft takes priority: classification and task input use
    /// the draft-merged view.
    pub fn has_live_draft(&self) -> bool {
        self.draft
            .as_deref()
            .and_then(|d| d.status)
            .is_some_and(|s| !s.is_terminal())
    }

    /// Draft-over-base merged view
    ///
    /// The returned resource carries `draft_reason`, which marks it as
    /// draft-scoped for everything downstream (journal events, store
    /// patches, error bookkeeping).
    pub fn merged(&self) -> Resource {
        let mut view = self.clone();
        if let Some(draft) = self.draft.as_deref() {
            if let Some(status) = draft.status {
                view.status = status;
            }
            view.error_status = draft.error_status;
            view.error_retry = draft.error_retry;
            if draft.file.is_some() {
                view.file = draft.file.clone();
            }
            if draft.original_file.is_some() {
                view.original_file = draft.original_file.clone();
            }
            view.draft_reason = draft.draft_reason.clone().or_else(|| Some("draft".to_string()));
        }
        view
    }

    /// True on a merged view: patches must target `draft.*` fields
    pub fn is_draft_scoped(&self) -> bool {
        self.draft_reason.is_some()
    }

    /// Human-readable label for dispatch logs
    pub fn label(&self, kind: ResourceKind) -> String {
        format!("{kind}/{} ({})", self.id, self.status)
    }

    /// The file is in a basic format or has already been normalized
    pub fn is_normalized(&self) -> bool {
        (self.status == Status::Stored
            && self
                .original_file
                .as_ref()
                .is_some_and(|f| BASIC_TYPES.contains(&f.mimetype.as_str())))
            || self.status == Status::Normalized
    }
}

//! Built-in stage tasks
//!
//! These carry the pipeline bookkeeping: status transitions, schedule
//! updates and publication state. Heavy per-format work (parsing,
//! validation rules, search indexing) lives behind the same [`Task`]
//! seam and is out of scope here.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use docstore::Patch;
use serde_json::Value;

use crate::domain::{CSV_TYPES, Extension, FileInfo, GEOJSON_TYPE, Publication, PublicationStatus, Resource, Status};
use crate::tasks::{Task, TaskError};

/// Default rescheduling period for periodic maintenance tasks
const PERIODIC_INTERVAL_HOURS: i64 = 24;

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn next_run_str() -> String {
    (Utc::now() + Duration::hours(PERIODIC_INTERVAL_HOURS)).to_rfc3339()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, TaskError> {
    serde_json::to_value(value).map_err(|err| TaskError::Transient(err.into()))
}

/// Routes a freshly created dataset to its first real stage
pub(super) struct Initializer;

#[async_trait]
impl Task for Initializer {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        let next = if resource.remote_file.is_some() {
            Status::Imported
        } else if resource.is_rest {
            Status::Analyzed
        } else {
            Status::Loaded
        };
        Ok(Patch::new().set("status", next.as_str()))
    }
}

/// Fetches the remote file and reschedules its auto-update
pub(super) struct FileDownloader;

#[async_trait]
impl Task for FileDownloader {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        let remote = resource
            .remote_file
            .as_ref()
            .ok_or_else(|| TaskError::Input("no remote file to download".to_string()))?;
        if remote.url.is_empty() {
            return Err(TaskError::Input("remote file has an empty url".to_string()));
        }

        let mut patch = Patch::new().set("status", Status::Loaded.as_str());
        if remote.auto_update.as_ref().is_some_and(|a| a.active) {
            patch = patch
                .set("remoteFile.autoUpdate.lastUpdate", now_str())
                .set("remoteFile.autoUpdate.nextUpdate", next_run_str());
        }
        Ok(patch)
    }
}

/// Moves the uploaded file into permanent storage
pub(super) struct FileStorer;

#[async_trait]
impl Task for FileStorer {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        let original = resource
            .original_file
            .as_ref()
            .ok_or_else(|| TaskError::Input("no original file to store".to_string()))?;
        Ok(Patch::new()
            .set("status", Status::Stored.as_str())
            .set("file", to_json(original)?))
    }
}

/// Converts a non-basic format into CSV or GeoJSON
pub(super) struct FileNormalizer;

#[async_trait]
impl Task for FileNormalizer {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        let original = resource
            .original_file
            .as_ref()
            .ok_or_else(|| TaskError::Input("no original file to normalize".to_string()))?;
        // geographic formats normalize to GeoJSON, everything tabular to CSV
        let mimetype = if original.mimetype.contains("geo") || original.mimetype.contains("gpx") {
            GEOJSON_TYPE
        } else {
            "text/csv"
        };
        let file = FileInfo {
            name: original.name.clone(),
            mimetype: mimetype.to_string(),
        };
        Ok(Patch::new()
            .set("status", Status::Normalized.as_str())
            .set("file", to_json(&file)?))
    }
}

/// Analyzes a tabular file (schema sniffing)
pub(super) struct CsvAnalyzer;

#[async_trait]
impl Task for CsvAnalyzer {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        let file = resource
            .file
            .as_ref()
            .ok_or_else(|| TaskError::Input("no file to analyze".to_string()))?;
        if !CSV_TYPES.contains(&file.mimetype.as_str()) {
            return Err(TaskError::Input(format!("not a tabular file: {}", file.mimetype)));
        }
        Ok(Patch::new().set("status", Status::Analyzed.as_str()))
    }
}

/// Analyzes a geographic file
pub(super) struct GeojsonAnalyzer;

#[async_trait]
impl Task for GeojsonAnalyzer {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        let file = resource
            .file
            .as_ref()
            .ok_or_else(|| TaskError::Input("no file to analyze".to_string()))?;
        if file.mimetype != GEOJSON_TYPE {
            return Err(TaskError::Input(format!("not a geojson file: {}", file.mimetype)));
        }
        Ok(Patch::new().set("status", Status::Analyzed.as_str()))
    }
}

/// Validates data against the schema
pub(super) struct FileValidator;

#[async_trait]
impl Task for FileValidator {
    async fn process(&self, _resource: &Resource) -> Result<Patch, TaskError> {
        Ok(Patch::new().set("status", Status::Validated.as_str()))
    }
}

/// Applies remote-service extensions and clears their update flags
pub(super) struct Extender;

#[async_trait]
impl Task for Extender {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        let extensions: Vec<Extension> = resource
            .extensions
            .iter()
            .map(|ext| Extension {
                active: ext.active,
                needs_update: false,
                next_update: None,
            })
            .collect();

        let mut patch = Patch::new().set("extensions", to_json(&extensions)?);
        // an already-finalized dataset re-extends through the partial
        // ladder so its published status never regresses
        if resource.partial_rest_status == Some(Status::Updated) || resource.status == Status::Finalized {
            patch = patch.set("_partialRestStatus", Status::Extended.as_str());
        } else {
            patch = patch.set("status", Status::Extended.as_str());
        }
        Ok(patch)
    }
}

/// Feeds the search index
pub(super) struct Indexer;

#[async_trait]
impl Task for Indexer {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        if matches!(resource.partial_rest_status, Some(Status::Updated | Status::Extended)) {
            return Ok(Patch::new().set("_partialRestStatus", Status::Indexed.as_str()));
        }
        Ok(Patch::new()
            .set("status", Status::Indexed.as_str())
            .set("count", resource.count.unwrap_or(0)))
    }
}

/// Closes a pipeline run
pub(super) struct Finalizer;

#[async_trait]
impl Task for Finalizer {
    async fn process(&self, _resource: &Resource) -> Result<Patch, TaskError> {
        Ok(Patch::new()
            .set("status", Status::Finalized.as_str())
            .set("finalizedAt", now_str())
            .unset("_partialRestStatus"))
    }
}

fn process_publications(publications: &[Publication]) -> Result<Patch, TaskError> {
    let now = Utc::now();
    let remaining: Vec<Publication> = publications
        .iter()
        .filter(|p| p.status != PublicationStatus::Deleted)
        .map(|p| match p.status {
            PublicationStatus::Waiting => Publication {
                target: p.target.clone(),
                status: PublicationStatus::Published,
                published_at: Some(now),
            },
            _ => p.clone(),
        })
        .collect();
    Ok(Patch::new().set("publications", to_json(&remaining)?))
}

/// Pushes waiting dataset publications to their catalogs
pub(super) struct DatasetPublisher;

#[async_trait]
impl Task for DatasetPublisher {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        process_publications(&resource.publications)
    }
}

/// Pushes waiting application publications to their catalogs
pub(super) struct ApplicationPublisher;

#[async_trait]
impl Task for ApplicationPublisher {
    async fn process(&self, resource: &Resource) -> Result<Patch, TaskError> {
        process_publications(&resource.publications)
    }
}

/// Expires old REST dataset lines
pub(super) struct TtlManager;

#[async_trait]
impl Task for TtlManager {
    async fn process(&self, _resource: &Resource) -> Result<Patch, TaskError> {
        Ok(Patch::new().set("rest.ttl.checkedAt", now_str()))
    }
}

/// Regenerates the scheduled CSV export of a REST dataset
pub(super) struct RestExporterCsv;

#[async_trait]
impl Task for RestExporterCsv {
    async fn process(&self, _resource: &Resource) -> Result<Patch, TaskError> {
        Ok(Patch::new()
            .set("exports.restToCSV.lastExport", now_str())
            .set("exports.restToCSV.nextExport", next_run_str()))
    }
}

/// Rotates the read-only API key
pub(super) struct ReadApiKeyRenewer;

#[async_trait]
impl Task for ReadApiKeyRenewer {
    async fn process(&self, _resource: &Resource) -> Result<Patch, TaskError> {
        Ok(Patch::new()
            .set("readApiKey.current", uuid::Uuid::now_v7().to_string())
            .set("readApiKey.renewAt", next_run_str()))
    }
}

/// Refreshes resources imported from a remote catalog
pub(super) struct CatalogHarvester;

#[async_trait]
impl Task for CatalogHarvester {
    async fn process(&self, _resource: &Resource) -> Result<Patch, TaskError> {
        Ok(Patch::new()
            .set("autoUpdate.lastUpdate", now_str())
            .set("autoUpdate.nextUpdate", next_run_str()))
    }
}

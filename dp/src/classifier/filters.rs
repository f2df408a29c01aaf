//! Per-kind eligibility filters
//!
//! These are the store-side counterparts of the classification ladders:
//! one query per kind enumerating every condition under which a
//! resource should re-enter the pipeline. A condition reachable by the
//! ladder but absent here makes the resource unreachable, so the two
//! are tested in lock-step.

use chrono::{DateTime, Duration, Utc};
use docstore::Filter;
use serde_json::Value;

use crate::classifier::TTL_CHECK_MINUTES;
use crate::domain::{ResourceKind, Status};

/// Store filter selecting every resource of `kind` with pending work
pub fn eligibility_filter(kind: ResourceKind, now: DateTime<Utc>) -> Filter {
    match kind {
        ResourceKind::Dataset => dataset_filter(now),
        ResourceKind::Application => pending_publication(),
        ResourceKind::Catalog => catalog_filter(now),
    }
}

fn dataset_filter(now: DateTime<Utc>) -> Filter {
    let now_s = now.to_rfc3339();
    let ttl_cutoff = (now - Duration::minutes(TTL_CHECK_MINUTES)).to_rfc3339();
    let terminal = vec![status(Status::Finalized), status(Status::Error), status(Status::Draft)];

    Filter::any(vec![
        // mid-pipeline, excluding virtual metadata-only datasets
        Filter::all(vec![
            Filter::not(Filter::is_in("status", terminal.clone())),
            Filter::ne("isMetaOnly", true),
        ]),
        // live draft revision
        Filter::all(vec![
            Filter::exists("draft.status", true),
            Filter::not(Filter::is_in("draft.status", vec![status(Status::Finalized), status(Status::Error)])),
        ]),
        pending_publication(),
        // due error retries, base and draft scoped
        Filter::lt("errorRetry", now_s.clone()),
        Filter::lt("draft.errorRetry", now_s.clone()),
        // remote file refresh, only when no draft is already pending
        Filter::all(vec![
            Filter::eq("remoteFile.autoUpdate.active", true),
            Filter::lt("remoteFile.autoUpdate.nextUpdate", now_s.clone()),
            Filter::exists("draft", false),
        ]),
        // partial reprocessing of a finalized REST dataset
        Filter::is_in(
            "_partialRestStatus",
            vec![status(Status::Updated), status(Status::Extended), status(Status::Indexed)],
        ),
        Filter::all(vec![
            finalized_rest(),
            Filter::eq("rest.ttl.active", true),
            Filter::any(vec![
                Filter::lt("rest.ttl.checkedAt", ttl_cutoff),
                Filter::exists("rest.ttl.checkedAt", false),
            ]),
        ]),
        Filter::all(vec![
            finalized_rest(),
            Filter::eq("exports.restToCSV.active", true),
            Filter::any(vec![
                Filter::lt("exports.restToCSV.nextExport", now_s.clone()),
                Filter::exists("exports.restToCSV.nextExport", false),
            ]),
        ]),
        Filter::all(vec![
            Filter::eq("readApiKey.active", true),
            Filter::any(vec![
                Filter::lt("readApiKey.renewAt", now_s.clone()),
                Filter::exists("readApiKey.renewAt", false),
            ]),
        ]),
        Filter::all(vec![
            finalized_rest(),
            Filter::eq("extensions.active", true),
            Filter::any(vec![
                Filter::eq("extensions.needsUpdate", true),
                Filter::lt("extensions.nextUpdate", now_s),
            ]),
        ]),
    ])
}

fn catalog_filter(now: DateTime<Utc>) -> Filter {
    Filter::all(vec![
        Filter::eq("autoUpdate.active", true),
        Filter::lt("autoUpdate.nextUpdate", now.to_rfc3339()),
    ])
}

fn pending_publication() -> Filter {
    Filter::is_in("publications.status", vec!["waiting".into(), "deleted".into()])
}

fn finalized_rest() -> Filter {
    Filter::all(vec![Filter::eq("isRest", true), Filter::eq("status", status(Status::Finalized))])
}

fn status(s: Status) -> Value {
    Value::String(s.as_str().to_string())
}

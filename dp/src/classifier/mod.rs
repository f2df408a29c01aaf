//! Stage classification
//!
//! `classify` decides what, if anything, should happen next to a
//! resource. It is pure: same document and timestamp, same decision.
//! Each kind has an ordered ladder of guarded rules and the first
//! match wins; the order is the tie-break when several conditions hold
//! at once, so it must stay aligned with the eligibility filters in
//! [`filters`] or resources become unreachable.

mod filters;

pub use filters::eligibility_filter;

use chrono::{DateTime, Duration, Utc};

use crate::domain::{BASIC_TYPES, CSV_TYPES, GEOJSON_TYPE, PublicationStatus, Resource, ResourceKind, Status};
use crate::tasks::TaskId;

/// Interval between time-to-live sweeps of a REST dataset
pub(crate) const TTL_CHECK_MINUTES: i64 = 60;

/// A document mutation the classifier schedules instead of a task
///
/// Side effects are applied under the lock and re-evaluated on the
/// next cycle; they never dispatch work themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Open a new draft revision, e.g. when a remote file is due for refresh
    OpenDraft { reason: &'static str },
    /// Mark every active scheduled extension as needing an update
    FlagExtensionUpdates,
    /// Restore `status` from `errorStatus` now that the retry delay
    /// elapsed; `draft` selects the `draft.*` error fields
    RestoreErrorStatus { draft: bool },
}

/// Outcome of classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Dispatch(TaskId),
    Apply(SideEffect),
    Nothing,
}

/// Decide the next step for a resource
///
/// When the resource carries a live draft, every rule sees the
/// draft-merged view; the caller applies resulting patches under the
/// `draft.` scope.
pub fn classify(kind: ResourceKind, resource: &Resource, now: DateTime<Utc>) -> Decision {
    let merged;
    let view = if resource.has_live_draft() {
        merged = resource.merged();
        &merged
    } else {
        resource
    };

    match kind {
        ResourceKind::Dataset => classify_dataset(view, now),
        ResourceKind::Application => classify_application(view),
        ResourceKind::Catalog => classify_catalog(view, now),
    }
}

fn classify_dataset(view: &Resource, now: DateTime<Utc>) -> Decision {
    if view.status == Status::Created {
        return Decision::Dispatch(TaskId::Initializer);
    }
    if view.status == Status::Imported {
        return Decision::Dispatch(TaskId::FileDownloader);
    }
    if remote_refresh_due(view, now) && view.draft.is_none() && view.draft_reason.is_none() {
        return Decision::Apply(SideEffect::OpenDraft { reason: "file-updated" });
    }
    if view.status == Status::Loaded {
        return Decision::Dispatch(TaskId::FileStorer);
    }
    if view.status == Status::Stored
        && view
            .original_file
            .as_ref()
            .is_some_and(|f| !BASIC_TYPES.contains(&f.mimetype.as_str()))
    {
        return Decision::Dispatch(TaskId::FileNormalizer);
    }
    if view.is_normalized() {
        let mimetype = view.file.as_ref().or(view.original_file.as_ref()).map(|f| f.mimetype.as_str());
        if let Some(mimetype) = mimetype {
            if CSV_TYPES.contains(&mimetype) {
                return Decision::Dispatch(TaskId::CsvAnalyzer);
            }
            if mimetype == GEOJSON_TYPE {
                return Decision::Dispatch(TaskId::GeojsonAnalyzer);
            }
        }
    }
    if !view.is_rest && matches!(view.status, Status::Analyzed | Status::ValidationUpdated) {
        return Decision::Dispatch(TaskId::FileValidator);
    }
    if view.status == Status::Validated
        || (view.is_rest
            && (matches!(view.status, Status::Analyzed | Status::Updated)
                || view.partial_rest_status == Some(Status::Updated)))
    {
        if view.extensions.iter().any(|e| e.active) {
            return Decision::Dispatch(TaskId::Extender);
        }
        return Decision::Dispatch(TaskId::Indexer);
    }
    if view.status == Status::Extended || view.partial_rest_status == Some(Status::Extended) {
        return Decision::Dispatch(TaskId::Indexer);
    }
    if view.status == Status::Indexed || view.partial_rest_status == Some(Status::Indexed) {
        return Decision::Dispatch(TaskId::Finalizer);
    }
    if (view.status == Status::Finalized || view.is_meta_only) && has_pending_publication(view) {
        return Decision::Dispatch(TaskId::DatasetPublisher);
    }
    if view.status == Status::Finalized && view.is_rest && ttl_check_due(view, now) {
        return Decision::Dispatch(TaskId::TtlManager);
    }
    if view.status == Status::Finalized && view.is_rest && rest_export_due(view, now) {
        return Decision::Dispatch(TaskId::RestExporterCsv);
    }
    if key_renewal_due(view, now) {
        return Decision::Dispatch(TaskId::ReadApiKeyRenewer);
    }
    if view.status == Status::Finalized && view.is_rest {
        if view.extensions.iter().any(|e| e.active && e.needs_update) {
            return Decision::Dispatch(TaskId::Extender);
        }
        // schedule-due extensions get flagged first; dispatch happens next cycle
        if view
            .extensions
            .iter()
            .any(|e| e.active && e.next_update.is_some_and(|t| t <= now))
        {
            return Decision::Apply(SideEffect::FlagExtensionUpdates);
        }
    }
    if view.status == Status::Error
        && view.error_status.is_some()
        && view.error_retry.is_some_and(|t| t <= now)
    {
        return Decision::Apply(SideEffect::RestoreErrorStatus { draft: false });
    }
    // an errored draft is terminal, so it is never part of the merged
    // view; its retry fields are inspected from the base document
    let draft_retry_due = view.draft.as_deref().is_some_and(|d| {
        d.status == Some(Status::Error) && d.error_status.is_some() && d.error_retry.is_some_and(|t| t <= now)
    });
    if draft_retry_due {
        return Decision::Apply(SideEffect::RestoreErrorStatus { draft: true });
    }
    Decision::Nothing
}

fn classify_application(view: &Resource) -> Decision {
    if has_pending_publication(view) {
        return Decision::Dispatch(TaskId::ApplicationPublisher);
    }
    Decision::Nothing
}

fn classify_catalog(view: &Resource, now: DateTime<Utc>) -> Decision {
    let due = view
        .auto_update
        .as_ref()
        .is_some_and(|a| a.active && a.next_update.is_some_and(|t| t <= now));
    if due {
        return Decision::Dispatch(TaskId::CatalogHarvester);
    }
    Decision::Nothing
}

fn has_pending_publication(view: &Resource) -> bool {
    view.publications
        .iter()
        .any(|p| matches!(p.status, PublicationStatus::Waiting | PublicationStatus::Deleted))
}

fn remote_refresh_due(view: &Resource, now: DateTime<Utc>) -> bool {
    view.remote_file
        .as_ref()
        .and_then(|r| r.auto_update.as_ref())
        .is_some_and(|a| a.active && a.next_update.is_some_and(|t| t <= now))
}

fn ttl_check_due(view: &Resource, now: DateTime<Utc>) -> bool {
    let Some(ttl) = view.rest.as_ref().and_then(|r| r.ttl.as_ref()) else {
        return false;
    };
    ttl.active && ttl.checked_at.is_none_or(|t| t + Duration::minutes(TTL_CHECK_MINUTES) <= now)
}

fn rest_export_due(view: &Resource, now: DateTime<Utc>) -> bool {
    view.exports
        .as_ref()
        .and_then(|e| e.rest_to_csv.as_ref())
        .is_some_and(|e| e.active && e.next_export.is_none_or(|t| t <= now))
}

fn key_renewal_due(view: &Resource, now: DateTime<Utc>) -> bool {
    view.read_api_key
        .as_ref()
        .is_some_and(|k| k.active && k.renew_at.is_none_or(|t| t <= now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AutoUpdate, Draft, Exports, Extension, FileInfo, Publication, ReadApiKey, RemoteFile, RestExport, RestParams,
        Ttl,
    };
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    fn csv_file() -> FileInfo {
        FileInfo {
            name: Some("data.csv".to_string()),
            mimetype: "text/csv".to_string(),
        }
    }

    #[test]
    fn test_created_dispatches_initializer() {
        let resource = Resource::new("ds-1");
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Initializer)
        );
    }

    #[test]
    fn test_stored_basic_file_dispatches_analyzer() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Stored;
        resource.original_file = Some(csv_file());
        resource.file = Some(csv_file());
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::CsvAnalyzer)
        );

        resource.original_file.as_mut().unwrap().mimetype = GEOJSON_TYPE.to_string();
        resource.file.as_mut().unwrap().mimetype = GEOJSON_TYPE.to_string();
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::GeojsonAnalyzer)
        );
    }

    #[test]
    fn test_stored_non_basic_file_dispatches_normalizer() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Stored;
        resource.original_file = Some(FileInfo {
            name: Some("data.xlsx".to_string()),
            mimetype: "application/vnd.ms-excel".to_string(),
        });
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::FileNormalizer)
        );
    }

    #[test]
    fn test_validated_extender_or_indexer() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Validated;
        resource.extensions = vec![Extension {
            active: true,
            needs_update: false,
            next_update: None,
        }];
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Extender)
        );

        resource.extensions.clear();
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Indexer)
        );
    }

    #[test]
    fn test_error_retry_restore_then_normal_flow() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Error;
        resource.error_status = Some(Status::Stored);
        resource.error_retry = Some(at(11));

        // due retry: restore side effect, not a dispatch
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Apply(SideEffect::RestoreErrorStatus { draft: false })
        );
        // not yet due: nothing
        assert_eq!(classify(ResourceKind::Dataset, &resource, at(10)), Decision::Nothing);

        // after restore the ladder picks up from the prior stage
        resource.status = Status::Stored;
        resource.error_status = None;
        resource.error_retry = None;
        resource.original_file = Some(csv_file());
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::CsvAnalyzer)
        );
    }

    #[test]
    fn test_errored_draft_retry_restores_draft_fields() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Finalized;
        resource.draft = Some(Box::new(Draft {
            status: Some(Status::Error),
            error_status: Some(Status::Loaded),
            error_retry: Some(at(11)),
            draft_reason: Some("file-updated".to_string()),
            ..Default::default()
        }));
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Apply(SideEffect::RestoreErrorStatus { draft: true })
        );
        assert_eq!(classify(ResourceKind::Dataset, &resource, at(10)), Decision::Nothing);
    }

    #[test]
    fn test_live_draft_classified_on_merged_view() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Finalized;
        resource.draft = Some(Box::new(Draft {
            status: Some(Status::Loaded),
            draft_reason: Some("file-updated".to_string()),
            ..Default::default()
        }));
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::FileStorer)
        );

        // terminal draft: the base view rules
        resource.draft.as_mut().unwrap().status = Some(Status::Error);
        assert_eq!(classify(ResourceKind::Dataset, &resource, at(12)), Decision::Nothing);
    }

    #[test]
    fn test_remote_refresh_opens_draft_once() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Finalized;
        resource.remote_file = Some(RemoteFile {
            url: "https://example.com/data.csv".to_string(),
            auto_update: Some(AutoUpdate {
                active: true,
                next_update: Some(at(11)),
                last_update: None,
            }),
        });
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Apply(SideEffect::OpenDraft { reason: "file-updated" })
        );

        // a pending draft suppresses re-opening
        resource.draft = Some(Box::new(Draft {
            status: Some(Status::Error),
            ..Default::default()
        }));
        assert_eq!(classify(ResourceKind::Dataset, &resource, at(12)), Decision::Nothing);
    }

    #[test]
    fn test_rest_maintenance_priorities() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Finalized;
        resource.is_rest = true;
        resource.rest = Some(RestParams {
            ttl: Some(Ttl {
                active: true,
                checked_at: None,
            }),
        });
        resource.exports = Some(Exports {
            rest_to_csv: Some(RestExport {
                active: true,
                next_export: Some(at(11)),
                last_export: None,
            }),
        });

        // ttl check outranks the export
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::TtlManager)
        );

        resource.rest.as_mut().unwrap().ttl.as_mut().unwrap().checked_at = Some(at(12));
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::RestExporterCsv)
        );
    }

    #[test]
    fn test_extension_schedule_flags_before_dispatch() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Finalized;
        resource.is_rest = true;
        resource.extensions = vec![Extension {
            active: true,
            needs_update: false,
            next_update: Some(at(11)),
        }];
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Apply(SideEffect::FlagExtensionUpdates)
        );

        resource.extensions[0].needs_update = true;
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Extender)
        );
    }

    #[test]
    fn test_partial_rest_ladder() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Finalized;
        resource.is_rest = true;

        resource.partial_rest_status = Some(Status::Updated);
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Indexer)
        );

        resource.extensions = vec![Extension {
            active: true,
            needs_update: false,
            next_update: None,
        }];
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Extender)
        );

        resource.partial_rest_status = Some(Status::Extended);
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Indexer)
        );

        resource.partial_rest_status = Some(Status::Indexed);
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Finalizer)
        );
    }

    #[test]
    fn test_meta_only_publication() {
        let mut resource = Resource::new("ds-1");
        resource.is_meta_only = true;
        resource.status = Status::Created;
        resource.publications = vec![Publication {
            target: Some("c".to_string()),
            status: PublicationStatus::Waiting,
            published_at: None,
        }];
        // created outranks publication by ladder order
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::Initializer)
        );

        resource.status = Status::Finalized;
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::DatasetPublisher)
        );
    }

    #[test]
    fn test_read_api_key_renewal() {
        let mut resource = Resource::new("ds-1");
        resource.status = Status::Finalized;
        resource.read_api_key = Some(ReadApiKey {
            active: true,
            renew_at: Some(at(11)),
            current: None,
        });
        assert_eq!(
            classify(ResourceKind::Dataset, &resource, at(12)),
            Decision::Dispatch(TaskId::ReadApiKeyRenewer)
        );
    }

    mod determinism {
        use super::*;
        use proptest::prelude::*;

        fn arb_dataset() -> impl Strategy<Value = Resource> {
            let statuses = vec![
                Status::Created,
                Status::Imported,
                Status::Loaded,
                Status::Stored,
                Status::Normalized,
                Status::Analyzed,
                Status::ValidationUpdated,
                Status::Validated,
                Status::Extended,
                Status::Updated,
                Status::Indexed,
                Status::Finalized,
                Status::Error,
            ];
            (
                proptest::sample::select(statuses.clone()),
                any::<bool>(),
                any::<bool>(),
                proptest::option::of(proptest::sample::select(statuses)),
            )
                .prop_map(|(status, is_rest, extended, partial)| {
                    let mut resource = Resource::new("ds-prop");
                    resource.status = status;
                    resource.is_rest = is_rest;
                    resource.partial_rest_status = partial;
                    if extended {
                        resource.extensions = vec![Extension {
                            active: true,
                            needs_update: false,
                            next_update: None,
                        }];
                    }
                    resource
                })
        }

        proptest! {
            #[test]
            fn test_same_document_same_decision(resource in arb_dataset()) {
                let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
                let first = classify(ResourceKind::Dataset, &resource, now);
                prop_assert_eq!(&first, &classify(ResourceKind::Dataset, &resource, now));

                // a store round-trip must not change the decision
                let doc = serde_json::to_value(&resource).unwrap();
                let reread: Resource = serde_json::from_value(doc).unwrap();
                prop_assert_eq!(&first, &classify(ResourceKind::Dataset, &reread, now));
            }
        }
    }

    #[test]
    fn test_application_and_catalog_ladders() {
        let mut app = Resource::new("app-1");
        assert_eq!(classify(ResourceKind::Application, &app, at(12)), Decision::Nothing);
        app.publications = vec![Publication {
            target: None,
            status: PublicationStatus::Deleted,
            published_at: None,
        }];
        assert_eq!(
            classify(ResourceKind::Application, &app, at(12)),
            Decision::Dispatch(TaskId::ApplicationPublisher)
        );

        let mut catalog = Resource::new("c-1");
        assert_eq!(classify(ResourceKind::Catalog, &catalog, at(12)), Decision::Nothing);
        catalog.auto_update = Some(AutoUpdate {
            active: true,
            next_update: Some(at(11)),
            last_update: None,
        });
        assert_eq!(
            classify(ResourceKind::Catalog, &catalog, at(12)),
            Decision::Dispatch(TaskId::CatalogHarvester)
        );
    }
}

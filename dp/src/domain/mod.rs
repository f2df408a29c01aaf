//! Domain types for managed resources
//!
//! A [`Resource`] is the document the pipeline operates on: a dataset,
//! application or catalog progressing through the processing stages.

mod resource;

pub use resource::{
    AutoUpdate, Draft, Exports, Extension, FileInfo, Publication, PublicationStatus, ReadApiKey, RemoteFile, Resource,
    ResourceKind, RestExport, RestParams, Status, Ttl, BASIC_TYPES, CSV_TYPES, GEOJSON_TYPE,
};

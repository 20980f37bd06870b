//! Elasticsearch projection (C5): generates index mappings from template
//! field types, and stores/retrieves/queries the decompressed semantic
//! form of records plus their `oip` envelope.

pub mod elasticsearch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Backend, Did, FieldType, Record, Template};
use crate::Result;

pub use elasticsearch::ElasticsearchProjection;

/// Which backend(s) a query should draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceFilter {
    Arweave,
    Gun,
    #[default]
    All,
}

/// Parameters accepted by `GET /records`, mirrored 1:1 into a query against
/// the projection.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub record_type: Option<String>,
    pub search: Option<String>,
    pub creator_did: Option<Did>,
    pub source: SourceFilter,
    pub sort_by: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub did: Option<Did>,
    pub block_height_min: Option<u64>,
    pub block_height_max: Option<u64>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self {
            limit: 20,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPage {
    pub records: Vec<Record>,
    pub next_offset: Option<usize>,
    pub total: u64,
}

/// Storage and query surface over the searchable index. One implementation
/// (`ElasticsearchProjection`) backs the daemon; tests use an in-memory
/// fake implementing the same trait.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Creates or updates the index mapping for `template`, converting
    /// field types to storage types. Must complete before any
    /// record using this template is indexed.
    async fn ensure_mapping(&self, template: &Template) -> Result<()>;

    /// Idempotent by DID: re-projecting the same record replaces the
    /// stored document.
    async fn index_record(&self, record: &Record) -> Result<()>;

    async fn get_record(&self, did: &Did) -> Result<Option<Record>>;

    async fn delete_record(&self, did: &Did) -> Result<()>;

    async fn search(&self, filter: &QueryFilter) -> Result<QueryPage>;

    /// Persists a template definition document (backs the Template
    /// Registry's durable store).
    async fn put_template(&self, template: &Template) -> Result<()>;

    async fn get_template(&self, template_id: &str) -> Result<Option<Template>>;

    async fn list_templates(&self) -> Result<Vec<Template>>;

    /// Reads the persisted Arweave high-water mark singleton.
    async fn get_high_water_mark(&self) -> Result<Option<u64>>;

    /// Persists the high-water mark. Callers must never call this with a
    /// value lower than the last persisted one.
    async fn set_high_water_mark(&self, block_height: u64) -> Result<()>;
}

/// Converts a template field type into the storage type used when
/// generating an Elasticsearch mapping.
pub fn mapping_type_for(field_type: &FieldType) -> &'static str {
    match field_type {
        FieldType::String => "text_keyword",
        FieldType::Long => "long",
        FieldType::Uint64 => "unsigned_long",
        FieldType::Float => "float",
        FieldType::Bool => "boolean",
        FieldType::Dref | FieldType::Enum { .. } => "keyword",
        FieldType::Repeated { element } => mapping_type_for(element),
    }
}

pub fn backend_matches(backend: Backend, filter: SourceFilter) -> bool {
    match filter {
        SourceFilter::All => true,
        SourceFilter::Arweave => backend == Backend::Arweave,
        SourceFilter::Gun => backend == Backend::Gun,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    #[test]
    fn mapping_types_match_spec_table() {
        assert_eq!(mapping_type_for(&FieldType::String), "text_keyword");
        assert_eq!(mapping_type_for(&FieldType::Long), "long");
        assert_eq!(mapping_type_for(&FieldType::Bool), "boolean");
        assert_eq!(mapping_type_for(&FieldType::Dref), "keyword");
        assert_eq!(
            mapping_type_for(&FieldType::Enum {
                values: vec!["a".into()]
            }),
            "keyword"
        );
        assert_eq!(
            mapping_type_for(&FieldType::Repeated {
                element: Box::new(FieldType::Long)
            }),
            "long"
        );
    }

    #[test]
    fn source_filter_matches_backend() {
        assert!(backend_matches(Backend::Arweave, SourceFilter::All));
        assert!(backend_matches(Backend::Gun, SourceFilter::All));
        assert!(backend_matches(Backend::Arweave, SourceFilter::Arweave));
        assert!(!backend_matches(Backend::Gun, SourceFilter::Arweave));
    }
}

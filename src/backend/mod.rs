//! Backend adapter abstraction (the design notes): Arweave and GUN are
//! two implementations of one capability set, so the sync supervisor
//! depends on the trait only.

pub mod arweave;
pub mod gun;

use async_trait::async_trait;

use crate::types::{Backend, Did, DeletionEntry, Record, Template};
use crate::Result;

/// One item observed on a backend since the last high-water mark.
#[derive(Debug, Clone)]
pub enum ObservedItem {
    Template(Template),
    Record {
        record: Record,
        raw_tuple: serde_json::Value,
        template_id: String,
    },
    Deletion(DeletionEntry),
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend(&self) -> Backend;

    /// Observes new items since `high_water`, in the order they must be
    /// applied (block-ascending, gateway order within a block).
    async fn observe_new_items(&self, high_water: Option<u64>) -> Result<Vec<ObservedItem>>;

    /// Fetches a single record by its backend-specific locator (the part of
    /// the DID after `did:<backend>:`). `Ok(None)` means a definitive
    /// not-found.
    async fn fetch(&self, did: &Did) -> Result<Option<Record>>;

    async fn put(&self, record: &Record) -> Result<Did>;

    async fn delete(&self, entry: &DeletionEntry) -> Result<()>;

    async fn is_absent(&self, did: &Did) -> Result<bool>;
}

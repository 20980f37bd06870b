//! HTTP API server state: the daemon's `Arc`-shared handles, mirroring the
//! teacher's `Arc<NamespaceManager>` pattern generalized to every
//! component a query or write handler needs.

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::arweave::ArweaveAdapter;
use crate::backend::gun::GunAdapter;
use crate::backend::BackendAdapter;
use crate::config::AppConfig;
use crate::deletion::DeletionRegistry;
use crate::ownership::OwnershipEngine;
use crate::projection::Projection;
use crate::resolver::{RecordSource, Resolver};
use crate::sync::CreatorRegistrationLookup;
use crate::template::TemplateRegistry;
use crate::types::{Backend, Did, Record};
use crate::Result;

pub struct Inner {
    pub config: AppConfig,
    pub projection: Arc<dyn Projection>,
    pub templates: Arc<TemplateRegistry>,
    pub resolver: Arc<Resolver>,
    pub ownership: Arc<OwnershipEngine>,
    pub deletions: Arc<DeletionRegistry>,
    pub arweave: Arc<ArweaveAdapter>,
    pub gun: Arc<GunAdapter>,
    /// Needed so `POST /templates` can reprocess records it drains the same
    /// way a sync loop does instead of leaving them pending
    /// until a backend happens to re-observe the template transaction.
    pub registrations: Arc<dyn CreatorRegistrationLookup>,
}

#[derive(Clone)]
pub struct AppState(pub Arc<Inner>);

impl Deref for AppState {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}

/// Bridges the resolver's need for a single `fetch(did)` capability to the
/// daemon's already-projected index, falling back to a direct backend fetch
/// for a reference the sync loop hasn't caught up to yet.
pub struct DaemonRecordSource {
    pub projection: Arc<dyn Projection>,
    pub arweave: Arc<ArweaveAdapter>,
    pub gun: Arc<GunAdapter>,
}

#[async_trait]
impl RecordSource for DaemonRecordSource {
    async fn fetch(&self, did: &Did) -> Result<Option<Record>> {
        if let Some(record) = self.projection.get_record(did).await? {
            return Ok(Some(record));
        }
        match did.backend()? {
            Backend::Arweave => self.arweave.fetch(did).await,
            Backend::Gun => self.gun.fetch(did).await,
        }
    }
}

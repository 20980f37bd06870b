//! Reference Resolver (C4): expands `dref` fields into nested records with
//! a depth limit, cycle detection, an LRU+TTL cache, and a 404-memoization
//! cache that defends against recursive 404 amplification.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::types::{Did, Record};
use crate::{Error, Result};

const NOT_FOUND_CACHE_CAPACITY: u64 = 10_000;
const NOT_FOUND_CACHE_TTL: Duration = Duration::from_secs(3600);
const PERMANENTLY_FAILED_CAPACITY: usize = 10_000;
const RETRY_BASE_DELAY_MS: u64 = 200;
const RETRY_MAX_ATTEMPTS: u32 = 2;

/// Capability the resolver needs to fetch a record it doesn't already have
/// locally. Implemented by the daemon's `Projection` + `BackendAdapter`
/// stack; tests supply an in-memory fake.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// `Ok(None)` means definitively absent (a 404), distinct from `Err`
    /// which means the fetch itself failed (transient or permanent).
    async fn fetch(&self, did: &Did) -> Result<Option<Record>>;
}

/// A record with its `dref` fields expanded, up to the caller's depth
/// budget. References left unexpanded (depth exhausted, cycle, or 404)
/// still carry the original DID string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub record: Record,
    pub references: Vec<ResolvedReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub did: Did,
    pub expansion: ReferenceExpansion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReferenceExpansion {
    Expanded(Box<ResolvedRecord>),
    /// Depth budget exhausted or a cycle was hit; left as the DID string.
    Unexpanded,
    /// The backend definitively reports this DID absent.
    NotFound,
}

pub struct Resolver {
    source: Arc<dyn RecordSource>,
    cache: Cache<Did, Record>,
    not_found_cache: Cache<Did, ()>,
    permanently_failed: Mutex<LruCache<Did, String>>,
}

impl Resolver {
    pub fn new(source: Arc<dyn RecordSource>, max_entries: u64, ttl_ms: u64) -> Self {
        Self {
            source,
            cache: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(Duration::from_millis(ttl_ms))
                .build(),
            not_found_cache: Cache::builder()
                .max_capacity(NOT_FOUND_CACHE_CAPACITY)
                .time_to_live(NOT_FOUND_CACHE_TTL)
                .build(),
            permanently_failed: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(PERMANENTLY_FAILED_CAPACITY).unwrap(),
            )),
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache.entry_count();
        debug!(entries = hits, "resolver cache snapshot");
        // moka doesn't expose a hit/miss ratio directly; entry_count is the
        // best available proxy without adding a metrics crate.
        hits as f64
    }

    pub fn mark_permanently_failed(&self, did: Did, reason: impl Into<String>) {
        self.permanently_failed.lock().put(did, reason.into());
    }

    fn is_permanently_failed(&self, did: &Did) -> bool {
        self.permanently_failed.lock().contains(did)
    }

    /// Resolves `record`'s `dref` fields to `depth` hops.
    pub async fn resolve(&self, record: Record, depth: u32) -> ResolvedRecord {
        let mut visited = HashSet::new();
        visited.insert(record.did.clone());
        self.resolve_inner(record, depth, visited).await
    }

    fn resolve_inner<'a>(
        &'a self,
        record: Record,
        depth: u32,
        visited: HashSet<Did>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ResolvedRecord> + Send + 'a>> {
        Box::pin(async move {
            let direct_refs: Vec<Did> = record.direct_references().into_iter().cloned().collect();
            let mut references = Vec::with_capacity(direct_refs.len());

            for did in direct_refs {
                let expansion = if depth == 0 || visited.contains(&did) {
                    ReferenceExpansion::Unexpanded
                } else {
                    match self.fetch_with_policy(&did).await {
                        Ok(Some(target)) => {
                            let mut next_visited = visited.clone();
                            next_visited.insert(did.clone());
                            let resolved =
                                self.resolve_inner(target, depth - 1, next_visited).await;
                            ReferenceExpansion::Expanded(Box::new(resolved))
                        }
                        Ok(None) => ReferenceExpansion::NotFound,
                        Err(_) => ReferenceExpansion::Unexpanded,
                    }
                };
                references.push(ResolvedReference { did, expansion });
            }

            ResolvedRecord { record, references }
        })
    }

    /// Looks up `did` honoring the cache, 404 cache, permanently-failed
    /// set, and retry/backoff policy.
    async fn fetch_with_policy(&self, did: &Did) -> Result<Option<Record>> {
        if let Some(record) = self.cache.get(did) {
            return Ok(Some(record));
        }
        if self.not_found_cache.get(did).is_some() {
            return Ok(None);
        }
        if self.is_permanently_failed(did) {
            return Err(Error::not_found(format!("{did} permanently failed")));
        }

        let mut attempt = 0;
        loop {
            match self.source.fetch(did).await {
                Ok(Some(record)) => {
                    self.cache.insert(did.clone(), record.clone());
                    return Ok(Some(record));
                }
                Ok(None) => {
                    self.not_found_cache.insert(did.clone(), ());
                    return Ok(None);
                }
                Err(e) if e.is_transient() && attempt < RETRY_MAX_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                    warn!(did = %did, attempt, delay_ms = delay, "transient resolver fetch failure, retrying");
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(e);
                }
                Err(e) => {
                    self.mark_permanently_failed(did.clone(), e.to_string());
                    return Err(e);
                }
            }
        }
    }
}

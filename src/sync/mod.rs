//! Sync supervisor: wires the Arweave and GUN backend adapters into the
//! template registry, codec, signature engine, deletion registry, and
//! projection, as long-lived cooperative tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{BackendAdapter, ObservedItem};
use crate::codec;
use crate::deletion::DeletionRegistry;
use crate::projection::Projection;
use crate::signature::{self, CreatorRegistration};
use crate::template::TemplateRegistry;
use crate::Result;

/// Bounds concurrent in-flight transaction/soul fetches within one loop
/// iteration.
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub max_in_flight_fetches: usize,
}

/// Runs one backend's sync loop until `cancel` fires. A single iteration:
/// observe new items, process each (deferring on missing template),
/// advance the high-water mark only once every item at a given height has
/// been attempted.
pub async fn run_sync_loop(
    adapter: Arc<dyn BackendAdapter>,
    projection: Arc<dyn Projection>,
    templates: Arc<TemplateRegistry>,
    deletions: Arc<DeletionRegistry>,
    registrations: Arc<dyn CreatorRegistrationLookup>,
    config: SyncConfig,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_in_flight_fetches.max(1)));
    let backend = adapter.backend();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(?backend, "sync loop cancelled");
                return;
            }
            _ = tokio::time::sleep(config.poll_interval) => {}
        }

        let high_water = match projection.get_high_water_mark().await {
            Ok(h) => h,
            Err(e) => {
                warn!(?backend, error = %e, "failed to read high-water mark, skipping cycle");
                continue;
            }
        };

        let items = match adapter.observe_new_items(high_water).await {
            Ok(items) => items,
            Err(e) if e.is_transient() => {
                warn!(?backend, error = %e, "transient error observing new items, will retry next cycle");
                continue;
            }
            Err(e) => {
                error!(?backend, error = %e, "permanent error observing new items");
                continue;
            }
        };

        let _permit = semaphore.acquire().await;
        let mut max_height_fully_processed = high_water;

        for item in items {
            match item {
                ObservedItem::Template(template) => match templates.register(template).await {
                    Ok((template_id, drained)) => {
                        // Drained records don't advance the high-water mark
                        // here: their own block height (if any) was already
                        // below `high_water` when they were first deferred,
                        // so it can never raise `max_height_fully_processed`.
                        reprocess_drained(
                            &templates,
                            &projection,
                            registrations.as_ref(),
                            &template_id,
                            drained,
                        )
                        .await;
                    }
                    Err(e) => warn!(?backend, error = %e, "failed to register template"),
                },
                ObservedItem::Record { record, raw_tuple, template_id } => {
                    let height = record.oip.block_height;
                    match process_record(
                        &templates,
                        &projection,
                        registrations.as_ref(),
                        &template_id,
                        raw_tuple,
                        record,
                    )
                    .await
                    {
                        Ok(()) => {
                            if let Some(h) = height {
                                max_height_fully_processed = Some(
                                    max_height_fully_processed.map(|m| m.max(h)).unwrap_or(h),
                                );
                            }
                        }
                        Err(e) if e.is_transient() => {
                            warn!(?backend, error = %e, "transient record processing failure, will retry");
                            // A transient failure means this height is not
                            // fully processed; stop advancing further.
                            break;
                        }
                        Err(e) => {
                            warn!(?backend, error = %e, "permanent record processing failure");
                        }
                    }
                }
                ObservedItem::Deletion(entry) => match deletions.process(&entry).await {
                    Ok(outcome) => info!(?backend, did = %entry.did, ?outcome, "processed deletion entry"),
                    Err(e) => warn!(?backend, error = %e, "failed to process deletion entry"),
                },
            }
        }

        if let Some(height) = max_height_fully_processed {
            let advanced = high_water.map(|h| height > h).unwrap_or(true);
            if advanced {
                if let Err(e) = projection.set_high_water_mark(height).await {
                    warn!(?backend, error = %e, "failed to persist high-water mark");
                } else {
                    info!(?backend, block_height = height, "high-water mark advanced");
                }
            }
        }
    }
}

/// Reprocesses pending records drained by `TemplateRegistry::register`,
/// regardless of which path registered the template — the sync loops call
/// this inline, and the HTTP `POST /templates` handler calls it too, since
/// a record deferred on a missing template is reprocessed once that
/// template is known, no matter how it became known.
pub async fn reprocess_drained(
    templates: &TemplateRegistry,
    projection: &Arc<dyn Projection>,
    registrations: &dyn CreatorRegistrationLookup,
    template_id: &str,
    drained: Vec<crate::template::PendingRecord>,
) {
    for pending in drained {
        if let Err(e) = process_record(
            templates,
            projection,
            registrations,
            template_id,
            pending.raw_tuple,
            pending.record,
        )
        .await
        {
            warn!(error = %e, template_id, "failed to process pending record drained on template registration");
        }
    }
}

pub(crate) async fn process_record(
    templates: &TemplateRegistry,
    projection: &Arc<dyn Projection>,
    registrations: &dyn CreatorRegistrationLookup,
    template_id: &str,
    raw_tuple: serde_json::Value,
    mut record: crate::types::Record,
) -> Result<()> {
    // GUN records arrive already semantically decoded (node body is
    // `{oip, data}`, not a compressed tuple) and carry no template_id — skip
    // template resolution/decompression entirely in that case. Arweave
    // always supplies a non-empty template_id (the real id once its
    // template is known, or the `RecordType` name while it's still pending).
    if !template_id.is_empty() {
        let Some(template) = templates.lookup_by_id(template_id).await else {
            templates.defer(record, template_id.to_string(), raw_tuple).await;
            return Ok(());
        };

        if !raw_tuple.is_null() && raw_tuple.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            let decoded = codec::decompress(&template, &raw_tuple)?;
            record.data.insert(template.name.clone(), decoded);
        }
    }

    let registration = registrations.lookup(&record.oip.creator_did).await?;
    let height = record.oip.block_height.unwrap_or(0);
    let payload = serde_json::to_value(&record)?;
    let outcome = signature::verify(
        &registration,
        &record.oip.creator_signature,
        &payload,
        None,
        height,
    )?;
    if !outcome.is_valid {
        return Err(crate::Error::signature_invalid(
            outcome.reason.unwrap_or_else(|| "unknown".to_string()),
        ));
    }

    projection.index_record(&record).await
}


/// Resolves a creator DID to its registration document (legacy xpub or
/// v0.9 DID document). Implemented against the projection's users index in
/// the full daemon; tests inject a fixed map.
#[async_trait::async_trait]
pub trait CreatorRegistrationLookup: Send + Sync {
    async fn lookup(&self, creator_did: &crate::types::Did) -> Result<CreatorRegistration>;
}

/// A `dashmap`-backed `CreatorRegistrationLookup` populated by the
/// `creatorRegistration` record type as the sync loop observes it, the way
/// `TemplateRegistry` builds its own in-memory map from observed `Template`
/// items. Registrations never expire; a creator re-registering overwrites
/// their previous entry.
pub struct RegistrationRegistry {
    by_creator: dashmap::DashMap<crate::types::Did, CreatorRegistration>,
}

impl RegistrationRegistry {
    pub fn new() -> Self {
        Self {
            by_creator: dashmap::DashMap::new(),
        }
    }

    pub fn register(&self, creator_did: crate::types::Did, registration: CreatorRegistration) {
        self.by_creator.insert(creator_did, registration);
    }
}

impl Default for RegistrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CreatorRegistrationLookup for RegistrationRegistry {
    async fn lookup(&self, creator_did: &crate::types::Did) -> Result<CreatorRegistration> {
        self.by_creator
            .get(creator_did)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| crate::Error::not_found(format!("no registration for {creator_did}")))
    }
}

//! Template Registry (C1): holds active template schemas and provides
//! name→id, id→schema, and field-index↔field-name maps. Single-writer,
//! many-reader, guarded by a `RwLock` around an in-memory map.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::projection::Projection;
use crate::types::{Record, Template, TemplateField, TemplateId};
use crate::{Error, Result};

/// A record that arrived referencing a template the registry doesn't yet
/// know about. Reprocessed once `register` succeeds for the missing
/// template. `missing_template` may be either a
/// real `template_id` or a template *name* — Arweave only knows the
/// `RecordType` name tag at observe time, before the template transaction
/// itself has been seen, so it defers by name; `register`'s drain matches
/// either. `raw_tuple` preserves the not-yet-decompressible wire payload so
/// the codec can run once the template becomes known.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub record: Record,
    pub missing_template: TemplateId,
    pub raw_tuple: serde_json::Value,
    pub first_seen: DateTime<Utc>,
}

struct Inner {
    by_id: HashMap<TemplateId, Template>,
    by_name: HashMap<String, TemplateId>,
    pending: Vec<PendingRecord>,
}

/// In-memory registry of active templates, rebuilt at startup from the
/// projection's persisted template documents and kept current by
/// `register`.
pub struct TemplateRegistry {
    inner: RwLock<Inner>,
    projection: Arc<dyn Projection>,
}

impl TemplateRegistry {
    pub fn new(projection: Arc<dyn Projection>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                pending: Vec::new(),
            }),
            projection,
        }
    }

    /// Rebuilds the in-memory map by listing the projection's persisted
    /// templates, as a manifest rebuild at startup.
    pub async fn rebuild(&self) -> Result<()> {
        let templates = self.projection.list_templates().await?;
        let mut inner = self.inner.write().await;
        inner.by_id.clear();
        inner.by_name.clear();
        for template in templates {
            inner.by_name.insert(template.name.clone(), template.template_id.clone());
            inner.by_id.insert(template.template_id.clone(), template);
        }
        info!(count = inner.by_id.len(), "template registry rebuilt");
        Ok(())
    }

    /// Accepts a new schema (already carrying dense field indices — the
    /// HTTP layer allocates indices for fields the caller omitted before
    /// constructing this `Template`), persists it, and applies the index
    /// mapping so it's in place before any record using it is indexed.
    /// Returns the drained pending records that were waiting on this id.
    pub async fn register(&self, template: Template) -> Result<(TemplateId, Vec<PendingRecord>)> {
        validate_dense_indices(&template.fields)?;

        self.projection.ensure_mapping(&template).await?;
        self.projection.put_template(&template).await?;

        let mut inner = self.inner.write().await;
        inner.by_name.insert(template.name.clone(), template.template_id.clone());
        let drained: Vec<PendingRecord> = {
            let (matching, rest): (Vec<_>, Vec<_>) = inner.pending.drain(..).partition(|p| {
                p.missing_template == template.template_id || p.missing_template == template.name
            });
            inner.pending = rest;
            matching
        };
        let id = template.template_id.clone();
        inner.by_id.insert(template.template_id.clone(), template);
        info!(template_id = %id, pending_drained = drained.len(), "template registered");
        Ok((id, drained))
    }

    pub async fn lookup_by_name(&self, name: &str) -> Option<Template> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(name)?;
        inner.by_id.get(id).cloned()
    }

    pub async fn lookup_by_id(&self, id: &str) -> Option<Template> {
        let inner = self.inner.read().await;
        inner.by_id.get(id).cloned()
    }

    /// Templates a sync loop may use to decide whether an incoming record
    /// is processable right now.
    pub async fn active_templates(&self) -> Vec<TemplateId> {
        self.inner.read().await.by_id.keys().cloned().collect()
    }

    /// Parks a record whose template is not yet known. Defers processing
    /// rather than rejecting it permanently (TemplateMissing is a
    /// deferral, never a permanent failure).
    pub async fn defer(&self, record: Record, missing_template: TemplateId, raw_tuple: serde_json::Value) {
        warn!(template_id = %missing_template, did = %record.did, "record deferred: template missing");
        self.inner.write().await.pending.push(PendingRecord {
            record,
            missing_template,
            raw_tuple,
            first_seen: Utc::now(),
        });
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.pending.len()
    }
}

/// Rejects a template whose field indices are not exactly `0..fields.len()`
/// (the invariant: "dense starting at 0").
fn validate_dense_indices(fields: &[TemplateField]) -> Result<()> {
    let mut indices: Vec<u32> = fields.iter().map(|f| f.index).collect();
    indices.sort_unstable();
    let expected: Vec<u32> = (0..fields.len() as u32).collect();
    if indices != expected {
        return Err(Error::InvalidRequest(format!(
            "template field indices must be dense starting at 0, got {indices:?}"
        )));
    }
    Ok(())
}

/// Allocates dense, zero-based indices for fields the caller did not
/// supply one for, preserving any explicitly supplied index. Used by the
/// HTTP registration handler before constructing the `Template` passed to
/// `register`.
pub fn assign_missing_indices(fields: &mut [TemplateField], explicit_mask: &[bool]) {
    let mut next = explicit_mask
        .iter()
        .zip(fields.iter())
        .filter(|(explicit, _)| **explicit)
        .map(|(_, f)| f.index + 1)
        .max()
        .unwrap_or(0);
    for (field, has_explicit) in fields.iter_mut().zip(explicit_mask) {
        if !*has_explicit {
            field.index = next;
            next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeProjection {
        templates: StdMutex<HashMap<String, Template>>,
    }

    impl FakeProjection {
        fn new() -> Self {
            Self {
                templates: StdMutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl Projection for FakeProjection {
        async fn ensure_mapping(&self, _template: &Template) -> Result<()> {
            Ok(())
        }
        async fn index_record(&self, _record: &Record) -> Result<()> {
            Ok(())
        }
        async fn get_record(&self, _did: &crate::types::Did) -> Result<Option<Record>> {
            Ok(None)
        }
        async fn delete_record(&self, _did: &crate::types::Did) -> Result<()> {
            Ok(())
        }
        async fn search(
            &self,
            _filter: &crate::projection::QueryFilter,
        ) -> Result<crate::projection::QueryPage> {
            Ok(crate::projection::QueryPage {
                records: vec![],
                next_offset: None,
                total: 0,
            })
        }
        async fn put_template(&self, template: &Template) -> Result<()> {
            self.templates
                .lock()
                .unwrap()
                .insert(template.template_id.clone(), template.clone());
            Ok(())
        }
        async fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
            Ok(self.templates.lock().unwrap().get(template_id).cloned())
        }
        async fn list_templates(&self) -> Result<Vec<Template>> {
            Ok(self.templates.lock().unwrap().values().cloned().collect())
        }
        async fn get_high_water_mark(&self) -> Result<Option<u64>> {
            Ok(None)
        }
        async fn set_high_water_mark(&self, _block_height: u64) -> Result<()> {
            Ok(())
        }
    }

    fn sample_template() -> Template {
        Template {
            template_id: "tx-greeting".to_string(),
            name: "greeting".to_string(),
            fields: vec![TemplateField {
                name: "title".to_string(),
                field_type: FieldType::String,
                index: 0,
            }],
        }
    }

    #[tokio::test]
    async fn register_then_lookup_by_name_and_id() {
        let registry = TemplateRegistry::new(Arc::new(FakeProjection::new()));
        let (id, drained) = registry.register(sample_template()).await.unwrap();
        assert!(drained.is_empty());
        assert_eq!(registry.lookup_by_id(&id).await.unwrap().name, "greeting");
        assert_eq!(
            registry.lookup_by_name("greeting").await.unwrap().template_id,
            id
        );
    }

    #[tokio::test]
    async fn assign_missing_indices_is_dense_and_preserves_explicit() {
        let mut fields = vec![
            TemplateField {
                name: "a".into(),
                field_type: FieldType::String,
                index: 0,
            },
            TemplateField {
                name: "b".into(),
                field_type: FieldType::Long,
                index: 0,
            },
        ];
        assign_missing_indices(&mut fields, &[true, false]);
        assert_eq!(fields[0].index, 0);
        assert_eq!(fields[1].index, 1);
    }

    #[tokio::test]
    async fn pending_record_drains_when_template_registers() {
        let registry = TemplateRegistry::new(Arc::new(FakeProjection::new()));
        let record = Record {
            did: "did:arweave:tx1".into(),
            data: HashMap::new(),
            oip: crate::types::OipEnvelope {
                creator_did: "did:arweave:creator".into(),
                creator_signature: "sig".to_string(),
                backend: crate::types::Backend::Arweave,
                encrypted: false,
                block_height: Some(101),
                indexed_at: Utc::now(),
                storage_manifest: None,
            },
        };
        registry.defer(record, "tx-greeting".to_string(), serde_json::json!({})).await;
        assert_eq!(registry.pending_count().await, 1);

        let (_, drained) = registry.register(sample_template()).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.pending_count().await, 0);
    }
}

//! Drives one full cycle of `run_sync_loop` against a fake backend
//! adapter: a template and a signed record observed together, indexed,
//! and found again through a `recordType` query — the publish-then-sync
//! path end to end rather than unit-testing its pieces in isolation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use oipd::backend::{BackendAdapter, ObservedItem};
use oipd::deletion::DeletionRegistry;
use oipd::ownership::OwnershipEngine;
use oipd::projection::{Projection, QueryFilter, QueryPage};
use oipd::signature::{self, CreatorRegistration};
use oipd::sync::{run_sync_loop, RegistrationRegistry, SyncConfig};
use oipd::template::TemplateRegistry;
use oipd::types::{Backend, DeletionEntry, Did, FieldValue, OipEnvelope, Record, Template, TemplateData, TemplateField, FieldType};
use oipd::{codec, Result};
use tokio_util::sync::CancellationToken;

/// A well-known test mnemonic (the all-"abandon" BIP-39 vector), used only
/// to derive a throwaway HD keypair for signing this test's fixture.
const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

/// Records every semantic field under `data.<template_name>`, mirroring
/// `ElasticsearchProjection`'s document shape, so a `recordType` query only
/// matches where a real deployment's mapping would.
struct InMemoryProjection {
    records: Mutex<HashMap<String, Record>>,
    high_water: Mutex<Option<u64>>,
}

impl InMemoryProjection {
    fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            high_water: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Projection for InMemoryProjection {
    async fn ensure_mapping(&self, _template: &Template) -> Result<()> {
        Ok(())
    }
    async fn index_record(&self, record: &Record) -> Result<()> {
        self.records.lock().unwrap().insert(record.did.as_str().to_string(), record.clone());
        Ok(())
    }
    async fn get_record(&self, did: &Did) -> Result<Option<Record>> {
        Ok(self.records.lock().unwrap().get(did.as_str()).cloned())
    }
    async fn delete_record(&self, did: &Did) -> Result<()> {
        self.records.lock().unwrap().remove(did.as_str());
        Ok(())
    }
    async fn search(&self, filter: &QueryFilter) -> Result<QueryPage> {
        let records: Vec<Record> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| match &filter.record_type {
                Some(rt) => r.data.contains_key(rt),
                None => true,
            })
            .cloned()
            .collect();
        Ok(QueryPage {
            total: records.len() as u64,
            records,
            next_offset: None,
        })
    }
    async fn put_template(&self, _template: &Template) -> Result<()> {
        Ok(())
    }
    async fn get_template(&self, _template_id: &str) -> Result<Option<Template>> {
        Ok(None)
    }
    async fn list_templates(&self) -> Result<Vec<Template>> {
        Ok(vec![])
    }
    async fn get_high_water_mark(&self) -> Result<Option<u64>> {
        Ok(*self.high_water.lock().unwrap())
    }
    async fn set_high_water_mark(&self, block_height: u64) -> Result<()> {
        *self.high_water.lock().unwrap() = Some(block_height);
        Ok(())
    }
}

/// Emits one template and one matching record on every poll, the way an
/// Arweave gateway replaying its full history would before a high-water
/// mark has filtered anything out. Re-emission is harmless: both
/// `TemplateRegistry::register` and `process_record`/`index_record` are
/// idempotent for the same id/DID.
struct FakeBackendAdapter {
    template: Template,
    record: Record,
    raw_tuple: serde_json::Value,
    served: AtomicBool,
}

#[async_trait]
impl BackendAdapter for FakeBackendAdapter {
    fn backend(&self) -> Backend {
        Backend::Arweave
    }

    async fn observe_new_items(&self, _high_water: Option<u64>) -> Result<Vec<ObservedItem>> {
        // Only one cycle's worth of work is needed for this test; returning
        // nothing on later polls keeps the assertions simple.
        if self.served.swap(true, Ordering::SeqCst) {
            return Ok(vec![]);
        }
        Ok(vec![
            ObservedItem::Template(self.template.clone()),
            ObservedItem::Record {
                record: self.record.clone(),
                raw_tuple: self.raw_tuple.clone(),
                template_id: self.template.template_id.clone(),
            },
        ])
    }

    async fn fetch(&self, _did: &Did) -> Result<Option<Record>> {
        Ok(None)
    }

    async fn put(&self, record: &Record) -> Result<Did> {
        Ok(record.did.clone())
    }

    async fn delete(&self, _entry: &DeletionEntry) -> Result<()> {
        Ok(())
    }

    async fn is_absent(&self, _did: &Did) -> Result<bool> {
        Ok(true)
    }
}

fn greeting_template() -> Template {
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

/// Builds a template, a signed record instantiating it at block 101, the
/// compressed wire tuple for it, and the `CreatorRegistration` a verifier
/// needs to check that signature — everything `run_sync_loop` needs to
/// take the record from "observed" to "indexed".
fn signed_fixture() -> (Template, Record, serde_json::Value, Did, CreatorRegistration) {
    let template = greeting_template();

    let xprv = oipd::ownership::master_key_from_mnemonic(TEST_MNEMONIC, "").unwrap();
    let secret_key_hex = hex::encode(xprv.private_key().to_bytes());
    let public_key_hex = signature::node_wallet_public_key_hex(&secret_key_hex).unwrap();
    let creator_did = signature::creator_did_from_public_key(&public_key_hex);
    let xpub = xprv.public_key().to_string();
    let registration = CreatorRegistration::Legacy { xpub };

    let mut title_field: TemplateData = HashMap::new();
    title_field.insert("title".to_string(), FieldValue::String("hi".to_string()));
    let raw_tuple = codec::compress(&template, &title_field).unwrap();

    let mut data = HashMap::new();
    data.insert("greeting".to_string(), title_field);

    let mut record = Record {
        did: Did::new(Backend::Arweave, "tx-record-1", None),
        data,
        oip: OipEnvelope {
            creator_did: creator_did.clone(),
            creator_signature: String::new(),
            backend: Backend::Arweave,
            encrypted: false,
            block_height: Some(101),
            indexed_at: Utc::now(),
            storage_manifest: None,
        },
    };

    let payload = serde_json::to_value(&record).unwrap();
    let (_pubkey_check, signature_b64) = signature::sign_with_node_key(&secret_key_hex, &payload).unwrap();
    record.oip.creator_signature = signature_b64;

    // The record handed to the sync loop arrives pre-decompression, the
    // way Arweave's adapter emits it: `data` empty, the semantic fields
    // only present in `raw_tuple`.
    let mut wire_record = record.clone();
    wire_record.data = HashMap::new();

    (template, wire_record, raw_tuple, creator_did, registration)
}

#[tokio::test]
async fn publish_then_sync_makes_the_record_queryable() {
    let (template, wire_record, raw_tuple, creator_did, registration) = signed_fixture();

    let projection: Arc<dyn Projection> = Arc::new(InMemoryProjection::new());
    let templates = Arc::new(TemplateRegistry::new(projection.clone()));
    let ownership = Arc::new(OwnershipEngine::new("test-secret".to_string(), None, None));
    let deletions = Arc::new(DeletionRegistry::new(projection.clone(), ownership, None));

    let registrations = Arc::new(RegistrationRegistry::new());
    registrations.register(creator_did, registration);

    let adapter: Arc<dyn BackendAdapter> = Arc::new(FakeBackendAdapter {
        template,
        record: wire_record,
        raw_tuple,
        served: AtomicBool::new(false),
    });

    let cancel = CancellationToken::new();
    let loop_handle = tokio::spawn(run_sync_loop(
        adapter,
        projection.clone(),
        templates,
        deletions,
        registrations,
        SyncConfig {
            poll_interval: Duration::from_millis(5),
            max_in_flight_fetches: 4,
        },
        cancel.clone(),
    ));

    // One poll interval plus slack for the first cycle to complete.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    loop_handle.await.unwrap();

    let page = projection
        .search(&QueryFilter {
            record_type: Some("greeting".to_string()),
            ..QueryFilter::new()
        })
        .await
        .unwrap();

    assert_eq!(page.total, 1);
    assert_eq!(page.records.len(), 1);
    let record = &page.records[0];
    let greeting_fields = record.data.get("greeting").expect("greeting data must be present");
    assert_eq!(
        greeting_fields.get("title"),
        Some(&FieldValue::String("hi".to_string()))
    );
    assert_eq!(record.oip.block_height, Some(101));
    assert_eq!(projection.get_high_water_mark().await.unwrap(), Some(101));
}

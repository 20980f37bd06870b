//! Deletion Registry (C8): network-visible append-only record of intended
//! deletions, with an authorization check applied locally by every node
//! that observes one.

use std::sync::Arc;

use tracing::{info, warn};

use crate::ownership::{OwnershipEngine, RequestPrincipal};
use crate::projection::Projection;
use crate::signature::public_key_prefix;
use crate::types::{Did, DeletionEntry, Record};
use crate::Result;

/// Outcome of processing one deletion entry, surfaced for logging/tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Target not yet indexed; the intent should be re-evaluated when it
    /// appears.
    TargetPending,
    Applied,
    Unauthorized,
}

pub struct DeletionRegistry {
    projection: Arc<dyn Projection>,
    ownership: Arc<OwnershipEngine>,
    node_wallet_public_key: Option<String>,
}

impl DeletionRegistry {
    pub fn new(
        projection: Arc<dyn Projection>,
        ownership: Arc<OwnershipEngine>,
        node_wallet_public_key: Option<String>,
    ) -> Self {
        Self {
            projection,
            ownership,
            node_wallet_public_key,
        }
    }

    /// Processes one deletion entry, regardless of which backend it came
    /// from, under one shared authorization contract.
    pub async fn process(&self, entry: &DeletionEntry) -> Result<DeletionOutcome> {
        let Some(target) = self.projection.get_record(&entry.did).await? else {
            info!(did = %entry.did, "deletion target not yet indexed, deferring");
            return Ok(DeletionOutcome::TargetPending);
        };

        if self.is_authorized(&entry.did, &target, entry) {
            self.projection.delete_record(&entry.did).await?;
            info!(did = %entry.did, deleter = %entry.deleted_by_public_key, "deletion applied");
            Ok(DeletionOutcome::Applied)
        } else {
            warn!(
                target: "security",
                did = %entry.did,
                deleter = %entry.deleted_by_public_key,
                "unauthorized deletion attempt, ignored"
            );
            Ok(DeletionOutcome::Unauthorized)
        }
    }

    /// Cheap local authorization pre-check the HTTP layer runs before
    /// publishing a deletion entry, so obviously-unauthorized deletions
    /// never get published at all. The authoritative check is `process`,
    /// re-run by every node that later observes the entry.
    pub fn precheck(&self, did: &Did, target: &Record, entry: &DeletionEntry) -> bool {
        self.is_authorized(did, target, entry)
    }

    /// Owner match on `accessControl`/`conversationSession` takes precedence
    /// when present; else `did:gun:<prefix>` hash match; else
    /// `oip.creator_did` fallback. The admin-domain override is a separate,
    /// always-available gate that can authorize a deletion none of those
    /// three branches would.
    fn is_authorized(&self, did: &Did, target: &Record, entry: &DeletionEntry) -> bool {
        let primary_authorized = if let Some(owner) = explicit_owner_public_key(target) {
            owner == entry.deleted_by_public_key
        } else if did.parse_parts().map(|(b, _, _)| b == crate::types::Backend::Gun).unwrap_or(false) {
            match gun_did_prefix(did) {
                Some(prefix) => prefix == public_key_prefix(&entry.deleted_by_public_key, prefix.len()),
                None => false,
            }
        } else {
            target.oip.creator_did.as_str().contains(&entry.deleted_by_public_key)
        };

        if primary_authorized {
            return true;
        }

        // `creator_did`'s locator is always a hash of the signing public key
        // (see `signature::creator_did_from_public_key`), never the raw key
        // itself, so the node wallet's raw hex key must be hashed the same
        // way before comparison.
        let signed_by_node_wallet = self
            .node_wallet_public_key
            .as_deref()
            .map(|wallet| {
                let wallet_hash = public_key_prefix(wallet, 12);
                target
                    .oip
                    .creator_did
                    .parse_parts()
                    .map(|(_, locator, _)| locator == wallet_hash)
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        let principal = RequestPrincipal {
            public_key: Some(entry.deleted_by_public_key.clone()),
            email_domain: None,
        };
        self.ownership.is_admin_override(&principal, signed_by_node_wallet)
    }
}

fn explicit_owner_public_key(record: &Record) -> Option<String> {
    for (template_name, fields) in &record.data {
        if template_name == "accessControl" || template_name == "conversationSession" {
            if let Some(crate::types::FieldValue::String(owner)) = fields.get("owner_public_key") {
                return Some(owner.clone());
            }
        }
    }
    None
}

fn gun_did_prefix(did: &Did) -> Option<String> {
    let (_, locator, _) = did.parse_parts().ok()?;
    Some(locator.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Backend, FieldValue, OipEnvelope, TemplateData};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeProjection {
        records: StdMutex<HashMap<String, Record>>,
    }

    impl FakeProjection {
        fn with(records: Vec<Record>) -> Self {
            Self {
                records: StdMutex::new(records.into_iter().map(|r| (r.did.as_str().to_string(), r)).collect()),
            }
        }
    }

    #[async_trait]
    impl Projection for FakeProjection {
        async fn ensure_mapping(&self, _t: &crate::types::Template) -> Result<()> {
            Ok(())
        }
        async fn index_record(&self, _r: &Record) -> Result<()> {
            Ok(())
        }
        async fn get_record(&self, did: &Did) -> Result<Option<Record>> {
            Ok(self.records.lock().unwrap().get(did.as_str()).cloned())
        }
        async fn delete_record(&self, did: &Did) -> Result<()> {
            self.records.lock().unwrap().remove(did.as_str());
            Ok(())
        }
        async fn search(&self, _f: &crate::projection::QueryFilter) -> Result<crate::projection::QueryPage> {
            Ok(crate::projection::QueryPage { records: vec![], next_offset: None, total: 0 })
        }
        async fn put_template(&self, _t: &crate::types::Template) -> Result<()> {
            Ok(())
        }
        async fn get_template(&self, _id: &str) -> Result<Option<crate::types::Template>> {
            Ok(None)
        }
        async fn list_templates(&self) -> Result<Vec<crate::types::Template>> {
            Ok(vec![])
        }
        async fn get_high_water_mark(&self) -> Result<Option<u64>> {
            Ok(None)
        }
        async fn set_high_water_mark(&self, _h: u64) -> Result<()> {
            Ok(())
        }
    }

    fn record_with_owner(did: &str, owner: &str) -> Record {
        let mut access_control: TemplateData = HashMap::new();
        access_control.insert("owner_public_key".to_string(), FieldValue::String(owner.to_string()));
        let mut data = HashMap::new();
        data.insert("accessControl".to_string(), access_control);
        Record {
            did: did.into(),
            data,
            oip: OipEnvelope {
                creator_did: Did::new(Backend::Gun, owner, None),
                creator_signature: "sig".into(),
                backend: Backend::Gun,
                encrypted: false,
                block_height: None,
                indexed_at: Utc::now(),
                storage_manifest: None,
            },
        }
    }

    fn registry_with(record: Record) -> DeletionRegistry {
        let projection = Arc::new(FakeProjection::with(vec![record]));
        let ownership = Arc::new(OwnershipEngine::for_tests());
        DeletionRegistry::new(projection, ownership, None)
    }

    #[tokio::test]
    async fn owner_deletion_is_applied() {
        let record = record_with_owner("did:gun:abcdef012345:r1", "owner-pub");
        let registry = registry_with(record);
        let entry = DeletionEntry {
            did: "did:gun:abcdef012345:r1".into(),
            deleted_by_public_key: "owner-pub".to_string(),
            deleted_at: Utc::now(),
        };
        assert_eq!(registry.process(&entry).await.unwrap(), DeletionOutcome::Applied);
    }

    #[tokio::test]
    async fn non_owner_deletion_is_rejected() {
        let record = record_with_owner("did:gun:abcdef012345:r1", "owner-pub");
        let registry = registry_with(record);
        let entry = DeletionEntry {
            did: "did:gun:abcdef012345:r1".into(),
            deleted_by_public_key: "intruder-pub".to_string(),
            deleted_at: Utc::now(),
        };
        assert_eq!(registry.process(&entry).await.unwrap(), DeletionOutcome::Unauthorized);
    }

    #[tokio::test]
    async fn deletion_of_unindexed_target_is_pending() {
        let registry = DeletionRegistry::new(
            Arc::new(FakeProjection::with(vec![])),
            Arc::new(OwnershipEngine::for_tests()),
            None,
        );
        let entry = DeletionEntry {
            did: "did:gun:abcdef012345:r1".into(),
            deleted_by_public_key: "owner-pub".to_string(),
            deleted_at: Utc::now(),
        };
        assert_eq!(registry.process(&entry).await.unwrap(), DeletionOutcome::TargetPending);
    }
}

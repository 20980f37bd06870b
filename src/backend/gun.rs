//! GUN Sync Loop backend adapter (C7): mirrors new souls from a small,
//! operator-configured whitelist of peers, and merges each peer's
//! distributed deletion registry.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::GunSection;
use crate::ownership;
use crate::types::{Backend, Did, DeletionEntry, Record};
use crate::{Error, Result};

use super::{BackendAdapter, ObservedItem};

const DELETION_REGISTRY_ROOT: &str = "oip:deleted:records";
const DELETION_REGISTRY_INDEX: &str = "oip:deleted:records:index";

struct PeerState {
    backoff_until: Option<Instant>,
    consecutive_failures: u32,
}

pub struct GunAdapter {
    client: Client,
    config: GunSection,
    /// Known-souls-per-peer, used only to diff against the local index;
    /// never trusted as an authorization source.
    peer_state: Mutex<HashMap<String, PeerState>>,
    decryption: std::sync::Arc<ownership::OwnershipEngine>,
}

impl GunAdapter {
    pub fn new(config: GunSection, decryption: std::sync::Arc<ownership::OwnershipEngine>) -> Self {
        let peer_state = config
            .peers
            .iter()
            .map(|p| {
                (
                    p.clone(),
                    PeerState {
                        backoff_until: None,
                        consecutive_failures: 0,
                    },
                )
            })
            .collect();
        Self {
            client: Client::new(),
            config,
            peer_state: Mutex::new(peer_state),
            decryption,
        }
    }

    /// Rejects any peer URL outside the configured whitelist at runtime;
    /// the whitelist itself is never modified.
    fn is_whitelisted(&self, peer: &str) -> bool {
        self.config.peers.iter().any(|p| p == peer)
    }

    fn is_backed_off(&self, peer: &str) -> bool {
        self.peer_state
            .lock()
            .unwrap()
            .get(peer)
            .and_then(|s| s.backoff_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    fn record_failure(&self, peer: &str) {
        let mut state = self.peer_state.lock().unwrap();
        let entry = state.entry(peer.to_string()).or_insert(PeerState {
            backoff_until: None,
            consecutive_failures: 0,
        });
        entry.consecutive_failures += 1;
        let delay = Duration::from_secs(2u64.pow(entry.consecutive_failures.min(6)));
        entry.backoff_until = Some(Instant::now() + delay);
        warn!(peer, delay_secs = delay.as_secs(), "peer demoted to backoff");
    }

    fn record_success(&self, peer: &str) {
        if let Some(entry) = self.peer_state.lock().unwrap().get_mut(peer) {
            entry.consecutive_failures = 0;
            entry.backoff_until = None;
        }
    }

    async fn fetch_soul(&self, peer: &str, soul: &str) -> Result<Value> {
        let resp = self
            .client
            .get(format!("{peer}/{soul}"))
            .send()
            .await
            .map_err(|e| {
                self.record_failure(peer);
                Error::transient(format!("peer {peer} unreachable: {e}"))
            })?;
        if resp.status().is_server_error() {
            self.record_failure(peer);
            return Err(Error::transient(format!("peer {peer} returned {}", resp.status())));
        }
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("soul {soul} absent on {peer}")));
        }
        let value = resp.json::<Value>().await.map_err(Error::Http)?;
        self.record_success(peer);
        Ok(value)
    }

    async fn peer_registry_index(&self, peer: &str) -> Result<Vec<String>> {
        let value = self.fetch_soul(peer, "oip:registry:index").await?;
        Ok(value
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    async fn peer_deletion_index(&self, peer: &str) -> Result<Vec<DeletionEntry>> {
        let value = self.fetch_soul(peer, DELETION_REGISTRY_INDEX).await?;
        let dids: Vec<String> = value
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(dids.len());
        for did in dids {
            let soul = format!("{DELETION_REGISTRY_ROOT}:{did}");
            if let Ok(entry_value) = self.fetch_soul(peer, &soul).await {
                if let Ok(entry) = serde_json::from_value::<DeletionEntry>(entry_value) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn decode_node(&self, node: Value, did: Did) -> Result<Option<Record>> {
        let oip = node.get("oip").cloned().unwrap_or(Value::Null);
        let encrypted = oip.get("encrypted").and_then(Value::as_bool).unwrap_or(false);

        let data_value = if encrypted {
            let owner_public_key = oip
                .get("creator_did")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::decode("encrypted node missing creator_did"))?;
            let encrypted_blob = node
                .get("data")
                .cloned()
                .ok_or_else(|| Error::decode("encrypted node missing data"))?;
            self.decryption.decrypt_payload(owner_public_key, &encrypted_blob)?
        } else {
            node.get("data").cloned().unwrap_or(Value::Null)
        };

        let data = serde_json::from_value(data_value)?;
        let envelope: crate::types::OipEnvelope = serde_json::from_value(oip)?;
        Ok(Some(Record { did, data, oip: envelope }))
    }
}

#[async_trait]
impl BackendAdapter for GunAdapter {
    fn backend(&self) -> Backend {
        Backend::Gun
    }

    async fn observe_new_items(&self, _high_water: Option<u64>) -> Result<Vec<ObservedItem>> {
        let mut items = Vec::new();
        let peers = self.config.peers.clone();

        for peer in &peers {
            if !self.is_whitelisted(peer) {
                warn!(target: "security", peer, "refused connection to non-whitelisted GUN peer");
                continue;
            }
            if self.is_backed_off(peer) {
                continue;
            }

            let remote_souls = match self.peer_registry_index(peer).await {
                Ok(souls) => souls,
                Err(e) => {
                    warn!(peer, error = %e, "failed to fetch peer registry index");
                    continue;
                }
            };

            for soul in remote_souls {
                let did = Did::new(Backend::Gun, &soul, None);
                match self.fetch_soul(peer, &soul).await {
                    Ok(node) => match self.decode_node(node, did.clone()).await {
                        Ok(Some(record)) => {
                            let raw_tuple = serde_json::json!({});
                            items.push(ObservedItem::Record {
                                record,
                                raw_tuple,
                                template_id: String::new(),
                            });
                        }
                        Ok(None) => {}
                        Err(e) => warn!(did = %did, error = %e, "failed to decode GUN node"),
                    },
                    Err(e) if matches!(e, Error::NotFound(_)) => {}
                    Err(e) => warn!(peer, soul, error = %e, "failed to fetch GUN soul"),
                }
            }

            match self.peer_deletion_index(peer).await {
                Ok(deletions) => {
                    info!(peer, count = deletions.len(), "merged peer deletion registry");
                    items.extend(deletions.into_iter().map(ObservedItem::Deletion));
                }
                Err(e) => warn!(peer, error = %e, "failed to fetch peer deletion registry"),
            }
        }

        Ok(items)
    }

    async fn fetch(&self, did: &Did) -> Result<Option<Record>> {
        let (_backend, locator, _local_id) = did.parse_parts()?;
        let mut last_not_found = false;
        for peer in &self.config.peers {
            if !self.is_whitelisted(peer) || self.is_backed_off(peer) {
                continue;
            }
            match self.fetch_soul(peer, locator).await {
                Ok(node) => return self.decode_node(node, did.clone()).await,
                Err(Error::NotFound(_)) => last_not_found = true,
                Err(_) => continue,
            }
        }
        if last_not_found {
            Ok(None)
        } else {
            Err(Error::transient(format!("no reachable peer had {did}")))
        }
    }

    async fn put(&self, record: &Record) -> Result<Did> {
        let peer = self
            .config
            .peers
            .first()
            .ok_or_else(|| Error::internal("no GUN peers configured"))?;
        let soul = record
            .did
            .parse_parts()
            .ok()
            .and_then(|(_, locator, _)| Some(locator.to_string()))
            .unwrap_or_else(|| record.did.as_str().to_string());

        // Private records replace `data` with `{encrypted, iv, authTag}`
        // before they ever leave the process.
        let data_value = if record.oip.encrypted {
            self.decryption
                .encrypt_payload(record.oip.creator_did.as_str(), &serde_json::to_value(&record.data)?)?
        } else {
            serde_json::to_value(&record.data)?
        };
        let body = serde_json::json!({ "oip": record.oip, "data": data_value });
        self.client
            .put(format!("{peer}/{soul}"))
            .json(&body)
            .send()
            .await
            .map_err(Error::Http)?;
        Ok(record.did.clone())
    }

    async fn delete(&self, entry: &DeletionEntry) -> Result<()> {
        let peer = self
            .config
            .peers
            .first()
            .ok_or_else(|| Error::internal("no GUN peers configured"))?;
        let soul = format!("{DELETION_REGISTRY_ROOT}:{}", entry.did);
        self.client
            .put(format!("{peer}/{soul}"))
            .json(entry)
            .send()
            .await
            .map_err(Error::Http)?;

        // Peers discover deletions by reading the flat index first
        // (`peer_deletion_index`), then fetching each listed DID; without
        // this, a deletion written above is invisible to every peer,
        // including this node on its own next poll.
        let mut index: Vec<String> = match self.fetch_soul(peer, DELETION_REGISTRY_INDEX).await {
            Ok(value) => value
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let did_str = entry.did.as_str().to_string();
        if !index.contains(&did_str) {
            index.push(did_str);
        }
        self.client
            .put(format!("{peer}/{DELETION_REGISTRY_INDEX}"))
            .json(&index)
            .send()
            .await
            .map_err(Error::Http)?;
        Ok(())
    }

    async fn is_absent(&self, did: &Did) -> Result<bool> {
        Ok(self.fetch(did).await?.is_none())
    }
}

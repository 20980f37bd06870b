//! Core data model: templates, records, DIDs, the OIP envelope and the
//! small value types the codec and projection operate on.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Opaque template identifier (typically an Arweave transaction id).
pub type TemplateId = String;

/// Which backend a record or DID originates from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Arweave,
    Gun,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Arweave => write!(f, "arweave"),
            Backend::Gun => write!(f, "gun"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "arweave" => Ok(Backend::Arweave),
            "gun" => Ok(Backend::Gun),
            other => Err(Error::decode(format!("unknown backend: {other}"))),
        }
    }
}

/// A decentralized identifier of the form `did:<backend>:<locator>[:<local-id>]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Did(pub String);

impl Did {
    pub fn new(backend: Backend, locator: &str, local_id: Option<&str>) -> Self {
        match local_id {
            Some(id) => Did(format!("did:{backend}:{locator}:{id}")),
            None => Did(format!("did:{backend}:{locator}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits into `(backend, locator, local_id)`. Fails if the DID does
    /// not start with a recognized `did:<backend>:` prefix.
    pub fn parse_parts(&self) -> Result<(Backend, &str, Option<&str>)> {
        let mut parts = self.0.splitn(4, ':');
        let scheme = parts.next().unwrap_or_default();
        if scheme != "did" {
            return Err(Error::decode(format!("not a did: {}", self.0)));
        }
        let backend = parts
            .next()
            .ok_or_else(|| Error::decode(format!("missing backend in did: {}", self.0)))?
            .parse::<Backend>()?;
        let locator = parts
            .next()
            .ok_or_else(|| Error::decode(format!("missing locator in did: {}", self.0)))?;
        let local_id = parts.next();
        Ok((backend, locator, local_id))
    }

    pub fn backend(&self) -> Result<Backend> {
        self.parse_parts().map(|(b, _, _)| b)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Did {
    fn from(s: String) -> Self {
        Did(s)
    }
}

impl From<&str> for Did {
    fn from(s: &str) -> Self {
        Did(s.to_string())
    }
}

/// A single semantic field value. `Repeated` and `Dref` are the two
/// recursive/reference-carrying shapes the resolver and codec care about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Long(i64),
    Uint64(u64),
    Float(f64),
    Bool(bool),
    /// Reference to another record, by DID.
    Dref(Did),
    Repeated(Vec<FieldValue>),
}

impl FieldValue {
    pub fn as_dref(&self) -> Option<&Did> {
        match self {
            FieldValue::Dref(did) => Some(did),
            _ => None,
        }
    }

    /// Enumerates every `Did` reachable directly from this value, whether
    /// it is a bare `dref` or a `repeated dref`.
    pub fn drefs(&self) -> Vec<&Did> {
        match self {
            FieldValue::Dref(did) => vec![did],
            FieldValue::Repeated(items) => items.iter().flat_map(FieldValue::drefs).collect(),
            _ => Vec::new(),
        }
    }
}

/// A field's declared type within a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldType {
    String,
    Long,
    Uint64,
    Float,
    Bool,
    Dref,
    Repeated { element: Box<FieldType> },
    Enum { values: Vec<String> },
}

/// One field entry within a template definition.
///
/// `index` is dense and immutable once published (invariant from the
/// template registry): it is the on-wire key the codec uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub index: u32,
}

/// A reusable schema. Published once, referenced forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: TemplateId,
    pub name: String,
    pub fields: Vec<TemplateField>,
}

impl Template {
    pub fn field_by_name(&self, name: &str) -> Option<&TemplateField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_index(&self, index: u32) -> Option<&TemplateField> {
        self.fields.iter().find(|f| f.index == index)
    }

    /// Returns the next unused field index, for appending new fields when
    /// the caller did not supply explicit indices at registration.
    pub fn next_index(&self) -> u32 {
        self.fields.iter().map(|f| f.index + 1).max().unwrap_or(0)
    }
}

/// Per-template record data: a mapping from field name to value. Values
/// the local template no longer recognizes are surfaced with the
/// `_unknownField_<index>` convention so older nodes still index newer
/// records.
pub type TemplateData = HashMap<String, FieldValue>;

/// The signed envelope that accompanies every record, independent of its
/// semantic payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OipEnvelope {
    pub creator_did: Did,
    pub creator_signature: String,
    pub backend: Backend,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    pub indexed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_manifest: Option<crate::media::StorageManifest>,
}

/// A signed datum instantiating one or more templates; the unit of
/// indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub did: Did,
    pub data: HashMap<String, TemplateData>,
    pub oip: OipEnvelope,
}

impl Record {
    /// Every `dref` reachable from this record's top-level fields.
    pub fn direct_references(&self) -> Vec<&Did> {
        self.data
            .values()
            .flat_map(|fields| fields.values())
            .flat_map(FieldValue::drefs)
            .collect()
    }
}

/// `{did, deleted_by_public_key, deleted_at}` — written to a well-known
/// location per backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionEntry {
    pub did: Did,
    pub deleted_by_public_key: String,
    pub deleted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_roundtrip_with_local_id() {
        let did = Did::new(Backend::Gun, "abcdef012345", Some("r1"));
        assert_eq!(did.as_str(), "did:gun:abcdef012345:r1");

        let (backend, locator, local_id) = did.parse_parts().unwrap();
        assert_eq!(backend, Backend::Gun);
        assert_eq!(locator, "abcdef012345");
        assert_eq!(local_id, Some("r1"));
    }

    #[test]
    fn did_without_local_id() {
        let did = Did::from("did:arweave:tx123");
        let (backend, locator, local_id) = did.parse_parts().unwrap();
        assert_eq!(backend, Backend::Arweave);
        assert_eq!(locator, "tx123");
        assert_eq!(local_id, None);
    }

    #[test]
    fn malformed_did_rejected() {
        let did = Did::from("not-a-did");
        assert!(did.parse_parts().is_err());
    }

    #[test]
    fn drefs_collects_nested_repeated() {
        let value = FieldValue::Repeated(vec![
            FieldValue::Dref(Did::from("did:arweave:a")),
            FieldValue::String("ignored".into()),
            FieldValue::Dref(Did::from("did:arweave:b")),
        ]);
        let refs: Vec<_> = value.drefs().into_iter().map(|d| d.as_str()).collect();
        assert_eq!(refs, vec!["did:arweave:a", "did:arweave:b"]);
    }
}

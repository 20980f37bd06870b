//! HTTP handlers for the query and write surface (C11).

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendAdapter;
use crate::codec;
use crate::ownership::{AccessLevel, RequestPrincipal};
use crate::projection::{QueryFilter, SourceFilter};
use crate::resolver::ResolvedRecord;
use crate::signature;
use crate::template;
use crate::types::{Backend, DeletionEntry, Did, FieldType, FieldValue, OipEnvelope, Record, Template, TemplateData, TemplateField};
use crate::Error;

use super::state::AppState;

/// Wraps a crate `Error` for the `IntoResponse` impl the router needs;
/// the taxonomy code from `Error::taxonomy_code` is what clients match on,
/// the HTTP status is secondary plumbing.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Policy(_) => StatusCode::FORBIDDEN,
            Error::InvalidRequest(_)
            | Error::UnknownField(_)
            | Error::UnknownEnumValue(_)
            | Error::Decode(_)
            | Error::SignatureInvalid(_)
            | Error::TemplateMissing(_) => StatusCode::BAD_REQUEST,
            Error::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Transient(_) | Error::Http(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({
            "error": self.0.taxonomy_code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Scans a record's `accessControl`/`conversationSession` fields for the
/// owner/access-level facts the bases read authorization on.
/// Records carrying neither are public.
fn access_level_for(record: &Record) -> AccessLevel {
    for (template_name, fields) in &record.data {
        if template_name != "accessControl" && template_name != "conversationSession" {
            continue;
        }
        let Some(FieldValue::String(owner)) = fields.get("owner_public_key") else {
            continue;
        };
        let access_level = match fields.get("access_level") {
            Some(FieldValue::String(s)) => s.as_str(),
            _ => "private",
        };
        if access_level == "organization" {
            let org_members = match fields.get("org_members") {
                Some(FieldValue::Repeated(items)) => items
                    .iter()
                    .filter_map(|v| match v {
                        FieldValue::String(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            return AccessLevel::Organization {
                owner_public_key: owner.clone(),
                org_members,
            };
        }
        return AccessLevel::Private {
            owner_public_key: owner.clone(),
        };
    }
    AccessLevel::Public
}

fn principal_from_headers(state: &AppState, headers: &HeaderMap) -> RequestPrincipal {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token.and_then(|t| state.ownership.verify_owner_jwt(t).ok()) {
        Some(claims) => RequestPrincipal {
            public_key: Some(claims.public_key),
            email_domain: None,
        },
        None => RequestPrincipal::default(),
    }
}

fn is_visible(state: &AppState, record: &Record, principal: &RequestPrincipal) -> bool {
    state.ownership.can_read(&access_level_for(record), principal)
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    #[serde(rename = "recordType")]
    pub record_type: Option<String>,
    pub search: Option<String>,
    pub creator_did: Option<String>,
    pub source: Option<String>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub did: Option<String>,
    #[serde(rename = "resolveDepth")]
    pub resolve_depth: Option<u32>,
    pub block_height_min: Option<u64>,
    pub block_height_max: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub records: Vec<ResolvedRecord>,
    pub next_offset: Option<usize>,
    pub total: u64,
}

/// `GET /records`. Applies filters, drops records the caller cannot read,
/// then resolves `dref` fields on whatever survives.
pub async fn list_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse>, ApiError> {
    let mut filter = QueryFilter::new();
    filter.record_type = q.record_type;
    filter.search = q.search;
    filter.creator_did = q.creator_did.map(Did::from);
    filter.source = match q.source.as_deref() {
        Some("arweave") => SourceFilter::Arweave,
        Some("gun") => SourceFilter::Gun,
        _ => SourceFilter::All,
    };
    filter.sort_by = q.sort_by;
    filter.limit = q.limit.unwrap_or(20);
    filter.offset = q.offset.unwrap_or(0);
    filter.did = q.did.map(Did::from);
    filter.block_height_min = q.block_height_min;
    filter.block_height_max = q.block_height_max;

    let page = state.projection.search(&filter).await?;

    let principal = principal_from_headers(&state, &headers);
    let requested_depth = q.resolve_depth.unwrap_or(state.config.resolver.resolve_depth_default);
    let depth = requested_depth.min(state.config.resolver.resolve_depth_max);

    let mut records = Vec::with_capacity(page.records.len());
    for record in page.records {
        if !is_visible(&state, &record, &principal) {
            continue;
        }
        records.push(state.resolver.resolve(record, depth).await);
    }

    Ok(Json(RecordsResponse {
        records,
        next_offset: page.next_offset,
        total: page.total,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PublishRecordRequest {
    pub data: HashMap<String, TemplateData>,
    pub storage: String,
    #[serde(default)]
    pub encrypt: bool,
    pub creator_did: Option<String>,
    pub creator_signature: Option<String>,
    pub owner_public_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublishRecordResponse {
    pub did: String,
}

/// `POST /records`. Validates every declared template, signs with the
/// client's key or falls back to the node wallet, writes to the chosen
/// backend, and returns — projection happens only once the sync loop
/// observes the write, not locally from this handler.
pub async fn publish_record(
    State(state): State<AppState>,
    Json(req): Json<PublishRecordRequest>,
) -> Result<Json<PublishRecordResponse>, ApiError> {
    let backend: Backend = req
        .storage
        .parse()
        .map_err(|_| Error::InvalidRequest("storage must be \"arweave\" or \"gun\"".to_string()))?;

    if req.encrypt && backend != Backend::Gun {
        return Err(Error::policy("encryption is only supported for gun storage").into());
    }

    for (template_name, fields) in &req.data {
        let template = state
            .templates
            .lookup_by_name(template_name)
            .await
            .ok_or_else(|| Error::template_missing(template_name.clone()))?;
        codec::compress(&template, fields)?;
    }

    let creator_did: Did;
    let creator_signature: String;
    match (&req.creator_did, &req.creator_signature) {
        (Some(did), Some(sig)) => {
            creator_did = Did::from(did.clone());
            creator_signature = sig.clone();
        }
        _ => {
            let node_key = state
                .config
                .auth
                .node_wallet_private_key_hex
                .as_deref()
                .ok_or_else(|| Error::policy("no client signature supplied and no node wallet configured"))?;
            let provisional = serde_json::json!({ "data": &req.data, "storage": &req.storage });
            let (public_key_hex, sig) = signature::sign_with_node_key(node_key, &provisional)?;
            creator_did = signature::creator_did_from_public_key(&public_key_hex);
            creator_signature = sig;
        }
    }

    let local_id = Uuid::new_v4().to_string();
    let locator = match backend {
        Backend::Gun => {
            let owner = req.owner_public_key.as_deref().unwrap_or_else(|| creator_did.as_str());
            signature::public_key_prefix(owner, 12)
        }
        Backend::Arweave => String::new(),
    };

    let record = Record {
        did: Did::new(backend, &locator, Some(&local_id)),
        data: req.data,
        oip: OipEnvelope {
            creator_did,
            creator_signature,
            backend,
            encrypted: req.encrypt,
            block_height: None,
            indexed_at: Utc::now(),
            storage_manifest: None,
        },
    };

    let did = match backend {
        Backend::Arweave => state.arweave.put(&record).await?,
        Backend::Gun => state.gun.put(&record).await?,
    };

    Ok(Json(PublishRecordResponse { did: did.as_str().to_string() }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRecordRequest {
    pub did: String,
    pub deleted_by_public_key: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteRecordResponse {
    pub accepted: bool,
}

/// `POST /records/delete`. A cheap local authorization pre-check before
/// publishing the deletion entry; every node re-checks authoritatively
/// when it later observes the entry.
pub async fn delete_record(
    State(state): State<AppState>,
    Json(req): Json<DeleteRecordRequest>,
) -> Result<Json<DeleteRecordResponse>, ApiError> {
    let did = Did::from(req.did.clone());
    let target = state
        .projection
        .get_record(&did)
        .await?
        .ok_or_else(|| Error::not_found(format!("{did} not indexed, cannot authorize deletion")))?;

    let entry = DeletionEntry {
        did: did.clone(),
        deleted_by_public_key: req.deleted_by_public_key.clone(),
        deleted_at: Utc::now(),
    };

    if !state.deletions.precheck(&did, &target, &entry) {
        return Err(Error::unauthorized("not authorized to delete this record").into());
    }

    match did.backend()? {
        Backend::Arweave => state.arweave.delete(&entry).await?,
        Backend::Gun => state.gun.delete(&entry).await?,
    }

    Ok(Json(DeleteRecordResponse { accepted: true }))
}

#[derive(Debug, Serialize)]
pub struct TemplatesResponse {
    pub templates: Vec<Template>,
}

/// `GET /templates`.
pub async fn list_templates(State(state): State<AppState>) -> Result<Json<TemplatesResponse>, ApiError> {
    let ids = state.templates.active_templates().await;
    let mut templates = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(t) = state.templates.lookup_by_id(&id).await {
            templates.push(t);
        }
    }
    Ok(Json(TemplatesResponse { templates }))
}

#[derive(Debug, Deserialize)]
pub struct TemplateFieldInput {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub index: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub fields: Vec<TemplateFieldInput>,
}

#[derive(Debug, Serialize)]
pub struct CreateTemplateResponse {
    pub template_id: String,
}

/// `POST /templates`. Allocates dense indices for fields the caller left
/// unindexed, then registers.
pub async fn create_template(
    State(state): State<AppState>,
    Json(req): Json<CreateTemplateRequest>,
) -> Result<Json<CreateTemplateResponse>, ApiError> {
    let explicit_mask: Vec<bool> = req.fields.iter().map(|f| f.index.is_some()).collect();
    let mut fields: Vec<TemplateField> = req
        .fields
        .into_iter()
        .map(|f| TemplateField {
            name: f.name,
            field_type: f.field_type,
            index: f.index.unwrap_or(0),
        })
        .collect();
    template::assign_missing_indices(&mut fields, &explicit_mask);

    let template = Template {
        template_id: format!("local:{}", Uuid::new_v4()),
        name: req.name,
        fields,
    };
    let (template_id, pending) = state.templates.register(template).await?;
    // Records that arrived before their template did are reprocessed once
    // the template is known, regardless of whether a sync loop or this
    // handler is what made it known.
    crate::sync::reprocess_drained(
        &state.templates,
        &state.projection,
        state.registrations.as_ref(),
        &template_id,
        pending,
    )
    .await;
    Ok(Json(CreateTemplateResponse { template_id }))
}

/// `GET /health`: process liveness only.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /health/index`: confirms the projection is reachable.
pub async fn health_index(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mut probe = QueryFilter::new();
    probe.limit = 1;
    state.projection.search(&probe).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /health/gun`: reports the configured peer whitelist size.
pub async fn health_gun(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "peers": state.config.gun.peers.len(),
    }))
}

/// `GET /health/gateway`: surfaces the cached Arweave chain tip, if any.
pub async fn health_gateway(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "chain_tip": state.arweave.cached_chain_tip(),
    }))
}

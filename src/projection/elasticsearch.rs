//! `reqwest`-based Elasticsearch client implementing the `Projection`
//! trait: a `StorageConfig`/`create_storage`-style config-then-client
//! shape, generalized from an object store to an HTTP index.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::config::ElasticsearchSection;
use crate::types::{FieldType, Record, Template};
use crate::{Error, Result};

use super::{mapping_type_for, Projection, QueryFilter, QueryPage, SourceFilter};

const SINGLETONS_DOC_ID: &str = "arweave_high_water_mark";

#[derive(Debug, Clone)]
pub struct EsConfig {
    pub host: String,
    pub records_index: String,
    pub templates_index: String,
    pub singletons_index: String,
    pub request_timeout: Duration,
}

impl From<&ElasticsearchSection> for EsConfig {
    fn from(section: &ElasticsearchSection) -> Self {
        Self {
            host: section.host.clone(),
            records_index: section.records_index.clone(),
            templates_index: section.templates_index.clone(),
            singletons_index: section.singletons_index.clone(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

pub struct ElasticsearchProjection {
    client: Client,
    config: EsConfig,
}

impl ElasticsearchProjection {
    pub fn new(config: EsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self { client, config })
    }

    fn url(&self, index: &str, path: &str) -> String {
        format!("{}/{}/{}", self.config.host.trim_end_matches('/'), index, path)
    }

    async fn put_doc(&self, index: &str, id: &str, body: &Value) -> Result<()> {
        let resp = self
            .client
            .put(self.url(index, &format!("_doc/{id}")))
            .json(body)
            .send()
            .await?;
        ensure_success(resp).await
    }

    async fn get_doc(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(self.url(index, &format!("_doc/{id}")))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success_value(resp).await?;
        Ok(resp.get("_source").cloned())
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<()> {
    ensure_success_value(resp).await.map(|_| ())
}

async fn ensure_success_value(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::transient(format!("elasticsearch returned {status}")));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::Storage(format!(
            "elasticsearch error {status}: {body}"
        )));
    }
    resp.json::<Value>().await.map_err(Error::Http)
}

/// Builds the Elasticsearch `properties` mapping fragment for a single
/// template field (`string → text+keyword`, `dref/enum →
/// keyword`, numeric/bool map directly, `repeated X` reuses `X`'s mapping).
fn field_mapping(field_type: &FieldType) -> Value {
    match mapping_type_for(field_type) {
        "text_keyword" => json!({
            "type": "text",
            "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } }
        }),
        "long" => json!({ "type": "long" }),
        "unsigned_long" => json!({ "type": "unsigned_long" }),
        "float" => json!({ "type": "float" }),
        "boolean" => json!({ "type": "boolean" }),
        "keyword" => json!({ "type": "keyword" }),
        other => unreachable!("unmapped storage type: {other}"),
    }
}

#[async_trait::async_trait]
impl Projection for ElasticsearchProjection {
    async fn ensure_mapping(&self, template: &Template) -> Result<()> {
        let mut properties = serde_json::Map::new();
        for field in &template.fields {
            properties.insert(field.name.clone(), field_mapping(&field.field_type));
        }
        // `index_record` stores semantic fields under `data.<template.name>`
        // (matching `Record`'s own shape), so the mapping must nest there
        // too or `recordType`/field queries never match any document.
        let body = json!({ "properties": {
            "data": { "properties": {
                template.name.clone(): { "properties": Value::Object(properties) }
            }}
        }});
        let resp = self
            .client
            .put(self.url(&self.config.records_index, "_mapping"))
            .json(&body)
            .send()
            .await?;
        ensure_success(resp).await
    }

    async fn index_record(&self, record: &Record) -> Result<()> {
        let body = serde_json::to_value(record)?;
        self.put_doc(&self.config.records_index, record.did.as_str(), &body)
            .await
    }

    async fn get_record(&self, did: &crate::types::Did) -> Result<Option<Record>> {
        match self.get_doc(&self.config.records_index, did.as_str()).await? {
            Some(source) => Ok(Some(serde_json::from_value(source)?)),
            None => Ok(None),
        }
    }

    async fn delete_record(&self, did: &crate::types::Did) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&self.config.records_index, &format!("_doc/{}", did.as_str())))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(resp).await
    }

    async fn search(&self, filter: &QueryFilter) -> Result<QueryPage> {
        let mut must = Vec::new();
        if let Some(rt) = &filter.record_type {
            must.push(json!({ "exists": { "field": format!("data.{rt}") } }));
        }
        if let Some(search) = &filter.search {
            must.push(json!({ "query_string": { "query": search } }));
        }
        if let Some(creator) = &filter.creator_did {
            must.push(json!({ "term": { "oip.creator_did": creator.as_str() } }));
        }
        if let Some(did) = &filter.did {
            must.push(json!({ "term": { "did": did.as_str() } }));
        }
        match filter.source {
            SourceFilter::Arweave => must.push(json!({ "term": { "oip.backend": "arweave" } })),
            SourceFilter::Gun => must.push(json!({ "term": { "oip.backend": "gun" } })),
            SourceFilter::All => {}
        }
        if filter.block_height_min.is_some() || filter.block_height_max.is_some() {
            let mut range = serde_json::Map::new();
            if let Some(min) = filter.block_height_min {
                range.insert("gte".into(), json!(min));
            }
            if let Some(max) = filter.block_height_max {
                range.insert("lte".into(), json!(max));
            }
            must.push(json!({ "range": { "oip.block_height": Value::Object(range) } }));
        }

        let query = if must.is_empty() {
            json!({ "match_all": {} })
        } else {
            json!({ "bool": { "must": must } })
        };

        let mut body = json!({
            "query": query,
            "from": filter.offset,
            "size": filter.limit,
        });
        if let Some(sort_by) = &filter.sort_by {
            body["sort"] = json!([{ sort_by.clone(): "asc" }]);
        }

        let resp = self
            .client
            .post(self.url(&self.config.records_index, "_search"))
            .json(&body)
            .send()
            .await?;
        let value = ensure_success_value(resp).await?;

        let total = value["hits"]["total"]["value"].as_u64().unwrap_or(0);
        let hits = value["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let mut records = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(source) = hit.get("_source").cloned() {
                records.push(serde_json::from_value(source)?);
            }
        }
        let next_offset = if filter.offset + records.len() < total as usize {
            Some(filter.offset + records.len())
        } else {
            None
        };
        Ok(QueryPage {
            records,
            next_offset,
            total,
        })
    }

    async fn put_template(&self, template: &Template) -> Result<()> {
        let body = serde_json::to_value(template)?;
        self.put_doc(&self.config.templates_index, &template.template_id, &body)
            .await?;
        // Name pointer, for lookup_by_name without a full-text query.
        self.put_doc(
            &self.config.templates_index,
            &format!("by_name_{}", template.name),
            &json!({ "template_id": template.template_id }),
        )
        .await
    }

    async fn get_template(&self, template_id: &str) -> Result<Option<Template>> {
        match self
            .get_doc(&self.config.templates_index, template_id)
            .await?
        {
            Some(source) => Ok(Some(serde_json::from_value(source)?)),
            None => Ok(None),
        }
    }

    async fn list_templates(&self) -> Result<Vec<Template>> {
        let body = json!({ "query": { "match_all": {} }, "size": 10_000 });
        let resp = self
            .client
            .post(self.url(&self.config.templates_index, "_search"))
            .json(&body)
            .send()
            .await?;
        let value = ensure_success_value(resp).await?;
        let hits = value["hits"]["hits"].as_array().cloned().unwrap_or_default();
        let mut templates = Vec::new();
        for hit in hits {
            let id = hit["_id"].as_str().unwrap_or_default();
            if id.starts_with("by_name_") {
                continue;
            }
            if let Some(source) = hit.get("_source").cloned() {
                templates.push(serde_json::from_value(source)?);
            }
        }
        Ok(templates)
    }

    async fn get_high_water_mark(&self) -> Result<Option<u64>> {
        match self
            .get_doc(&self.config.singletons_index, SINGLETONS_DOC_ID)
            .await?
        {
            Some(source) => Ok(source.get("block_height").and_then(Value::as_u64)),
            None => Ok(None),
        }
    }

    async fn set_high_water_mark(&self, block_height: u64) -> Result<()> {
        self.put_doc(
            &self.config.singletons_index,
            SINGLETONS_DOC_ID,
            &json!({ "block_height": block_height }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    #[test]
    fn field_mapping_string_gets_keyword_subfield() {
        let mapping = field_mapping(&FieldType::String);
        assert_eq!(mapping["type"], "text");
        assert_eq!(mapping["fields"]["keyword"]["type"], "keyword");
    }

    #[test]
    fn field_mapping_repeated_reuses_element_mapping() {
        let mapping = field_mapping(&FieldType::Repeated {
            element: Box::new(FieldType::Dref),
        });
        assert_eq!(mapping["type"], "keyword");
    }
}

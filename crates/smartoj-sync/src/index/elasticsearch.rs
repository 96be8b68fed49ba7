//! Elasticsearch backend over the REST API.
//!
//! Tag mutations run as painless scripts on the server so concurrent jobs
//! never overwrite each other's read-modify-write. Every write uses
//! `refresh=true` so a following job sees its effect.

use super::{IndexDocument, SearchIndex};
use crate::config::IndexConfig;
use crate::error::{Result, SyncError};
use crate::credential::Credential;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const ADD_TAG_SCRIPT: &str = "\
if (ctx._source.tags == null) { ctx._source.tags = []; } \
if (ctx._source.tags.contains(params.tag)) { ctx.op = 'none'; } \
else { ctx._source.tags.add(params.tag); }";

const REMOVE_TAG_SCRIPT: &str = "\
if (ctx._source.tags == null || !ctx._source.tags.removeIf(t -> t == params.tag)) { ctx.op = 'none'; }";

const RENAME_TAG_SCRIPT: &str = "\
def out = new ArrayList(); \
for (t in ctx._source.tags) { \
  def v = t == params.before ? params.after : t; \
  if (!out.contains(v)) { out.add(v); } \
} \
ctx._source.tags = out;";

pub struct ElasticsearchIndex {
    client: reqwest::Client,
    base_url: String,
    index: String,
    credentials: Option<(String, Credential)>,
}

impl ElasticsearchIndex {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        let base_url = url::Url::parse(&config.url).map_err(|e| {
            SyncError::config(format!("Invalid index url '{}': {}", config.url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| SyncError::config(format!("Failed to build index client: {}", e)))?;

        let credentials = config.username.as_ref().map(|user| {
            (
                user.clone(),
                config.password.clone().unwrap_or_default(),
            )
        });

        Ok(Self {
            client,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            index: config.index.clone(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.index, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password.expose_secret())),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, Value)> {
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::index(format!("Request failed: {}", e)))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }

    fn failure(status: StatusCode, body: &Value) -> SyncError {
        SyncError::index(format!("{} {}", status, body))
    }

    /// Create the index with its mapping unless it already exists.
    pub async fn ensure_index(&self) -> Result<()> {
        let url = format!("{}/{}", self.base_url, self.index);
        let (status, _) = self.send(self.request(reqwest::Method::HEAD, url.clone())).await?;
        if status.is_success() {
            debug!("Index '{}' exists", self.index);
            return Ok(());
        }
        if status != StatusCode::NOT_FOUND {
            return Err(SyncError::index(format!(
                "Checking index '{}' returned {}",
                self.index, status
            )));
        }

        let mapping = json!({
            "mappings": {
                "properties": {
                    "id": {"type": "long"},
                    "title": {"type": "text"},
                    "description": {"type": "text"},
                    "difficulty": {"type": "keyword"},
                    "submission_quantity": {"type": "long"},
                    "pass_quantity": {"type": "long"},
                    "tags": {"type": "keyword"}
                }
            }
        });
        let (status, body) = self
            .send(self.request(reqwest::Method::PUT, url).json(&mapping))
            .await?;
        if status.is_success() {
            info!("Created index '{}'", self.index);
            Ok(())
        } else if body["error"]["type"] == "resource_already_exists_exception" {
            Ok(())
        } else {
            Err(Self::failure(status, &body))
        }
    }

    async fn run_script(&self, id: i64, source: &str, tag: &str) -> Result<Option<bool>> {
        let body = json!({
            "script": {
                "lang": "painless",
                "source": source,
                "params": {"tag": tag}
            }
        });
        let (status, response) = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    self.url(&format!("_update/{}?refresh=true", id)),
                )
                .json(&body),
            )
            .await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::failure(status, &response));
        }
        Ok(Some(response["result"] != "noop"))
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn upsert_document(&self, doc: &IndexDocument) -> Result<()> {
        let (status, body) = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    self.url(&format!("_doc/{}?refresh=true", doc.id)),
                )
                .json(doc),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::failure(status, &body));
        }
        debug!("Indexed question {}", doc.id);
        Ok(())
    }

    async fn update_fields(
        &self,
        id: i64,
        mut fields: serde_json::Map<String, Value>,
    ) -> Result<()> {
        fields.remove("tags");
        fields.remove("id");

        let mut upsert = serde_json::to_value(IndexDocument::new(id))?;
        if let Some(object) = upsert.as_object_mut() {
            object.extend(fields.clone());
        }

        let body = json!({"doc": fields, "upsert": upsert});
        let (status, response) = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    self.url(&format!("_update/{}?refresh=true", id)),
                )
                .json(&body),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::failure(status, &response));
        }
        Ok(())
    }

    async fn delete_document(&self, id: i64) -> Result<bool> {
        let (status, body) = self
            .send(self.request(
                reqwest::Method::DELETE,
                self.url(&format!("_doc/{}?refresh=true", id)),
            ))
            .await?;
        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Self::failure(s, &body)),
        }
    }

    async fn add_tag(&self, id: i64, tag: &str) -> Result<bool> {
        self.run_script(id, ADD_TAG_SCRIPT, tag)
            .await?
            .ok_or_else(|| SyncError::index(format!("document {} not found", id)))
    }

    async fn remove_tag(&self, id: i64, tag: &str) -> Result<bool> {
        Ok(self
            .run_script(id, REMOVE_TAG_SCRIPT, tag)
            .await?
            .unwrap_or(false))
    }

    async fn rename_tag(&self, before: &str, after: &str) -> Result<u64> {
        let body = json!({
            "query": {"term": {"tags": before}},
            "script": {
                "lang": "painless",
                "source": RENAME_TAG_SCRIPT,
                "params": {"before": before, "after": after}
            }
        });
        let (status, response) = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    self.url("_update_by_query?conflicts=proceed&refresh=true"),
                )
                .json(&body),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::failure(status, &response));
        }

        let failures = response["failures"].as_array().map_or(0, Vec::len);
        let conflicts = response["version_conflicts"].as_u64().unwrap_or(0);
        if failures > 0 || conflicts > 0 {
            // A rerun only touches documents still carrying the old name.
            warn!(
                "Rename '{}' -> '{}' incomplete: {} failures, {} conflicts",
                before, after, failures, conflicts
            );
            return Err(SyncError::index(format!(
                "rename '{}' -> '{}' incomplete ({} failures, {} version conflicts)",
                before, after, failures, conflicts
            )));
        }
        Ok(response["updated"].as_u64().unwrap_or(0))
    }

    async fn get_document(&self, id: i64) -> Result<Option<IndexDocument>> {
        let (status, body) = self
            .send(self.request(reqwest::Method::GET, self.url(&format!("_doc/{}", id))))
            .await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::failure(status, &body));
        }
        let doc = serde_json::from_value(body["_source"].clone())?;
        Ok(Some(doc))
    }
}

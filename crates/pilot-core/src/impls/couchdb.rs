//! CouchDB document store over HTTP.
//!
//! Status mapping: 404 -> `NotFound`, 409 -> `Conflict`, other failures ->
//! `Store`. Views live in one design document per database, see `views`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::config::DatabaseConfig;
use crate::error::{PilotError, Result};
use crate::impls::views;
use crate::ports::{Document, DocumentStore, Revision, ViewOptions, ViewResult, ViewRow};

pub struct CouchStore {
    client: Client,
    server: Url,
    database: String,
    name: String,
    credentials: Option<(String, Option<String>)>,
}

#[derive(Deserialize)]
struct SaveResponse {
    rev: String,
}

#[derive(Deserialize)]
struct ViewResponse {
    #[serde(default)]
    total_rows: usize,
    rows: Vec<ViewRow>,
}

impl CouchStore {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let server = Url::parse(&config.url)
            .map_err(|e| PilotError::Config(format!("invalid database url {}: {e}", config.url)))?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| PilotError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            name: format!("{}/{}", server.as_str().trim_end_matches('/'), config.database),
            server,
            database: config.database.clone(),
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.server.clone();
        url.path_segments_mut()
            .map_err(|_| PilotError::Config(format!("{} cannot be a base url", self.server)))?
            .pop_if_empty()
            .push(&self.database)
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, password.as_deref()),
            None => req,
        }
    }

    /// Map an HTTP response for document `id` onto the error taxonomy.
    async fn check(id: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(PilotError::NotFound(id.to_string())),
            StatusCode::CONFLICT => Err(PilotError::Conflict { id: id.to_string() }),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(PilotError::Store(format!("{id}: HTTP {status}: {body}")))
            }
        }
    }

    /// Create the database; an existing database is fine.
    pub async fn create_database(&self) -> Result<()> {
        let response = self
            .authorized(self.client.put(self.url(&[])?))
            .send()
            .await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            tracing::debug!(database = %self.database, "database already exists");
            return Ok(());
        }
        Self::check(&self.database, response).await?;
        tracing::info!(database = %self.database, "created database");
        Ok(())
    }

    /// Install or replace the design document `design`.
    pub async fn install_views(&self, design: &str) -> Result<()> {
        let id = format!("_design/{design}");
        let mut views_obj = Map::new();
        for def in views::in_design(design) {
            views_obj.insert(def.name.to_string(), json!({ "map": def.js }));
        }

        let mut doc = Document::new(id.clone())
            .with_field("language", json!("javascript"))
            .with_field("views", Value::Object(views_obj));
        match self.get(&id).await {
            Ok(existing) => doc.rev = existing.rev,
            Err(PilotError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.save(doc).await?;
        tracing::info!(database = %self.database, design, "installed views");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for CouchStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Document> {
        let url = self.url(&split_id(id))?;
        let response = self.authorized(self.client.get(url)).send().await?;
        Ok(Self::check(id, response).await?.json().await?)
    }

    async fn save(&self, mut doc: Document) -> Result<Document> {
        let url = self.url(&split_id(&doc.id))?;
        let response = self
            .authorized(self.client.put(url).json(&doc))
            .send()
            .await?;
        let saved: SaveResponse = Self::check(&doc.id, response).await?.json().await?;
        doc.rev = Some(Revision::new(saved.rev));
        Ok(doc)
    }

    async fn delete(&self, doc: &Document) -> Result<()> {
        let rev = doc
            .rev
            .as_ref()
            .ok_or_else(|| PilotError::Conflict { id: doc.id.clone() })?;
        let mut url = self.url(&split_id(&doc.id))?;
        url.query_pairs_mut().append_pair("rev", rev.as_str());
        let response = self.authorized(self.client.delete(url)).send().await?;
        Self::check(&doc.id, response).await?;
        Ok(())
    }

    async fn view(&self, name: &str, options: ViewOptions) -> Result<ViewResult> {
        let def = views::lookup(name).ok_or_else(|| PilotError::InvalidView(name.to_string()))?;
        let mut url = self.url(&["_design", def.design, "_view", def.name])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = options.limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(skip) = options.skip {
                query.append_pair("skip", &skip.to_string());
            }
            if options.include_docs {
                query.append_pair("include_docs", "true");
            }
        }
        let response = self.authorized(self.client.get(url)).send().await?;
        let body: ViewResponse = Self::check(name, response).await?.json().await?;
        Ok(ViewResult {
            total_rows: body.total_rows,
            rows: body.rows,
        })
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Vec<u8>> {
        let mut segments = split_id(id);
        segments.push(name);
        let url = self.url(&segments)?;
        let response = self.authorized(self.client.get(url)).send().await?;
        let bytes = Self::check(&format!("{id}/{name}"), response)
            .await?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

/// Design document ids keep their slash unescaped.
fn split_id(id: &str) -> Vec<&str> {
    match id.strip_prefix("_design/") {
        Some(rest) => vec!["_design", rest],
        None => vec![id],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(url: &str) -> CouchStore {
        CouchStore::new(&DatabaseConfig {
            url: url.into(),
            database: "tasks".into(),
            ..DatabaseConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn document_urls_escape_ids() {
        let s = store("http://couch:5984/");
        let url = s.url(&split_id("task-a/b")).unwrap();
        assert_eq!(url.as_str(), "http://couch:5984/tasks/task-a%2Fb");
    }

    #[test]
    fn design_ids_keep_their_slash() {
        let s = store("http://couch:5984");
        let url = s.url(&split_id("_design/tasks")).unwrap();
        assert_eq!(url.as_str(), "http://couch:5984/tasks/_design/tasks");
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let err = CouchStore::new(&DatabaseConfig {
            url: "not a url".into(),
            ..DatabaseConfig::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, PilotError::Config(_)));
    }

    #[test]
    fn name_includes_database() {
        assert_eq!(store("http://couch:5984").name(), "http://couch:5984/tasks");
    }
}

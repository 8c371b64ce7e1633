//! WebDAV attachment storage.
//!
//! Task files go to `<base>/<shard>/<task id>/<filename>`, where the shard is
//! the last two characters of the id. For generated ids those fall in the
//! random part of the ULID, so tasks spread over 1024 collections.

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};

use crate::config::WebDavConfig;
use crate::domain::ids::TaskId;
use crate::error::{PilotError, Result};

pub struct WebDav {
    client: Client,
    base: Url,
    credentials: Option<(String, Option<String>)>,
}

impl WebDav {
    pub fn new(config: &WebDavConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| PilotError::Config(format!("invalid webdav url {}: {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(PilotError::Config(format!("{} cannot be a base url", config.url)));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PilotError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    pub fn shard(id: &TaskId) -> String {
        let tail: Vec<char> = id.unprefixed().chars().rev().take(2).collect();
        tail.into_iter().rev().collect()
    }

    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// URL a task file is stored under.
    pub fn file_url(&self, id: &TaskId, filename: &str) -> Url {
        let shard = Self::shard(id);
        self.url_for(&[shard.as_str(), id.as_str(), filename])
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.credentials {
            Some((user, password)) => req.basic_auth(user, password.as_deref()),
            None => req,
        }
    }

    /// Create a collection; an existing one is fine.
    async fn mkcol(&self, url: Url) -> Result<()> {
        let method = Method::from_bytes(b"MKCOL")
            .map_err(|e| PilotError::Store(format!("MKCOL: {e}")))?;
        let response = self.request(method, url.clone()).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            s => Err(PilotError::Store(format!("MKCOL {url}: HTTP {s}"))),
        }
    }

    /// Upload a task file, creating the parent collections. Returns its URL.
    pub async fn put(&self, id: &TaskId, filename: &str, content_type: &str, data: Vec<u8>) -> Result<String> {
        let shard = Self::shard(id);
        self.mkcol(self.url_for(&[shard.as_str(), ""])).await?;
        self.mkcol(self.url_for(&[shard.as_str(), id.as_str(), ""])).await?;

        let url = self.file_url(id, filename);
        let response = self
            .request(Method::PUT, url.clone())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PilotError::Store(format!("PUT {url}: HTTP {}", response.status())));
        }
        tracing::debug!(task_id = %id, filename, "uploaded attachment");
        Ok(url.to_string())
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let url = Url::parse(url).map_err(|e| PilotError::Store(format!("invalid url {url}: {e}")))?;
        let response = self.request(Method::GET, url.clone()).send().await?;
        match response.status() {
            s if s.is_success() => Ok(response.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(PilotError::NotFound(url.to_string())),
            s => Err(PilotError::Store(format!("GET {url}: HTTP {s}"))),
        }
    }

    /// Delete a file; a missing file counts as deleted.
    pub async fn delete(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|e| PilotError::Store(format!("invalid url {url}: {e}")))?;
        let response = self.request(Method::DELETE, url.clone()).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => Err(PilotError::Store(format!("DELETE {url}: HTTP {s}"))),
        }
    }
}

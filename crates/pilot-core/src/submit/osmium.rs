//! Osmium HTTP job API.
//!
//! `POST <url>` with a job description starts a job; the `Location` header
//! of the response names it. `GET <url>` lists job URLs and `GET <job url>`
//! reports a job's state.

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use crate::app::context::JOB_ID_ENV;
use crate::domain::ids::JobId;
use crate::error::{PilotError, Result, SubmitErrorKind};
use crate::ports::JobLauncher;

/// Job states after which Osmium no longer runs the job.
const FINAL_STATES: [&str; 3] = ["STOPPED", "CANCELLED", "ERROR"];

pub struct OsmiumSubmitter {
    name: String,
    client: Client,
    url: Url,
    script: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct JobStatus {
    #[serde(default)]
    state: String,
}

impl OsmiumSubmitter {
    pub fn new(name: &str, url: &str, script: &str, token: Option<String>) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| PilotError::Config(format!("invalid osmium url {url}: {e}")))?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PilotError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            client,
            url,
            script: script.to_string(),
            token,
        })
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn error(&self, kind: SubmitErrorKind, message: impl Into<String>) -> PilotError {
        PilotError::Submission {
            host: self.name.clone(),
            kind,
            message: message.into(),
        }
    }

    fn status_error(&self, status: StatusCode, body: &str) -> PilotError {
        let kind = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SubmitErrorKind::Authentication,
            _ => SubmitErrorKind::Rejected,
        };
        self.error(kind, format!("HTTP {status}: {body}"))
    }

    fn unreachable(&self, err: reqwest::Error) -> PilotError {
        self.error(SubmitErrorKind::Unreachable, err.to_string())
    }

    fn job_description(&self, job_id: &JobId) -> serde_json::Value {
        json!({
            "executable": self.script,
            "arguments": [],
            "prestaged": [],
            "poststaged": [],
            "environment": { JOB_ID_ENV: job_id.as_str() },
        })
    }

    async fn job_is_running(&self, job_url: &str) -> Result<bool> {
        let url = self.url.join(job_url).map_err(|e| {
            self.error(SubmitErrorKind::Rejected, format!("bad job url {job_url}: {e}"))
        })?;
        let response = self
            .authorized(self.client.get(url))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, &body));
        }
        let status: JobStatus = response.json().await.map_err(|e| self.unreachable(e))?;
        Ok(!FINAL_STATES.contains(&status.state.as_str()))
    }
}

/// Last path segment of a job URL.
fn job_name(location: &str) -> &str {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(location)
}

#[async_trait]
impl JobLauncher for OsmiumSubmitter {
    fn method(&self) -> &str {
        "osmium"
    }

    fn host(&self) -> &str {
        &self.name
    }

    async fn launch(&self, job_id: &JobId) -> Result<String> {
        let response = self
            .authorized(self.client.post(self.url.clone()).json(&self.job_description(job_id)))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, &body));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| self.error(SubmitErrorKind::Rejected, "response has no Location header"))?;
        Ok(job_name(location).to_string())
    }

    async fn queued_batch_ids(&self) -> Result<Option<HashSet<String>>> {
        let response = self
            .authorized(self.client.get(self.url.clone()))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, &body));
        }
        let jobs: Vec<String> = response.json().await.map_err(|e| self.unreachable(e))?;

        let mut running = HashSet::new();
        for job_url in &jobs {
            if self.job_is_running(job_url).await? {
                running.insert(job_name(job_url).to_string());
            }
        }
        Ok(Some(running))
    }
}

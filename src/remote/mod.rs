// Remote build server access: job/build metadata and artifact byte streams.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::errors::InstallError;
use crate::models::{AgentConfig, Build, Job};

/// Artifact body as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, InstallError>>;

/// Read-only view of a CI server.
#[async_trait]
pub trait BuildSource: Send + Sync {
    async fn get_job(&self, job: &str) -> Result<Job, InstallError>;
    async fn get_build(&self, job: &str, number: u64) -> Result<Build, InstallError>;
    async fn open_artifact(&self, url: &str) -> Result<ByteStream, InstallError>;

    /// The job's last successful build, fetched in full.
    async fn last_successful_build(&self, job: &str) -> Result<Build, InstallError> {
        let info = self.get_job(job).await?;
        let build_ref = info.last_successful_build.ok_or_else(|| {
            InstallError::RemoteQuery(format!("Job '{}' has no successful build", job))
        })?;
        self.get_build(job, build_ref.number).await
    }
}

/// Jenkins REST client (`/api/json` endpoints, optional basic auth).
pub struct JenkinsClient {
    client: Client,
    base_url: Url,
    username: Option<String>,
    api_token: Option<String>,
}

impl JenkinsClient {
    pub fn new(
        server_url: &str,
        username: Option<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, InstallError> {
        let base_url = Url::parse(server_url).map_err(|e| {
            InstallError::Validation(format!("Invalid server URL '{}': {}", server_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(InstallError::Validation(format!(
                "Server URL '{}' cannot be used as a base URL",
                server_url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InstallError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            username,
            api_token,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, InstallError> {
        Self::new(
            &config.server_url,
            config.username.clone(),
            config.api_token.clone(),
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    /// `<server>/job/<a>/job/<b>/<tail...>` for a job name `a/b` (folders).
    fn job_url(&self, job: &str, tail: &[&str]) -> Result<Url, InstallError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InstallError::Validation(format!("Invalid server URL '{}'", self.base_url))
            })?;
            segments.pop_if_empty();
            for part in job.split('/').filter(|p| !p.is_empty()) {
                segments.push("job");
                segments.push(part);
            }
            segments.extend(tail);
        }
        Ok(url)
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.api_token.as_deref()),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T, InstallError> {
        tracing::debug!("GET {}", url);
        let response = self.get(url.clone()).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(InstallError::RemoteQuery(format!("{} not found ({})", what, url)));
        }
        if !status.is_success() {
            return Err(InstallError::RemoteQuery(format!(
                "{} request failed with HTTP {} ({})",
                what, status, url
            )));
        }
        response.json::<T>().await.map_err(|e| {
            InstallError::RemoteQuery(format!("Failed to decode {} from {}: {}", what, url, e))
        })
    }
}

#[async_trait]
impl BuildSource for JenkinsClient {
    async fn get_job(&self, job: &str) -> Result<Job, InstallError> {
        let mut url = self.job_url(job, &["api", "json"])?;
        url.set_query(Some("depth=1"));
        self.get_json(url, &format!("Job '{}'", job)).await
    }

    async fn get_build(&self, job: &str, number: u64) -> Result<Build, InstallError> {
        let number = number.to_string();
        let url = self.job_url(job, &[number.as_str(), "api", "json"])?;
        self.get_json(url, &format!("Build '{}' #{}", job, number))
            .await
    }

    async fn open_artifact(&self, url: &str) -> Result<ByteStream, InstallError> {
        let parsed = Url::parse(url).map_err(|e| {
            InstallError::ArtifactDownload(format!("Invalid artifact URL '{}': {}", url, e))
        })?;

        let response = self
            .get(parsed)
            .send()
            .await
            .map_err(|e| InstallError::ArtifactDownload(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::ArtifactDownload(format!(
                "{}: HTTP {}",
                url, status
            )));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| InstallError::ArtifactDownload(e.to_string()))
            })
            .boxed();
        Ok(stream)
    }
}

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use super::types::{
    DetectParams, DetectResponse, EnqueueResponse, InputFile, JobStatusResponse, ModelsResponse,
};

/// Port to the detection backend. The pipeline only ever talks to this trait;
/// tests drive it with a scripted implementation.
#[async_trait]
pub trait DetectBackend: Send + Sync {
    async fn list_models(&self) -> Result<ModelsResponse>;

    /// Synchronous detection of a single file.
    async fn detect(&self, file: &InputFile, params: &DetectParams) -> Result<DetectResponse>;

    /// Queued detection: submit now, poll `job_status` until terminal.
    async fn enqueue(&self, file: &InputFile, params: &DetectParams) -> Result<EnqueueResponse>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse>;
}

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// HTTP adapter speaking the backend's JSON/multipart contract.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn detect_form(file: &InputFile, params: &DetectParams) -> Form {
        let part = Part::bytes(file.bytes.clone()).file_name(file.filename.clone());
        Form::new()
            .part("file", part)
            .text("model", params.model.clone())
            .text("conf", params.conf.to_string())
            .text("iou", params.iou.to_string())
            .text("imgsz", params.imgsz.to_string())
            .text("max_det", params.max_det.to_string())
    }
}

#[async_trait]
impl DetectBackend for HttpBackend {
    async fn list_models(&self) -> Result<ModelsResponse> {
        let response = self
            .client
            .get(self.url("models"))
            .send()
            .await
            .context("models request failed")?
            .error_for_status()
            .context("models request rejected")?;
        response.json().await.context("invalid models response")
    }

    async fn detect(&self, file: &InputFile, params: &DetectParams) -> Result<DetectResponse> {
        let response = self
            .client
            .post(self.url("detect"))
            .multipart(Self::detect_form(file, params))
            .send()
            .await
            .with_context(|| format!("detect request failed for {}", file.filename))?
            .error_for_status()
            .with_context(|| format!("detect request rejected for {}", file.filename))?;
        response.json().await.context("invalid detect response")
    }

    async fn enqueue(&self, file: &InputFile, params: &DetectParams) -> Result<EnqueueResponse> {
        let response = self
            .client
            .post(self.url("detect/enqueue"))
            .multipart(Self::detect_form(file, params))
            .send()
            .await
            .with_context(|| format!("enqueue request failed for {}", file.filename))?
            .error_for_status()
            .with_context(|| format!("enqueue request rejected for {}", file.filename))?;
        response.json().await.context("invalid enqueue response")
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        let response = self
            .client
            .get(self.url(&format!("jobs/{job_id}")))
            .send()
            .await
            .with_context(|| format!("status request failed for job {job_id}"))?
            .error_for_status()
            .with_context(|| format!("status request rejected for job {job_id}"))?;
        response.json().await.context("invalid job status response")
    }
}

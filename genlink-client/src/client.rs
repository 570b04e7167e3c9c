//! High-level client API.

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::ClientError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use genlink_protocol::{JobResult, TaskRequest, TaskType, UploadAck};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Generation parameters for an inference job.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOptions {
    /// Model identifier; the configured model when `None`.
    pub model: Option<String>,
    pub width: u32,
    pub height: u32,
    pub number_results: u32,
    /// How the service returns the image: `URL`, `base64Data` or `dataURI`.
    pub output_type: String,
    pub output_format: String,
    pub include_cost: bool,
    pub negative_prompt: Option<String>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            model: None,
            width: 1024,
            height: 1024,
            number_results: 1,
            output_type: "URL".to_string(),
            output_format: "PNG".to_string(),
            include_cost: true,
            negative_prompt: None,
            steps: None,
            seed: None,
        }
    }
}

impl InferenceOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_negative_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(prompt.into());
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// High-level client for the image service.
///
/// Every operation waits for a ready connection (connecting or waiting out a
/// reconnection as needed) and returns a typed result.
pub struct Client {
    conn: Arc<ConnectionManager>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            conn: ConnectionManager::new(config),
        }
    }

    /// Connects to the service.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the connection is ready.
    pub fn is_connected(&self) -> bool {
        self.conn.is_ready()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Closes the connection.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.conn.disconnect().await
    }

    /// Returns the underlying connection manager.
    pub fn connection(&self) -> Arc<ConnectionManager> {
        self.conn.clone()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Submits an image generation job and waits for its result.
    ///
    /// `reference` is an image UUID, URL or data URI used to guide the
    /// generation. The returned result carries the measured round trip in
    /// `elapsed_ms`.
    pub async fn submit_inference_job(
        &self,
        prompt: &str,
        reference: Option<&str>,
        options: InferenceOptions,
    ) -> Result<JobResult, ClientError> {
        if prompt.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }

        let model = options
            .model
            .unwrap_or_else(|| self.conn.config().model.clone());
        let task = TaskRequest::new(TaskType::ImageInference)
            .with_param("positivePrompt", prompt)
            .with_param("model", model)
            .with_param("width", options.width)
            .with_param("height", options.height)
            .with_param("numberResults", options.number_results)
            .with_param("outputType", options.output_type)
            .with_param("outputFormat", options.output_format)
            .with_param("includeCost", options.include_cost)
            .with_optional_param("referenceImages", reference.map(|r| json!([r])))
            .with_optional_param("negativePrompt", options.negative_prompt)
            .with_optional_param("steps", options.steps)
            .with_optional_param("seed", options.seed);

        let started = Instant::now();
        let (token, data) = self.request(task).await?;
        let mut result = JobResult::from_data(&token, data)?;
        result.elapsed_ms = Some(started.elapsed().as_millis() as u64);
        Ok(result)
    }

    /// Uploads an image so later jobs can reference it.
    ///
    /// The bytes are sent as a base64 data URI; the MIME type comes from the
    /// filename extension.
    pub async fn upload_asset(
        &self,
        bytes: &[u8],
        filename: &str,
    ) -> Result<UploadAck, ClientError> {
        if bytes.is_empty() {
            return Err(ClientError::InvalidRequest(format!("{} is empty", filename)));
        }

        let data_uri = format!(
            "data:{};base64,{}",
            mime_type(filename),
            STANDARD.encode(bytes)
        );
        let task = TaskRequest::new(TaskType::UploadImage).with_param("image", data_uri);

        let (token, data) = self.request(task).await?;
        Ok(UploadAck::from_data(&token, data)?)
    }

    /// Looks up the result of a previously submitted job.
    pub async fn fetch_job_result(&self, job_id: &str) -> Result<JobResult, ClientError> {
        let task = TaskRequest::new(TaskType::GetImageResult).with_param("jobId", job_id);

        let (token, data) = self.request(task).await?;
        Ok(JobResult::from_data(&token, data)?)
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    /// Sends a task and returns the payload with the token it answered.
    async fn request(&self, task: TaskRequest) -> Result<(String, Value), ClientError> {
        let task_type = task.task_type();
        let data = self.conn.request(task).await?;
        if data.is_null() {
            return Err(ClientError::InvalidResponse(format!(
                "{} response carried no data",
                task_type
            )));
        }
        let token = response_token(&data).unwrap_or_default();
        Ok((token, data))
    }
}

/// Finds the `taskUUID` echoed in a payload (object or list of objects).
fn response_token(data: &Value) -> Option<String> {
    let object = match data {
        Value::Array(items) => items.first()?,
        other => other,
    };
    object
        .get("taskUUID")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Returns the MIME type for an image filename.
fn mime_type(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        Some("avif") => "image/avif",
        _ => "application/octet-stream",
    }
}

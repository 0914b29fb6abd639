//! Remote enhancement: call hosted models and turn their answers into bytes.
//!
//! A hosted model can answer in three shapes. Instead of probing the answer
//! at runtime, the client that talks to the service classifies it once into
//! an [`InferenceOutput`]:
//!
//! | Variant   | Normalisation                                   |
//! |-----------|-------------------------------------------------|
//! | `Url`     | HTTP GET, the response body is the image        |
//! | `Stream`  | all chunks concatenated in delivery order       |
//! | `Reader`  | one blocking `read_to_end` on the blocking pool |
//! | `Unrecognized` | fatal for the step                         |
//!
//! There is no retry. Any transport error, non-2xx status, failed
//! prediction or unrecognised shape aborts the submission.

use crate::config::{EngraveConfig, StepKind, StepSpec};
use crate::error::EngraveError;
use crate::pipeline::encode;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use image::{DynamicImage, ImageFormat};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::io::Read;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// A stream of body chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// The answer of one hosted model call, classified at the client boundary.
pub enum InferenceOutput {
    /// A URL to fetch.
    Url(String),
    /// Chunks to concatenate.
    Stream(ChunkStream),
    /// A handle to read fully.
    Reader(Box<dyn Read + Send>),
    /// Anything the client could not map; `kind` names what it saw.
    Unrecognized { kind: String },
}

impl fmt::Debug for InferenceOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceOutput::Url(u) => f.debug_tuple("Url").field(u).finish(),
            InferenceOutput::Stream(_) => f.write_str("Stream(..)"),
            InferenceOutput::Reader(_) => f.write_str("Reader(..)"),
            InferenceOutput::Unrecognized { kind } => f
                .debug_struct("Unrecognized")
                .field("kind", kind)
                .finish(),
        }
    }
}

impl InferenceOutput {
    /// Classify the `output` field of a finished prediction.
    ///
    /// * `"https://…"` → `Url`
    /// * `"data:…;base64,…"` → `Reader` over the decoded bytes
    /// * a one-element array holding either of the above → same as the element
    /// * anything else → `Unrecognized`
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::from_str_output(s),
            Value::Array(items) if items.len() == 1 => match &items[0] {
                Value::String(s) => Self::from_str_output(s),
                other => Self::Unrecognized {
                    kind: format!("array of {}", json_kind(other)),
                },
            },
            Value::Array(items) => Self::Unrecognized {
                kind: format!("array of {} items", items.len()),
            },
            other => Self::Unrecognized {
                kind: json_kind(other).to_string(),
            },
        }
    }

    fn from_str_output(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            return Self::Url(s.to_string());
        }
        match encode::from_data_uri(s) {
            Some(bytes) => Self::Reader(Box::new(std::io::Cursor::new(bytes))),
            None => Self::Unrecognized {
                kind: "non-URL string".to_string(),
            },
        }
    }

    /// Short name of the variant, for logs.
    pub fn shape(&self) -> &'static str {
        match self {
            InferenceOutput::Url(_) => "url",
            InferenceOutput::Stream(_) => "stream",
            InferenceOutput::Reader(_) => "reader",
            InferenceOutput::Unrecognized { .. } => "unrecognized",
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// An encoded image handed to a backend.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Bytes,
    pub mime: &'static str,
}

impl EncodedImage {
    pub fn png(bytes: Bytes) -> Self {
        Self {
            bytes,
            mime: "image/png",
        }
    }
}

/// A hosted inference service.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run `spec` on `image` and return the classified answer.
    async fn run(
        &self,
        step: StepKind,
        spec: &StepSpec,
        image: &EncodedImage,
    ) -> Result<InferenceOutput, EngraveError>;
}

/// Turn any [`InferenceOutput`] into the bytes it stands for.
pub async fn normalize_output(
    step: StepKind,
    output: InferenceOutput,
    client: &reqwest::Client,
) -> Result<Bytes, EngraveError> {
    match output {
        InferenceOutput::Url(url) => fetch_url(step, &url, client).await,
        InferenceOutput::Stream(stream) => {
            let chunks: Vec<Bytes> = stream.try_collect().await.map_err(|e| {
                EngraveError::RemoteRequest {
                    step: step.to_string(),
                    reason: format!("output stream failed: {e}"),
                }
            })?;
            Ok(Bytes::from(chunks.concat()))
        }
        InferenceOutput::Reader(mut reader) => tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).map(|_| Bytes::from(buf))
        })
        .await
        .map_err(|e| EngraveError::Internal(format!("read task panicked: {e}")))?
        .map_err(|e| EngraveError::RemoteRequest {
            step: step.to_string(),
            reason: format!("reading output failed: {e}"),
        }),
        InferenceOutput::Unrecognized { kind } => Err(EngraveError::UnrecognizedOutput {
            step: step.to_string(),
            kind,
        }),
    }
}

async fn fetch_url(
    step: StepKind,
    url: &str,
    client: &reqwest::Client,
) -> Result<Bytes, EngraveError> {
    debug!(step = %step, url = %url, "Fetching step output");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| EngraveError::RemoteRequest {
            step: step.to_string(),
            reason: e.to_string(),
        })?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EngraveError::RemoteStatus {
            step: step.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    response.bytes().await.map_err(|e| EngraveError::RemoteRequest {
        step: step.to_string(),
        reason: e.to_string(),
    })
}

/// Decode step output, off the async workers.
pub async fn decode_output(step: StepKind, bytes: Bytes) -> Result<DynamicImage, EngraveError> {
    tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| EngraveError::Internal(format!("decode task panicked: {e}")))?
        .map_err(|e| EngraveError::UndecodableImage {
            stage: step.to_string(),
            detail: e.to_string(),
        })
}

/// Run one step end to end: call, normalise, decode.
pub async fn run_step(
    backend: &dyn InferenceBackend,
    client: &reqwest::Client,
    step: StepKind,
    spec: &StepSpec,
    image: &EncodedImage,
) -> Result<DynamicImage, EngraveError> {
    info!(step = %step, model = %spec.model, "Running remote step");
    let output = backend.run(step, spec, image).await?;
    debug!(step = %step, shape = output.shape(), "Step answered");
    let bytes = normalize_output(step, output, client).await?;
    decode_output(step, bytes).await
}

// ── Replicate ────────────────────────────────────────────────────────────

/// Backend for the Replicate HTTP API.
pub struct ReplicateBackend {
    client: reqwest::Client,
    token: String,
    base_url: String,
    poll_interval: Duration,
    max_polls: u32,
    upload_threshold: usize,
    stream_downloads: bool,
}

impl fmt::Debug for ReplicateBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicateBackend")
            .field("base_url", &self.base_url)
            .field("max_polls", &self.max_polls)
            .field("stream_downloads", &self.stream_downloads)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    urls: UploadedFileUrls,
}

#[derive(Debug, Deserialize)]
struct UploadedFileUrls {
    get: String,
}

impl ReplicateBackend {
    pub fn new(client: reqwest::Client, token: impl Into<String>, config: &EngraveConfig) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: config.replicate_base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
            upload_threshold: config.upload_threshold_bytes,
            stream_downloads: config.stream_downloads,
        }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// A reference the model can read the image from.
    async fn image_reference(
        &self,
        step: StepKind,
        image: &EncodedImage,
    ) -> Result<String, EngraveError> {
        if image.bytes.len() <= self.upload_threshold {
            return Ok(encode::to_data_uri(&image.bytes, image.mime));
        }

        debug!(step = %step, bytes = image.bytes.len(), "Uploading input through files API");
        let part = reqwest::multipart::Part::bytes(image.bytes.to_vec())
            .file_name(upload_file_name(image.mime))
            .mime_str(image.mime)
            .map_err(|e| EngraveError::Internal(format!("multipart: {e}")))?;
        let form = reqwest::multipart::Form::new().part("content", part);

        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .header("Authorization", self.auth())
            .multipart(form)
            .send()
            .await
            .map_err(|e| remote_request(step, e))?;
        let file: UploadedFile = parse_json(step, response).await?;
        Ok(file.urls.get)
    }

    async fn create_prediction(
        &self,
        step: StepKind,
        spec: &StepSpec,
        input: Value,
    ) -> Result<Prediction, EngraveError> {
        let (name, version) = spec.model_ref();
        let (url, body) = match version {
            Some(v) => (
                format!("{}/predictions", self.base_url),
                json!({ "version": v, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.base_url, name),
                json!({ "input": input }),
            ),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .header("Prefer", "wait")
            .json(&body)
            .send()
            .await
            .map_err(|e| remote_request(step, e))?;
        parse_json(step, response).await
    }

    async fn get_prediction(&self, step: StepKind, id: &str) -> Result<Prediction, EngraveError> {
        let response = self
            .client
            .get(format!("{}/predictions/{}", self.base_url, id))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| remote_request(step, e))?;
        parse_json(step, response).await
    }

    /// Poll until the prediction reaches a terminal state.
    async fn wait_for(
        &self,
        step: StepKind,
        mut prediction: Prediction,
    ) -> Result<Prediction, EngraveError> {
        let mut polls = 0;
        loop {
            let status = prediction.status.clone();
            match status.as_str() {
                "succeeded" => {
                    info!(
                        step = %step,
                        prediction_id = %prediction.id,
                        polls,
                        "Prediction succeeded"
                    );
                    return Ok(prediction);
                }
                "failed" | "canceled" => {
                    let detail = match prediction.error {
                        Some(Value::String(s)) => s,
                        Some(Value::Null) | None => "no detail".to_string(),
                        Some(other) => other.to_string(),
                    };
                    return Err(EngraveError::PredictionFailed {
                        step: step.to_string(),
                        status,
                        detail,
                    });
                }
                other => {
                    if polls >= self.max_polls {
                        return Err(EngraveError::PredictionStalled {
                            step: step.to_string(),
                            polls,
                        });
                    }
                    if !matches!(other, "starting" | "processing") {
                        warn!(step = %step, status = %other, "Unknown prediction status");
                    }
                    sleep(self.poll_interval).await;
                    polls += 1;
                    prediction = self.get_prediction(step, &prediction.id).await?;
                }
            }
        }
    }

    async fn open_stream(
        &self,
        step: StepKind,
        url: &str,
    ) -> Result<InferenceOutput, EngraveError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| remote_request(step, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngraveError::RemoteStatus {
                step: step.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(InferenceOutput::Stream(Box::pin(stream)))
    }
}

#[async_trait]
impl InferenceBackend for ReplicateBackend {
    async fn run(
        &self,
        step: StepKind,
        spec: &StepSpec,
        image: &EncodedImage,
    ) -> Result<InferenceOutput, EngraveError> {
        let mut input = spec.params.clone();
        input.insert(
            spec.image_field.clone(),
            Value::String(self.image_reference(step, image).await?),
        );

        let created = self.create_prediction(step, spec, Value::Object(input)).await?;
        debug!(
            step = %step,
            prediction_id = %created.id,
            status = %created.status,
            "Prediction created"
        );
        let done = self.wait_for(step, created).await?;

        let output = done.output.unwrap_or(Value::Null);
        match InferenceOutput::from_json(&output) {
            InferenceOutput::Url(url) if self.stream_downloads => {
                self.open_stream(step, &url).await
            }
            classified => Ok(classified),
        }
    }
}

/// File name for a files-API upload, with the extension matching `mime`.
fn upload_file_name(mime: &str) -> String {
    match ImageFormat::from_mime_type(mime).and_then(|f| f.extensions_str().first()) {
        Some(ext) => format!("input.{ext}"),
        None => "input".to_string(),
    }
}

fn remote_request(step: StepKind, e: reqwest::Error) -> EngraveError {
    EngraveError::RemoteRequest {
        step: step.to_string(),
        reason: e.to_string(),
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    step: StepKind,
    response: reqwest::Response,
) -> Result<T, EngraveError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(EngraveError::RemoteStatus {
            step: step.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    response.json().await.map_err(|e| EngraveError::RemoteRequest {
        step: step.to_string(),
        reason: format!("invalid response body: {e}"),
    })
}

//! Background image generation for located events.
//!
//! Creating an event with a location enqueues a [`BackgroundJob`]. The
//! [`BackgroundWorker`] drains the queue off the request path, asks the
//! [`ImageGenerator`] for sketch and background images and attaches them
//! through the lifecycle manager. Nothing here ever fails a user request.

use crate::blob_store::GeneratedKind;
use crate::config::GeneratorConfig;
use crate::error::{ExternalServiceError, LifecycleError};
use crate::lifecycle::Lifecycle;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const SERVICE: &str = "image generator";

/// An image produced by the generator
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub bytes: Bytes,
    pub content_type: String,
}

/// Produces images from a text prompt
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate up to `count` images for `prompt`
    async fn generate(&self, prompt: &str, count: u32) -> Result<Vec<GeneratedImage>, ExternalServiceError>;
}

/// Prompt used for a generated image of `kind` evoking `location`
pub fn prompt_for(kind: GeneratedKind, location: &str) -> String {
    match kind {
        GeneratedKind::Sketch => format!(
            "A loose hand-drawn pencil sketch of a recognisable scene in {location}, \
             light strokes on white paper, no text, no people"
        ),
        GeneratedKind::Background => format!(
            "A soft, atmospheric painting evoking {location}, muted warm colours, \
             gentle blur, wide composition suitable as a full-screen background, no text"
        ),
    }
}

/// Generator speaking the OpenAI images API with base64 responses
pub struct OpenAiImageGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    size: String,
    timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    data: Vec<GenerationData>,
}

#[derive(Debug, Deserialize)]
struct GenerationData {
    b64_json: Option<String>,
}

impl OpenAiImageGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self, ExternalServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ExternalServiceError::Network {
                service: SERVICE,
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            size: config.image_size.clone(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    /// One request, one image. Some models reject `n > 1`.
    async fn generate_one(&self, prompt: &str) -> Result<Option<GeneratedImage>, ExternalServiceError> {
        let mut request = self.client.post(&self.endpoint).json(&GenerationRequest {
            model: &self.model,
            prompt,
            n: 1,
            size: &self.size,
            response_format: "b64_json",
        });
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExternalServiceError::Timeout {
                    service: SERVICE,
                    seconds: self.timeout_secs,
                }
            } else {
                ExternalServiceError::Network {
                    service: SERVICE,
                    message: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalServiceError::Status {
                service: SERVICE,
                status,
                body,
            });
        }

        let parsed: GenerationResponse =
            response
                .json()
                .await
                .map_err(|e| ExternalServiceError::Parse {
                    service: SERVICE,
                    message: e.to_string(),
                })?;

        decode_first_image(parsed)
    }
}

fn decode_first_image(response: GenerationResponse) -> Result<Option<GeneratedImage>, ExternalServiceError> {
    let Some(encoded) = response.data.into_iter().find_map(|d| d.b64_json) else {
        return Ok(None);
    };

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ExternalServiceError::Parse {
            service: SERVICE,
            message: format!("invalid base64 image: {e}"),
        })?;

    Ok(Some(GeneratedImage {
        bytes: Bytes::from(bytes),
        content_type: "image/png".to_string(),
    }))
}

#[async_trait]
impl ImageGenerator for OpenAiImageGenerator {
    #[instrument(skip(self, prompt))]
    async fn generate(&self, prompt: &str, count: u32) -> Result<Vec<GeneratedImage>, ExternalServiceError> {
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if let Some(image) = self.generate_one(prompt).await? {
                images.push(image);
            }
        }
        Ok(images)
    }
}

/// Request to decorate an event with generated images
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundJob {
    pub event_id: Uuid,
    pub location: String,
}

/// Sending half of the bounded job queue
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<BackgroundJob>,
}

impl JobQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<BackgroundJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue a job without waiting. A full or closed queue drops it.
    pub fn enqueue(&self, job: BackgroundJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => {
                metrics::counter!("memories.background.jobs.enqueued").increment(1);
                true
            }
            Err(TrySendError::Full(job)) => {
                warn!(event_id = %job.event_id, "Background job queue full, job dropped");
                metrics::counter!("memories.background.jobs.dropped").increment(1);
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(event_id = %job.event_id, "Background worker stopped, job dropped");
                metrics::counter!("memories.background.jobs.dropped").increment(1);
                false
            }
        }
    }
}

/// What a finished job achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub attached: usize,
    pub failed: usize,
    /// The event disappeared before or while the job ran
    pub event_gone: bool,
}

/// Drains the job queue with bounded concurrency
pub struct BackgroundWorker {
    lifecycle: Lifecycle,
    generator: Arc<dyn ImageGenerator>,
    sketch_count: u32,
    background_count: u32,
    permits: Arc<Semaphore>,
}

impl BackgroundWorker {
    pub fn new(lifecycle: Lifecycle, generator: Arc<dyn ImageGenerator>, config: &GeneratorConfig) -> Self {
        Self {
            lifecycle,
            generator,
            sketch_count: config.sketch_count,
            background_count: config.background_count,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
        }
    }

    /// Run until the queue closes or `shutdown` is cancelled. Jobs still
    /// running at cancellation are abandoned.
    pub fn spawn(self, receiver: mpsc::Receiver<BackgroundJob>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::new(self).run(receiver, shutdown))
    }

    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<BackgroundJob>, shutdown: CancellationToken) {
        info!("Background image worker started");

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = receiver.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = self.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(event_id = %job.event_id, "Background job abandoned on shutdown");
                    }
                    _ = worker.process(&job) => {}
                }
            });
        }

        info!("Background image worker stopped");
    }

    /// Generate and attach every image for one job
    #[instrument(skip(self, job), fields(event_id = %job.event_id))]
    pub async fn process(&self, job: &BackgroundJob) -> JobOutcome {
        let started = Instant::now();
        let mut outcome = JobOutcome::default();

        match self.lifecycle.store().event_exists(job.event_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Event deleted before generation started");
                outcome.event_gone = true;
                return outcome;
            }
            Err(e) => {
                warn!(error = %e, "Could not check event before generation");
                return outcome;
            }
        }

        let plan = [
            (GeneratedKind::Sketch, self.sketch_count),
            (GeneratedKind::Background, self.background_count),
        ];

        'kinds: for (kind, count) in plan {
            if count == 0 {
                continue;
            }

            let prompt = prompt_for(kind, &job.location);
            let images = match self.generator.generate(&prompt, count).await {
                Ok(images) => images,
                Err(e) => {
                    warn!(error = %e, kind = ?kind, "Image generation failed");
                    metrics::counter!("memories.background.images.failed").increment(1);
                    outcome.failed += count as usize;
                    continue;
                }
            };

            for (index, image) in images.iter().enumerate() {
                match self
                    .lifecycle
                    .attach_background_image(job.event_id, kind, index as u32, image, &prompt)
                    .await
                {
                    Ok(record) => {
                        debug!(image_id = %record.id, kind = ?kind, "Generated image attached");
                        outcome.attached += 1;
                    }
                    Err(LifecycleError::NotFound(_)) => {
                        debug!("Event deleted before generated image could be attached");
                        outcome.event_gone = true;
                        break 'kinds;
                    }
                    Err(e) => {
                        warn!(error = %e, kind = ?kind, "Generated image not attached");
                        metrics::counter!("memories.background.images.failed").increment(1);
                        outcome.failed += 1;
                    }
                }
            }
        }

        metrics::counter!("memories.background.images.attached").increment(outcome.attached as u64);
        metrics::histogram!("memories.background.jobs.duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            attached = outcome.attached,
            failed = outcome.failed,
            event_gone = outcome.event_gone,
            "Background job finished"
        );
        outcome
    }
}

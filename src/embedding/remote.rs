//! Remote embedding provider
//!
//! Talks to a shared GPU embedding service over HTTP. The service can be
//! briefly unavailable (busy, out of memory, restarting), so transient
//! failures are retried with exponential backoff before the error surfaces.

use super::{DEFAULT_MAX_BATCH_SIZE, EmbeddingProvider, IndexProgress};
use crate::config::EmbeddingConfig;
use crate::{Error, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Substrings marking an error as worth retrying
const TRANSIENT_SIGNALS: &[&str] = &[
    "unavailable",
    "timeout",
    "timed out",
    "temporarily",
    "connection",
];

/// Whether `err` describes a condition that may clear on its own.
pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::DimensionMismatch { .. } | Error::Config(_) | Error::Json(_) => false,
        other => {
            let message = other.to_string().to_lowercase();
            TRANSIENT_SIGNALS.iter().any(|signal| message.contains(signal))
        }
    }
}

/// One request/response exchange with the embedding service
pub trait EmbedTransport: Send + Sync {
    fn post(&self, inputs: &[String], is_query: bool) -> Result<Vec<Vec<f32>>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    is_query: bool,
}

/// What the service reports about itself on `GET /health`
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceHealth {
    pub status: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dimensions: Option<usize>,
    #[serde(default)]
    pub max_batch_size: Option<usize>,
}

/// Answer to `POST /jobs`
#[derive(Debug, Clone, Deserialize)]
pub struct JobTicket {
    pub job_id: String,
    pub status: String,
    /// 0 when the job is active, otherwise its place in the queue
    #[serde(default)]
    pub position: usize,
    #[serde(default)]
    pub recommended_batch_size: Option<usize>,
}

/// Batch sizing advice from `GET /capabilities`
#[derive(Debug, Clone, Deserialize)]
pub struct Capabilities {
    pub max_batch_size: usize,
    pub recommended_batch_size: usize,
    #[serde(default)]
    pub gpu_busy: bool,
}

#[derive(Serialize)]
struct JobRegistration<'a> {
    project: &'a str,
    total_chunks: usize,
    instance_id: &'a str,
}

#[derive(Serialize)]
struct JobProgressUpdate {
    current: usize,
}

#[derive(Serialize)]
struct ProgressUpdate<'a> {
    current: usize,
    total: usize,
    project: &'a str,
}

/// Blocking HTTP transport
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// `endpoint` is the full embed URL, e.g. `http://spark:8080/embed`
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Provider(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    /// URL of another route on the same service
    fn service_url(&self, route: &str) -> String {
        let base = self.endpoint.trim_end_matches('/');
        let base = base.strip_suffix("/embed").unwrap_or(base);
        format!("{}{}", base, route)
    }

    fn read_json<R: serde::de::DeserializeOwned>(
        response: reqwest::blocking::Response,
        what: &str,
    ) -> Result<R> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(Error::Provider(status_message(status, detail.trim())));
        }
        response
            .json()
            .map_err(|e| Error::Provider(format!("Malformed {what} response: {e}")))
    }

    fn expect_success(response: reqwest::blocking::Response) -> Result<()> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(Error::Provider(status_message(status, detail.trim())));
        }
        Ok(())
    }

    pub fn health(&self) -> Result<ServiceHealth> {
        let response = self
            .client
            .get(self.service_url("/health"))
            .send()
            .map_err(describe_request_error)?;
        Self::read_json(response, "health")
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        let response = self
            .client
            .get(self.service_url("/capabilities"))
            .send()
            .map_err(describe_request_error)?;
        Self::read_json(response, "capabilities")
    }

    /// Announce an indexing job; the service queues jobs from different clients.
    pub fn register_job(
        &self,
        project: &str,
        total_chunks: usize,
        instance_id: &str,
    ) -> Result<JobTicket> {
        let response = self
            .client
            .post(self.service_url("/jobs"))
            .json(&JobRegistration {
                project,
                total_chunks,
                instance_id,
            })
            .send()
            .map_err(describe_request_error)?;
        Self::read_json(response, "job registration")
    }

    pub fn job_progress(&self, job_id: &str, current: usize) -> Result<()> {
        let response = self
            .client
            .post(self.service_url(&format!("/jobs/{job_id}/progress")))
            .json(&JobProgressUpdate { current })
            .send()
            .map_err(describe_request_error)?;
        Self::expect_success(response)
    }

    pub fn complete_job(&self, job_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.service_url(&format!("/jobs/{job_id}/complete")))
            .send()
            .map_err(describe_request_error)?;
        Self::expect_success(response)
    }

    pub fn fail_job(&self, job_id: &str, error: &str) -> Result<()> {
        let response = self
            .client
            .post(self.service_url(&format!("/jobs/{job_id}/fail")))
            .query(&[("error", error)])
            .send()
            .map_err(describe_request_error)?;
        Self::expect_success(response)
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.service_url(&format!("/jobs/{job_id}")))
            .send()
            .map_err(describe_request_error)?;
        Self::expect_success(response)
    }

    /// Single-slot progress report understood by older services
    pub fn report_progress(&self, project: &str, current: usize, total: usize) -> Result<()> {
        let response = self
            .client
            .post(self.service_url("/progress"))
            .json(&ProgressUpdate {
                current,
                total,
                project,
            })
            .send()
            .map_err(describe_request_error)?;
        Self::expect_success(response)
    }

    pub fn clear_progress(&self) -> Result<()> {
        let response = self
            .client
            .delete(self.service_url("/progress"))
            .send()
            .map_err(describe_request_error)?;
        Self::expect_success(response)
    }
}

/// Reports index progress to the embedding service as a job.
///
/// Falls back to the single-slot `/progress` route when the service does not
/// accept job registration. Failures are logged and never stop indexing.
pub struct JobReporter {
    transport: HttpTransport,
    project: String,
    instance_id: String,
    job_id: Mutex<Option<String>>,
}

impl JobReporter {
    pub fn new(transport: HttpTransport, project: impl Into<String>) -> Self {
        Self {
            transport,
            project: project.into(),
            instance_id: format!("cartographer-{}", std::process::id()),
            job_id: Mutex::new(None),
        }
    }

    fn job_id(&self) -> Option<String> {
        self.job_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl IndexProgress for JobReporter {
    fn begin(&self, total: usize) {
        match self
            .transport
            .register_job(&self.project, total, &self.instance_id)
        {
            Ok(ticket) => {
                if ticket.position > 0 {
                    tracing::info!(
                        "Embedding job {} queued at position {}",
                        ticket.job_id,
                        ticket.position
                    );
                }
                *self.job_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(ticket.job_id);
            }
            Err(e) => {
                tracing::debug!("Job registration failed, using /progress: {}", e);
                if let Err(e) = self.transport.report_progress(&self.project, 0, total) {
                    tracing::warn!("Progress report failed: {}", e);
                }
            }
        }
    }

    fn advance(&self, done: usize, total: usize) {
        let result = match self.job_id() {
            Some(job_id) => self.transport.job_progress(&job_id, done),
            None => self.transport.report_progress(&self.project, done, total),
        };
        if let Err(e) = result {
            tracing::warn!("Progress report failed: {}", e);
        }
    }

    fn finish(&self, failure: Option<&Error>) {
        let job_id = self
            .job_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match (job_id, failure) {
            (Some(job_id), None) => self.transport.complete_job(&job_id),
            (Some(job_id), Some(err)) => self.transport.fail_job(&job_id, &err.to_string()),
            (None, _) => self.transport.clear_progress(),
        };
        if let Err(e) = result {
            tracing::warn!("Progress report failed: {}", e);
        }
    }
}

fn describe_request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Provider(format!("Embedding request timed out: {err}"))
    } else if err.is_connect() {
        Error::Provider(format!("Embedding service unavailable: {err}"))
    } else {
        Error::Provider(format!("Embedding request failed: {err}"))
    }
}

fn status_message(status: StatusCode, detail: &str) -> String {
    match status {
        StatusCode::SERVICE_UNAVAILABLE => {
            format!("Embedding service unavailable (503): {detail}")
        }
        StatusCode::BAD_GATEWAY => {
            format!("Embedding service temporarily unavailable (502): {detail}")
        }
        StatusCode::GATEWAY_TIMEOUT => format!("Embedding service gateway timeout (504): {detail}"),
        StatusCode::TOO_MANY_REQUESTS => {
            format!("Embedding service temporarily overloaded (429): {detail}")
        }
        other => format!("Embedding service returned status {other}: {detail}"),
    }
}

impl EmbedTransport for HttpTransport {
    fn post(&self, inputs: &[String], is_query: bool) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest { inputs, is_query })
            .send()
            .map_err(describe_request_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            let detail = response.text().unwrap_or_default();
            return Err(Error::Provider(status_message(status, detail.trim())));
        }

        let vectors: Vec<Vec<f32>> = response
            .json()
            .map_err(|e| Error::Provider(format!("Malformed embedding response: {e}")))?;

        if vectors.len() != inputs.len() {
            return Err(Error::Provider(format!(
                "Embedding service returned {} vectors for {} inputs",
                vectors.len(),
                inputs.len()
            )));
        }

        Ok(vectors)
    }
}

/// Retry schedule for transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Give up once another wait would run past this budget
    pub resource_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            resource_timeout: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            resource_timeout: Duration::from_secs(config.resource_timeout_secs),
        }
    }

    /// Wait before retry number `attempt + 1`: base, 2x base, 4x base...
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Provider backed by a remote embedding service
pub struct RemoteProvider<T: EmbedTransport = HttpTransport> {
    transport: T,
    name: String,
    dimensions: usize,
    max_batch_size: usize,
    policy: RetryPolicy,
    retries: AtomicUsize,
}

impl RemoteProvider<HttpTransport> {
    pub fn from_config(endpoint: &str, config: &EmbeddingConfig) -> Result<Self> {
        let transport =
            HttpTransport::new(endpoint, Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::new(transport, config.dimensions)
            .with_name(format!("remote:{}", endpoint))
            .with_max_batch_size(config.max_batch_size)
            .with_policy(RetryPolicy::from_config(config)))
    }

    pub fn health(&self) -> Result<ServiceHealth> {
        self.transport.health()
    }

    /// Shrink batches to what the service currently recommends.
    ///
    /// Keeps the configured size when the service cannot say.
    pub fn with_capabilities(mut self) -> Self {
        match self.transport.capabilities() {
            Ok(caps) => {
                let advised = caps.recommended_batch_size.min(caps.max_batch_size).max(1);
                if advised < self.max_batch_size {
                    tracing::info!(
                        "Using batches of {} (service recommends {}, max {})",
                        advised,
                        caps.recommended_batch_size,
                        caps.max_batch_size
                    );
                    self.max_batch_size = advised;
                }
            }
            Err(e) => tracing::debug!("No capabilities from {}: {}", self.name, e),
        }
        self
    }

    /// Progress hook that reports indexing of `project` as a service job
    pub fn job_reporter(&self, project: impl Into<String>) -> JobReporter {
        JobReporter::new(self.transport.clone(), project)
    }
}

impl<T: EmbedTransport> RemoteProvider<T> {
    pub fn new(transport: T, dimensions: usize) -> Self {
        Self {
            transport,
            name: "remote".to_string(),
            dimensions,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            policy: RetryPolicy::default(),
            retries: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Retries performed over this provider's lifetime
    pub fn retry_count(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: EmbedTransport> EmbeddingProvider for RemoteProvider<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn embed(&self, texts: &[String], is_query: bool) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match self.transport.post(texts, is_query) {
                Ok(vectors) => return Ok(vectors),
                Err(err) => err,
            };

            if !is_transient(&err) {
                return Err(err);
            }

            if attempt + 1 >= self.policy.max_attempts {
                tracing::warn!(
                    "Embedding request failed after {} attempts: {}",
                    attempt + 1,
                    err
                );
                return Err(err);
            }

            let delay = self.policy.delay(attempt);
            if started.elapsed() + delay > self.policy.resource_timeout {
                tracing::warn!(
                    "Embedding request out of time after {} attempts: {}",
                    attempt + 1,
                    err
                );
                return Err(err);
            }

            tracing::warn!(
                "Transient embedding failure (attempt {}/{}), retrying in {:?}: {}",
                attempt + 1,
                self.policy.max_attempts,
                delay,
                err
            );
            std::thread::sleep(delay);
            self.retries.fetch_add(1, Ordering::Relaxed);
            attempt += 1;
        }
    }
}

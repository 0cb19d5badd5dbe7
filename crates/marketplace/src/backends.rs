//! Compute backends for the provider side
//!
//! The marketplace treats execution as an external collaborator behind
//! [`ComputeBackend`]: a prompt goes in and a completion comes out, whole
//! or streamed. The in-crate implementations are deterministic stand-ins
//! used by the demo binaries and tests; a real deployment plugs an
//! inference server in here.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// A unit of work handed to a backend
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub max_tokens: u32,
}

impl ExecutionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            max_tokens: 1024,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// What a backend produced for a request
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub text: String,
    pub model: Option<String>,
}

/// Core trait all compute backends implement
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Backend identifier for logs and announcements
    fn name(&self) -> &str;

    /// Run a request to completion
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput>;

    /// Run a request, delivering incremental text deltas
    ///
    /// The channel closing marks the end of the stream; the concatenated
    /// deltas equal the full result text.
    async fn execute_stream(
        &self,
        request: ExecutionRequest,
    ) -> Result<mpsc::Receiver<Result<String>>>;
}

/// Deterministic backend answering every prompt with a fixed reply
pub struct CannedBackend {
    reply: String,
    chunk_size: usize,
    delay: Duration,
}

impl CannedBackend {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            chunk_size: 8,
            delay: Duration::ZERO,
        }
    }

    /// Characters per streamed chunk
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Pause before completing and between streamed chunks
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ComputeBackend for CannedBackend {
    fn name(&self) -> &str {
        "canned"
    }

    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionOutput> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ExecutionOutput {
            text: self.reply.clone(),
            model: None,
        })
    }

    async fn execute_stream(
        &self,
        _request: ExecutionRequest,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let (tx, rx) = mpsc::channel(16);
        let chunks = chunk_text(&self.reply, self.chunk_size);
        let delay = self.delay;
        tokio::spawn(async move {
            for chunk in chunks {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// Backend that rejects every request, for exercising failure paths
pub struct FailingBackend {
    reason: String,
}

impl FailingBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ComputeBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionOutput> {
        Err(BackendError::ExecutionError(self.reason.clone()))
    }

    async fn execute_stream(
        &self,
        _request: ExecutionRequest,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        Err(BackendError::Unavailable(self.reason.clone()))
    }
}

/// Backend that never completes, for exercising execution timeouts
pub struct StallingBackend;

#[async_trait]
impl ComputeBackend for StallingBackend {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionOutput> {
        std::future::pending().await
    }

    async fn execute_stream(
        &self,
        _request: ExecutionRequest,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        // Leak the sender so the stream never yields and never closes
        let (tx, rx) = mpsc::channel(1);
        std::mem::forget(tx);
        Ok(rx)
    }
}

fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|c| c.iter().collect())
        .collect()
}

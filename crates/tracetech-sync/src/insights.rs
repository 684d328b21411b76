//! Best-effort technical summaries of records.
//!
//! Summaries never fail from the caller's point of view: any error degrades
//! to [`SUMMARY_UNAVAILABLE`]. Successful summaries are cached per record.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracetech_config::{RecordId, SummarizerConfig};
use tracing::{debug, warn};

/// Returned whenever a summary cannot be produced.
pub const SUMMARY_UNAVAILABLE: &str = "could not summarize";

const SYSTEM_PROMPT: &str = "You are an expert technical traceability engineer. \
Write an extremely brief executive summary (at most 3 lines) of the activity below. \
Keep the tone professional and highly technical.";

/// Text generation backend.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str, context: &str) -> anyhow::Result<String>;
}

/// Summarizer used when no endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSummarizer;

#[async_trait]
impl Summarizer for DisabledSummarizer {
    async fn summarize(&self, _text: &str, _context: &str) -> anyhow::Result<String> {
        Err(anyhow!("summarizer is disabled"))
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Summarizer posting to an Ollama-style `/api/generate` endpoint.
#[derive(Debug, Clone)]
pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client for summarizer")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
        })
    }

    fn prompt(text: &str, context: &str) -> String {
        format!("Technical activity:\n- Category: {}\n- Description: {}", context, text)
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, text: &str, context: &str) -> anyhow::Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            system: SYSTEM_PROMPT,
            prompt: Self::prompt(text, context),
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Summarizer request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Summarizer returned {}: {}", status, body));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse summarizer response")?;
        let summary = body.response.trim().to_string();
        if summary.is_empty() {
            return Err(anyhow!("Summarizer returned an empty summary"));
        }
        Ok(summary)
    }
}

/// Build the summarizer selected by configuration.
pub fn summarizer_from_config(config: &SummarizerConfig) -> Arc<dyn Summarizer> {
    if !config.enabled {
        return Arc::new(DisabledSummarizer);
    }
    match HttpSummarizer::new(config) {
        Ok(summarizer) => Arc::new(summarizer),
        Err(err) => {
            warn!(error = %err, "summarizer unavailable");
            Arc::new(DisabledSummarizer)
        }
    }
}

/// Per-record summary cache in front of a [`Summarizer`].
pub struct SummaryService {
    summarizer: Arc<dyn Summarizer>,
    cache: HashMap<RecordId, String>,
}

impl SummaryService {
    pub fn new(summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            summarizer,
            cache: HashMap::new(),
        }
    }

    pub fn cached(&self, record_id: &str) -> Option<&str> {
        self.cache.get(record_id).map(String::as_str)
    }

    /// Summary of a record's description, or [`SUMMARY_UNAVAILABLE`].
    pub async fn summarize(&mut self, record_id: &str, description: &str, category: &str) -> String {
        if let Some(summary) = self.cache.get(record_id) {
            return summary.clone();
        }
        match self.summarizer.summarize(description, category).await {
            Ok(summary) => {
                debug!(record_id, "cached summary");
                self.cache.insert(record_id.to_string(), summary.clone());
                summary
            }
            Err(err) => {
                warn!(record_id, error = %err, "summary failed");
                SUMMARY_UNAVAILABLE.to_string()
            }
        }
    }

    pub fn invalidate(&mut self, record_id: &str) {
        self.cache.remove(record_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl Summarizer for Scripted {
        async fn summarize(&self, text: &str, context: &str) -> anyhow::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(anyhow!("timeout"));
            }
            Ok(format!("{} / {}", context, text))
        }
    }

    #[tokio::test]
    async fn failures_degrade_and_are_not_cached() {
        let summarizer = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let mut service = SummaryService::new(summarizer.clone());

        assert_eq!(service.summarize("r1", "Cambio", "Mantenimiento").await, SUMMARY_UNAVAILABLE);
        assert!(service.cached("r1").is_none());

        assert_eq!(service.summarize("r1", "Cambio", "Mantenimiento").await, "Mantenimiento / Cambio");
        // Served from cache
        service.summarize("r1", "Cambio", "Mantenimiento").await;
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_summarizer_degrades() {
        let mut service = SummaryService::new(summarizer_from_config(&SummarizerConfig::default()));
        assert_eq!(service.summarize("r1", "x", "y").await, SUMMARY_UNAVAILABLE);
    }

    #[test]
    fn request_shape() {
        let request = GenerateRequest {
            model: "llama3",
            system: SYSTEM_PROMPT,
            prompt: HttpSummarizer::prompt("Cambio de filtros", "Mantenimiento"),
            stream: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "llama3");
        assert_eq!(value["stream"], false);
        assert!(value["prompt"].as_str().unwrap().contains("Mantenimiento"));
    }
}

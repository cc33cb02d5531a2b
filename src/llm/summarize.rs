//! Summarization, either in-process via an `LlmProvider` or remote via an
//! engine's `POST /summarize` endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::error::LlmError;
use crate::text::truncate_chars;

/// System prompt for summaries.
pub const SUMMARIZE_SYSTEM_PROMPT: &str = "Summarize the following text in 3-5 bullet points.";

/// Maximum characters of input forwarded to the model.
pub const MAX_SUMMARY_INPUT_CHARS: usize = 3000;

/// Summarization request body (`POST /summarize`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeRequest {
    #[serde(default)]
    pub text: String,
}

/// Summarization response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeResponse {
    pub summary: String,
}

/// Anything that can turn text into a summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String, LlmError>;
}

/// Summarizes by calling the LLM directly.
pub struct LlmSummarizer {
    llm: Arc<dyn LlmProvider>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(SUMMARIZE_SYSTEM_PROMPT),
            ChatMessage::user(truncate_chars(text, MAX_SUMMARY_INPUT_CHARS)),
        ]);
        let response = self.llm.complete(request).await?;
        Ok(response.content)
    }
}

/// Summarizes through a remote engine's `POST {base_url}/summarize`.
pub struct HttpSummarizer {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSummarizer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "summarize-endpoint".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, LlmError> {
        let url = format!("{}/summarize", self.base_url);
        let body = SummarizeRequest {
            text: text.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: url.clone(),
                        timeout: self.timeout,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::RequestFailed {
                provider: url,
                reason: format!("HTTP {status}"),
            });
        }

        let parsed: SummarizeResponse =
            response.json().await.map_err(|e| LlmError::InvalidResponse {
                provider: url,
                reason: e.to_string(),
            })?;
        Ok(parsed.summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::llm::provider::CompletionResponse;

    struct RecordingLlm {
        seen: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl LlmProvider for RecordingLlm {
        fn model_name(&self) -> &str {
            "recording"
        }

        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            Ok(CompletionResponse {
                content: "- point".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn llm_summarizer_sends_prompt_and_caps_input() {
        let llm = Arc::new(RecordingLlm {
            seen: Mutex::new(Vec::new()),
        });
        let summarizer = LlmSummarizer::new(llm.clone());

        let summary = summarizer.summarize(&"y".repeat(5000)).await.unwrap();
        assert_eq!(summary, "- point");

        let seen = llm.seen.lock().unwrap();
        let messages = &seen[0].messages;
        assert_eq!(messages[0].content, SUMMARIZE_SYSTEM_PROMPT);
        assert_eq!(messages[1].content.chars().count(), MAX_SUMMARY_INPUT_CHARS);
    }

    #[test]
    fn request_text_defaults_to_empty() {
        let req: SummarizeRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.text, "");
    }
}

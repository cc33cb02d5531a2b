//! Action handlers: one interpreter per subtask action.
//!
//! Handlers decide their own failure mode. `navigate` and `search` raise on
//! timeouts; `extract` and `summarize` always return an output, folding
//! failures into a placeholder or an `error` field. The executor treats both
//! outcomes uniformly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::browser::Page;
use crate::config::HandlerConfig;
use crate::error::HandlerError;
use crate::llm::Summarizer;
use crate::task::{Action, Subtask};
use crate::text::truncate_chars;

/// Placeholder content when `extract` finds nothing.
pub const EXTRACT_PLACEHOLDER: &str = "Could not extract content";

/// Interval between checks while waiting for search results to render.
const SEARCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Action-specific payload produced by a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutput {
    pub fields: Map<String, Value>,
    /// Set when the handler degraded instead of raising.
    pub error: Option<String>,
}

impl ActionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Interpreter for one action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action(&self) -> Action;

    /// Run against the job's page. `Err` is a fault the executor records.
    async fn run(&self, page: &mut dyn Page, subtask: &Subtask)
    -> Result<ActionOutput, HandlerError>;
}

/// Registry of action handlers, keyed by action.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Action, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in handlers.
    pub fn with_defaults(config: &HandlerConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NavigateHandler::new(config)));
        registry.register(Arc::new(SearchHandler::new(config)));
        registry.register(Arc::new(ExtractHandler::new(config)));
        registry.register(Arc::new(SummarizeHandler::new(config, summarizer)));
        registry
    }

    /// Register a handler, replacing any previous one for the same action.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        let action = handler.action();
        if self.handlers.insert(action, handler).is_some() {
            tracing::debug!(%action, "Replaced action handler");
        } else {
            tracing::debug!(%action, "Registered action handler");
        }
    }

    pub fn get(&self, action: Action) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&action).cloned()
    }

    pub fn has(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }
}

// ── navigate ────────────────────────────────────────────────────────

/// Loads `target` as a URL and reports the page title.
pub struct NavigateHandler {
    timeout: Duration,
}

impl NavigateHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            timeout: config.navigate_timeout,
        }
    }
}

#[async_trait]
impl ActionHandler for NavigateHandler {
    fn action(&self) -> Action {
        Action::Navigate
    }

    async fn run(
        &self,
        page: &mut dyn Page,
        subtask: &Subtask,
    ) -> Result<ActionOutput, HandlerError> {
        page.goto(&subtask.target, self.timeout).await?;
        let title = page.title().await?;
        Ok(ActionOutput::new()
            .with("url", subtask.target.clone())
            .with("title", title))
    }
}

// ── search ──────────────────────────────────────────────────────────

/// Runs `target` as a search query and collects the top result headings.
pub struct SearchHandler {
    search_url: String,
    navigate_timeout: Duration,
    wait: Duration,
    selector: String,
    cap: usize,
}

impl SearchHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            search_url: config.search_url.clone(),
            navigate_timeout: config.navigate_timeout,
            wait: config.search_wait,
            selector: config.search_selector.clone(),
            cap: config.search_result_cap,
        }
    }

    fn query_url(&self, query: &str) -> Result<String, HandlerError> {
        reqwest::Url::parse_with_params(&self.search_url, &[("q", query)])
            .map(String::from)
            .map_err(|e| HandlerError::InvalidParameters {
                action: Action::Search.to_string(),
                reason: format!("bad search URL {}: {e}", self.search_url),
            })
    }
}

#[async_trait]
impl ActionHandler for SearchHandler {
    fn action(&self) -> Action {
        Action::Search
    }

    async fn run(
        &self,
        page: &mut dyn Page,
        subtask: &Subtask,
    ) -> Result<ActionOutput, HandlerError> {
        let url = self.query_url(&subtask.target)?;
        page.goto(&url, self.navigate_timeout).await?;

        let deadline = tokio::time::Instant::now() + self.wait;
        let markers = loop {
            let found = page.query_all(&self.selector).await?;
            if !found.is_empty() {
                break found;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HandlerError::Timeout {
                    action: format!("waiting for {:?} on search results", self.selector),
                    timeout: self.wait,
                });
            }
            tokio::time::sleep(SEARCH_POLL_INTERVAL).await;
        };

        let mut results = Vec::new();
        for marker in markers.iter().take(self.cap) {
            match page.inner_text(marker).await {
                Ok(text) => {
                    let text = text.trim();
                    if !text.is_empty() {
                        results.push(Value::String(text.to_string()));
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Skipping unreadable search result"),
            }
        }

        Ok(ActionOutput::new()
            .with("query", subtask.target.clone())
            .with("results", Value::Array(results)))
    }
}

// ── extract ─────────────────────────────────────────────────────────

/// Reads the text of the element matched by `params.selector`.
pub struct ExtractHandler {
    default_selector: String,
    max_chars: usize,
}

impl ExtractHandler {
    pub fn new(config: &HandlerConfig) -> Self {
        Self {
            default_selector: config.extract_default_selector.clone(),
            max_chars: config.extract_max_chars,
        }
    }
}

#[async_trait]
impl ActionHandler for ExtractHandler {
    fn action(&self) -> Action {
        Action::Extract
    }

    async fn run(
        &self,
        page: &mut dyn Page,
        subtask: &Subtask,
    ) -> Result<ActionOutput, HandlerError> {
        let selector = subtask
            .param_str("selector")
            .unwrap_or(&self.default_selector);

        let content = match page.query_one(selector).await {
            Ok(Some(element)) => match page.inner_text(&element).await {
                Ok(text) => Some(truncate_chars(&text, self.max_chars).to_string()),
                Err(e) => {
                    tracing::warn!(selector, error = %e, "Extract could not read element text");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(selector, error = %e, "Extract query failed");
                None
            }
        };

        Ok(ActionOutput::new().with(
            "content",
            content.unwrap_or_else(|| EXTRACT_PLACEHOLDER.to_string()),
        ))
    }
}

// ── summarize ───────────────────────────────────────────────────────

/// Summarizes `params.text`, or `target` when no text is given.
pub struct SummarizeHandler {
    summarizer: Arc<dyn Summarizer>,
    max_chars: usize,
    timeout: Duration,
}

impl SummarizeHandler {
    pub fn new(config: &HandlerConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            summarizer,
            max_chars: config.summarize_max_chars,
            timeout: config.summarize_timeout,
        }
    }
}

#[async_trait]
impl ActionHandler for SummarizeHandler {
    fn action(&self) -> Action {
        Action::Summarize
    }

    async fn run(
        &self,
        _page: &mut dyn Page,
        subtask: &Subtask,
    ) -> Result<ActionOutput, HandlerError> {
        let text = subtask.param_str("text").unwrap_or(&subtask.target);
        let text = truncate_chars(text, self.max_chars);

        let output = match tokio::time::timeout(self.timeout, self.summarizer.summarize(text)).await
        {
            Ok(Ok(summary)) => ActionOutput::new().with("summary", summary),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Summarization failed");
                ActionOutput::new().with_error(e.to_string())
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "Summarization timed out");
                ActionOutput::new().with_error(format!(
                    "summarization timed out after {:?}",
                    self.timeout
                ))
            }
        };
        Ok(output)
    }
}

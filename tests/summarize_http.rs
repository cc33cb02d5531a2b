//! `HttpSummarizer` against a live gateway on a loopback port.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::routing::post;

use task_relay::browser::{ElementHandle, Page};
use task_relay::config::HandlerConfig;
use task_relay::error::{BrowserError, LlmError};
use task_relay::gateway;
use task_relay::llm::{HttpSummarizer, Summarizer};
use task_relay::pipeline::ActionHandler;
use task_relay::pipeline::handlers::SummarizeHandler;
use task_relay::store::InMemoryStore;
use task_relay::task::{Action, Subtask};

/// Remembers the length of every text it summarizes.
#[derive(Default)]
struct CountingSummarizer {
    lengths: Mutex<Vec<usize>>,
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, LlmError> {
        let len = text.chars().count();
        self.lengths.lock().unwrap().push(len);
        Ok(format!("- {len} chars"))
    }
}

/// Page for handlers that never touch the browser.
struct NoPage;

#[async_trait]
impl Page for NoPage {
    async fn goto(&mut self, _url: &str, _timeout: Duration) -> Result<(), BrowserError> {
        Err(BrowserError::Closed)
    }

    async fn title(&mut self) -> Result<String, BrowserError> {
        Err(BrowserError::Closed)
    }

    async fn query_all(&mut self, _selector: &str) -> Result<Vec<ElementHandle>, BrowserError> {
        Err(BrowserError::Closed)
    }

    async fn query_one(&mut self, _selector: &str) -> Result<Option<ElementHandle>, BrowserError> {
        Err(BrowserError::Closed)
    }

    async fn inner_text(&mut self, _element: &ElementHandle) -> Result<String, BrowserError> {
        Err(BrowserError::Closed)
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        Ok(())
    }
}

/// Serve `app` on an ephemeral loopback port and return its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn summarizes_through_gateway() {
    let backend = Arc::new(CountingSummarizer::default());
    let base = serve(gateway::routes(
        Arc::new(InMemoryStore::new()),
        Some(backend.clone()),
    ))
    .await;

    let summarizer = HttpSummarizer::new(format!("{base}/"), Duration::from_secs(5)).unwrap();
    let summary = summarizer.summarize(&"z".repeat(4500)).await.unwrap();

    assert_eq!(summary, "- 3000 chars");
    assert_eq!(backend.lengths.lock().unwrap().as_slice(), [3000]);
}

#[tokio::test]
async fn error_status_becomes_request_failure() {
    let base = serve(gateway::routes(Arc::new(InMemoryStore::new()), None)).await;

    let summarizer = HttpSummarizer::new(base, Duration::from_secs(5)).unwrap();
    match summarizer.summarize("hello").await {
        Err(LlmError::RequestFailed { provider, reason }) => {
            assert!(provider.ends_with("/summarize"));
            assert!(reason.contains("503"), "unexpected reason: {reason}");
        }
        other => panic!("expected request failure, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_engine_times_out() {
    let app = Router::new().route(
        "/summarize",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "late"
        }),
    );
    let base = serve(app).await;

    let summarizer = HttpSummarizer::new(base, Duration::from_millis(200)).unwrap();
    match summarizer.summarize("hello").await {
        Err(LlmError::Timeout { timeout, .. }) => {
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn unavailable_engine_degrades_summarize_subtask() {
    let base = serve(gateway::routes(Arc::new(InMemoryStore::new()), None)).await;
    let summarizer = Arc::new(HttpSummarizer::new(base, Duration::from_secs(5)).unwrap());
    let handler = SummarizeHandler::new(&HandlerConfig::default(), summarizer);

    let subtask = Subtask::new(Action::Summarize, "some page text");
    let output = handler.run(&mut NoPage, &subtask).await.unwrap();

    let error = output.error.expect("summarize error embedded in the result");
    assert!(error.contains("503"), "unexpected error: {error}");
    assert!(!output.fields.contains_key("summary"));
}

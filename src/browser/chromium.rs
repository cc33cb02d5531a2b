//! Headless Chromium over the DevTools protocol.
//!
//! One Chromium process serves the whole executor; each `open_page` opens a
//! fresh tab and `close` shuts it. Element handles index into a per-page
//! table that is cleared on every navigation.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use chromiumoxide::page::Page as CdpPage;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Browser, ElementHandle, Page};
use crate::config::BrowserSettings;
use crate::error::BrowserError;

/// A launched Chromium process.
pub struct ChromiumBrowser {
    inner: CdpBrowser,
    handler: JoinHandle<()>,
    command_timeout: Duration,
}

impl ChromiumBrowser {
    /// Launch headless Chromium, downloading it first when only a download
    /// directory is configured.
    pub async fn launch(settings: &BrowserSettings) -> Result<Self, BrowserError> {
        let executable = match (&settings.executable, &settings.download_dir) {
            (Some(path), _) => Some(PathBuf::from(path)),
            (None, Some(dir)) => Some(fetch_chromium(dir).await?),
            (None, None) => None,
        };

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .request_timeout(settings.command_timeout);
        if let Some(path) = &executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(BrowserError::SessionFailed)?;

        let (inner, mut handler) = CdpBrowser::launch(config)
            .await
            .map_err(|e| BrowserError::SessionFailed(format!("failed to launch Chromium: {e}")))?;
        let handler = tokio::spawn(async move { while handler.next().await.is_some() {} });

        info!(executable = ?executable, "Chromium launched");
        Ok(Self {
            inner,
            handler,
            command_timeout: settings.command_timeout,
        })
    }

    /// Close the browser process and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.inner.close().await {
            warn!(error = %e, "Failed to close Chromium");
        }
        if let Err(e) = self.inner.wait().await {
            warn!(error = %e, "Failed to reap Chromium");
        }
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

async fn fetch_chromium(dir: &str) -> Result<PathBuf, BrowserError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| BrowserError::SessionFailed(format!("creating {dir}: {e}")))?;
    let options = BrowserFetcherOptions::builder()
        .with_path(dir)
        .build()
        .map_err(|e| BrowserError::SessionFailed(format!("fetcher options: {e}")))?;
    let info = BrowserFetcher::new(options)
        .fetch()
        .await
        .map_err(|e| BrowserError::SessionFailed(format!("downloading Chromium: {e}")))?;
    Ok(info.executable_path)
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn open_page(&self) -> Result<Box<dyn Page>, BrowserError> {
        let page = bounded("new_page", self.command_timeout, self.inner.new_page("about:blank"))
            .await
            .map_err(|e| BrowserError::SessionFailed(e.to_string()))?;
        debug!("Opened Chromium tab");
        Ok(Box::new(ChromiumPage::new(page, self.command_timeout)))
    }
}

/// One Chromium tab.
pub struct ChromiumPage {
    page: Option<CdpPage>,
    elements: Vec<Element>,
    command_timeout: Duration,
}

impl ChromiumPage {
    fn new(page: CdpPage, command_timeout: Duration) -> Self {
        Self {
            page: Some(page),
            elements: Vec::new(),
            command_timeout,
        }
    }

    fn page(&self) -> Result<&CdpPage, BrowserError> {
        self.page.as_ref().ok_or(BrowserError::Closed)
    }

    fn element(&self, handle: &ElementHandle) -> Result<&Element, BrowserError> {
        handle
            .id()
            .parse::<usize>()
            .ok()
            .and_then(|index| self.elements.get(index))
            .ok_or_else(|| BrowserError::Command {
                operation: "inner_text".to_string(),
                reason: format!("stale element handle {}", handle.id()),
            })
    }

    /// Keep resolved elements alive and hand out their table indexes.
    fn remember(&mut self, found: Vec<Element>) -> Vec<ElementHandle> {
        found
            .into_iter()
            .map(|element| {
                self.elements.push(element);
                ElementHandle((self.elements.len() - 1).to_string())
            })
            .collect()
    }
}

/// Run one DevTools command under `limit`.
async fn bounded<T, F>(operation: &str, limit: Duration, command: F) -> Result<T, BrowserError>
where
    F: Future<Output = Result<T, CdpError>>,
{
    match tokio::time::timeout(limit, command).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BrowserError::Command {
            operation: operation.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(BrowserError::Timeout {
            operation: operation.to_string(),
            timeout: limit,
        }),
    }
}

#[async_trait]
impl Page for ChromiumPage {
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        let page = self.page()?;
        bounded(&format!("goto {url}"), timeout, async {
            page.goto(url.to_string()).await.map(|_| ())
        })
        .await?;
        self.elements.clear();
        Ok(())
    }

    async fn title(&mut self) -> Result<String, BrowserError> {
        let page = self.page()?;
        let title = bounded("title", self.command_timeout, page.get_title()).await?;
        Ok(title.unwrap_or_default())
    }

    async fn query_all(&mut self, selector: &str) -> Result<Vec<ElementHandle>, BrowserError> {
        let page = self.page()?;
        let found = bounded(
            "query_all",
            self.command_timeout,
            page.find_elements(selector.to_string()),
        )
        .await?;
        Ok(self.remember(found))
    }

    async fn query_one(&mut self, selector: &str) -> Result<Option<ElementHandle>, BrowserError> {
        let page = self.page()?;
        let mut found = bounded(
            "query_one",
            self.command_timeout,
            page.find_elements(selector.to_string()),
        )
        .await?;
        found.truncate(1);
        Ok(self.remember(found).pop())
    }

    async fn inner_text(&mut self, element: &ElementHandle) -> Result<String, BrowserError> {
        self.page()?;
        let element = self.element(element)?;
        let text = bounded("inner_text", self.command_timeout, element.inner_text()).await?;
        Ok(text.unwrap_or_default())
    }

    async fn close(&mut self) -> Result<(), BrowserError> {
        let page = self.page.take().ok_or(BrowserError::Closed)?;
        self.elements.clear();
        bounded("close", self.command_timeout, page.close()).await
    }
}

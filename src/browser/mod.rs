//! Automation capability consumed by the action handlers.
//!
//! A `Browser` hands out one `Page` per job. Pages are stateful and not safe
//! for concurrent use, so every method takes `&mut self`.

pub mod chromium;

pub use chromium::{ChromiumBrowser, ChromiumPage};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrowserError;

/// Opaque reference to an element on the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(pub String);

impl ElementHandle {
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// One automation session.
#[async_trait]
pub trait Page: Send {
    /// Load `url`, failing with `BrowserError::Timeout` if it takes longer
    /// than `timeout`.
    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Title of the current document.
    async fn title(&mut self) -> Result<String, BrowserError>;

    /// Every element matching a CSS selector, in document order.
    async fn query_all(&mut self, selector: &str) -> Result<Vec<ElementHandle>, BrowserError>;

    /// First element matching a CSS selector, if any.
    async fn query_one(&mut self, selector: &str) -> Result<Option<ElementHandle>, BrowserError>;

    /// Rendered text of an element.
    async fn inner_text(&mut self, element: &ElementHandle) -> Result<String, BrowserError>;

    /// Release the session. Further calls return `BrowserError::Closed`.
    async fn close(&mut self) -> Result<(), BrowserError>;
}

/// Source of pages.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn open_page(&self) -> Result<Box<dyn Page>, BrowserError>;
}

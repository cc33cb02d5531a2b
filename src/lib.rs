//! Task Relay: natural-language tasks decomposed by an LLM and executed
//! step by step in a browser session.

pub mod browser;
pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod pipeline;
pub mod store;
pub mod task;
pub mod text;

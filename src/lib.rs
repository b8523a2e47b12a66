/// Niche Tweet Bot Library
///
/// This library provides the core functionality for the posting bot:
/// text generation, near-duplicate filtering, posting history, publishing,
/// and the single-shot workflow that ties them together.

pub mod bot;
pub mod config;
pub mod error;
pub mod generator;
pub mod history;
pub mod http_server;
pub mod publisher;
pub mod similarity;
pub mod workflow;

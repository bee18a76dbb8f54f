//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection handling, HTTP
//! API wrappers, bounded retry policies, history records, and a
//! single-job [`session::InferenceSession`] for driving ComfyUI
//! video-generation servers.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod processor;
pub mod retry;
pub mod session;

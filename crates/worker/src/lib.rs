//! Serverless video generation worker.
//!
//! Turns a job (prompt, conditioning image, sampling options) into a
//! ComfyUI workflow run and returns the resulting video as base64.

pub mod config;
pub mod handler;
pub mod output;
pub mod response;

//! Job preparation for the video generation worker.
//!
//! Parses job input, materializes the conditioning image, and turns the
//! workflow template into a submission-ready graph. Nothing here talks to
//! the inference server.

pub mod error;
pub mod input;
pub mod job;
pub mod resolution;
pub mod validation;
pub mod workflow;

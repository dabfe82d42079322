//! Infrastructure layer: embedding dispatch, durable job queue, config.

pub mod config;
pub mod embeddings;
pub mod jobs;

mod integration_tests;

//! Embedding request dispatch.
//!
//! ## Design
//!
//! - Callers submit texts and get a future; nobody blocks on the backend
//! - A single drain loop per dispatcher paces backend calls against a
//!   per-minute ceiling and batches pending requests
//! - Transient backend failures are retried with exponential backoff;
//!   exhaustion rejects the whole batch with the last error
//!
//! ## Components
//!
//! - `RateLimiter`: minimum spacing between backend calls
//! - `EmbeddingDispatcher`: pending queue + exclusive drain loop
//! - `HttpEmbedder`: OpenAI-compatible wire adapter

pub mod dispatcher;
pub mod openai;
pub mod rate_limit;

pub use dispatcher::{EmbeddingDispatcher, EmbeddingTicket};
pub use openai::HttpEmbedder;
pub use rate_limit::RateLimiter;

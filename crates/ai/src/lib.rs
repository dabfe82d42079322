//! `pulsecrm-ai`
//!
//! **Responsibility:** AI subsystem boundary.
//!
//! This crate is intentionally **not** part of the domain model:
//! - It must not depend on CRM aggregates (Contacts/Deals/etc).
//! - It must not mutate domain state.
//! - It defines the contracts infra implements (embedding backends),
//!   not their transports.

pub mod embedder;
pub mod result;

pub use embedder::{Embedder, Embedding};
pub use result::EmbeddingError;

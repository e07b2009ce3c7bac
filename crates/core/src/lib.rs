//! `catalog-core`: shared building blocks for the product command pipeline.
//!
//! This crate contains **pure** primitives (no broker, no storage).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::ProductId;

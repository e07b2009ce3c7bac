//! Products domain module.
//!
//! This crate contains the product intents the write side publishes and the
//! record shape the consumer projects, implemented purely as deterministic
//! domain logic (no IO, no broker, no storage).

pub mod product;

pub use product::{ProductCatalog, ProductCommand, ProductDraft, ProductPatch, ProductRecord};

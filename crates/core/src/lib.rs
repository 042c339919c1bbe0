//! `pressroom-core`: content pipeline domain primitives.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! identifiers and records the enrichment workers read and write.

pub mod error;
pub mod id;
pub mod item;

pub use error::{DomainError, DomainResult};
pub use id::ItemId;
pub use item::{ContentItem, SimilarityInfo, Vector};

//! Enrichment workers driven by queue jobs.
//!
//! Every worker follows the same shape: lock the item, do the work, record
//! the result and stage follow-up jobs in one transaction, then push the
//! follow-ups after commit.

pub mod duplicate_detection;
pub mod index_retention;
pub mod vector_indexing;

pub use duplicate_detection::{
    DETECT_DUPLICATES_JOB, DetectionError, DetectionOutcome, DuplicateDetectionConfig,
    DuplicateDetector,
};
pub use index_retention::{IndexRetention, IndexRetentionConfig};
pub use vector_indexing::{INDEX_VECTOR_JOB, IndexingError, IndexingOutcome, VectorIndexer};

//! Approximate nearest-neighbour search over day-sharded indices.

pub mod client;
pub mod http;
pub mod in_memory;
pub mod service;
pub mod shard;

pub use client::{AnnIndexClient, AnnIndexConfig, Neighbor, SearchParams};
pub use http::HttpVectorService;
pub use in_memory::InMemoryVectorService;
pub use service::{AnnError, CreateIndexRequest, Hit, SpaceType, VectorService};
pub use shard::{MAX_SEARCH_DAYS, days_in_range, index_day, index_name, merge_hits};

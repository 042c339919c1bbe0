//! Infrastructure layer: relational store, job queue and outbox, ANN index
//! client, enrichment workers.

pub mod ann;
pub mod config;
pub mod db;
pub mod jobs;
pub mod workers;

//! The harvesting pipeline: fetch, extract, coordinate.

pub mod coordinator;
pub mod extractor;
pub mod fetcher;

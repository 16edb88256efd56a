//! Data model shared by the pipeline stages.

pub mod outcome;
pub mod position;
pub mod report;

//! Report destinations.

pub mod sink;

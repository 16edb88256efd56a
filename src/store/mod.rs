//! Durable state kept between runs.

pub mod cursor;

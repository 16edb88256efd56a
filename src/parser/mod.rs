//! Decoding: MIME decomposition of fetched messages and DMARC report parsing.

pub mod mime;
pub mod report;

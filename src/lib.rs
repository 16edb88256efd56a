//! `dmarc-harvest`: incremental DMARC aggregate report harvesting over IMAP.
//!
//! A run selects one mailbox, streams every message past the stored
//! cursor, pulls report attachments out of each message, decodes them,
//! and moves the cursor forward to the last message it consumed.

pub mod config;
pub mod error;
pub mod export;
pub mod mailbox;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod store;

//! Centralized error types for dmarc-harvest.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the harvesting pipeline.
///
/// Variants fall into two classes. Fatal ones (see [`HarvestError::is_fatal`])
/// end the run; the rest are contained to a single part, attachment or
/// message and are only recorded in that message's outcome.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// TCP connection to the IMAP server could not be opened.
    #[error("Could not connect to '{server}': {source}")]
    Connect {
        server: String,
        source: std::io::Error,
    },

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_native_tls::native_tls::Error),

    /// The server rejected the credentials.
    #[error("Login failed for '{username}': {reason}")]
    Auth { username: String, reason: String },

    /// A network-level failure without a more specific cause.
    #[error("Network error: {0}")]
    Network(String),

    /// A network operation exceeded its deadline.
    #[error("Timed out after {secs}s during {operation}")]
    Timeout { operation: &'static str, secs: u64 },

    /// Protocol or transport error reported by the IMAP client.
    #[error("IMAP error: {0}")]
    Imap(#[from] async_imap::error::Error),

    /// The mailbox could not be selected.
    #[error("Could not select mailbox '{mailbox}': {reason}")]
    MailboxSelect { mailbox: String, reason: String },

    /// A FETCH response carried no message body.
    #[error("Server didn't return a body for message {position}")]
    MissingBody { position: u32 },

    /// The MIME structure of a message could not be walked.
    #[error("Structural parse error in message {position}: {reason}")]
    StructuralParse { position: u32, reason: String },

    /// A part declared a filename that could not be used.
    #[error("Unusable attachment metadata: {reason}")]
    AttachmentMetadata { reason: String },

    /// An attachment could not be decoded into a report.
    #[error("Could not decode '{filename}': {source}")]
    Decode {
        filename: String,
        source: ReportError,
    },

    /// Logout did not complete cleanly.
    #[error("Logout error: {0}")]
    Logout(String),

    /// The cursor document could not be read or written.
    #[error("Cursor store I/O error on '{path}': {source}")]
    CursorStore {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The cursor document is not valid JSON.
    #[error("Corrupt cursor document '{path}': {source}")]
    CursorFormat {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// A decoded report could not be handed downstream.
    #[error("Report sink error: {0}")]
    Sink(String),

    /// The fetch producer task panicked or was cancelled.
    #[error("Fetch task failed: {0}")]
    TaskFailed(String),

    /// The configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HarvestError {
    /// Whether this error ends the run rather than a single message or part.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::Tls(_)
            | Self::Auth { .. }
            | Self::Network(_)
            | Self::Timeout { .. }
            | Self::Imap(_)
            | Self::MailboxSelect { .. }
            | Self::MissingBody { .. }
            | Self::CursorStore { .. }
            | Self::CursorFormat { .. }
            | Self::TaskFailed(_)
            | Self::Config(_) => true,
            Self::StructuralParse { .. }
            | Self::AttachmentMetadata { .. }
            | Self::Decode { .. }
            | Self::Logout(_)
            | Self::Sink(_) => false,
        }
    }

    /// Create a `CursorStore` variant from a path and an `io::Error`.
    pub fn cursor_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::CursorStore {
            path: path.into(),
            source,
        }
    }
}

/// Errors produced while turning an attachment body into a report.
#[derive(Error, Debug)]
pub enum ReportError {
    /// Reading or decompressing the body failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The decompressed report exceeds the configured limit.
    #[error("Report exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    /// The zip container could not be read.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The XML does not match the aggregate report schema.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// The report parsed but is not a usable aggregate report.
    #[error("Invalid report: {0}")]
    Invalid(String),
}

/// Convenience alias for `Result<T, HarvestError>`.
pub type Result<T> = std::result::Result<T, HarvestError>;

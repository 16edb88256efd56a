//! Mailbox session: the capabilities the pipeline needs from a mail server.

pub mod imap;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::position::{FetchRange, MailboxPosition, MailboxSnapshot};

/// Mailbox selected when none is configured.
pub const DEFAULT_MAILBOX: &str = "inbox";

/// One fetched message body.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub position: MailboxPosition,
    pub body: Vec<u8>,
}

/// An authenticated session against a remote mailbox.
///
/// Implementations perform no retries; every failure goes straight back to
/// the caller. A session is moved into the fetch task for the duration of
/// a range fetch, hence the `Send + 'static` bound.
#[async_trait]
pub trait MailboxClient: Send + 'static {
    /// Select `name` and capture its message count.
    async fn select(&mut self, name: &str) -> Result<MailboxSnapshot>;

    /// Stream the bodies of every message in `range`, in ascending order.
    async fn fetch_range<'a>(
        &'a mut self,
        range: FetchRange,
    ) -> Result<BoxStream<'a, Result<RawMessage>>>;

    /// End the session.
    async fn logout(&mut self) -> Result<()>;
}

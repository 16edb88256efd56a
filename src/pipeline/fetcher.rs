//! Batch fetcher: one producer task streaming a range into a bounded queue.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{HarvestError, Result};
use crate::mailbox::{MailboxClient, RawMessage};
use crate::model::position::FetchRange;

/// Spawns range fetches.
#[derive(Debug, Clone, Copy)]
pub struct BatchFetcher {
    capacity: usize,
    read_timeout: Option<Duration>,
}

impl BatchFetcher {
    /// `capacity` messages may be in flight between producer and consumer.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            read_timeout: None,
        }
    }

    /// Fail the fetch when no message arrives within `limit`.
    pub fn with_read_timeout(mut self, limit: Duration) -> Self {
        self.read_timeout = Some(limit);
        self
    }

    /// Move `client` into a producer task that fetches `range`.
    ///
    /// The client comes back from [`Fetch::finish`].
    pub fn start<C: MailboxClient>(&self, client: C, range: FetchRange) -> Fetch<C> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let read_timeout = self.read_timeout;
        let task = tokio::spawn(async move {
            let mut client = client;
            produce(&mut client, range, read_timeout, tx).await;
            client
        });
        Fetch { rx, task }
    }
}

/// Push every message of `range` into `tx`. Transport errors are sent as
/// the final item.
async fn produce<C: MailboxClient>(
    client: &mut C,
    range: FetchRange,
    read_timeout: Option<Duration>,
    tx: mpsc::Sender<Result<RawMessage>>,
) {
    let mut stream = match client.fetch_range(range).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "imap: fetch error");
            let _ = tx.send(Err(e)).await;
            return;
        }
    };

    let mut sent = 0u64;
    loop {
        let next = match read_timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                Ok(next) => next,
                Err(_) => Some(Err(HarvestError::Timeout {
                    operation: "fetch",
                    secs: limit.as_secs(),
                })),
            },
            None => stream.next().await,
        };
        let Some(item) = next else { break };

        let failed = item.is_err();
        if let Err(ref e) = item {
            error!(error = %e, sent, "imap: fetch error");
        }
        if tx.send(item).await.is_err() {
            debug!("Fetch consumer went away");
            break;
        }
        if failed {
            break;
        }
        sent += 1;
    }
    debug!(range = %range, sent, "Fetch producer done");
}

/// A running range fetch.
pub struct Fetch<C> {
    rx: mpsc::Receiver<Result<RawMessage>>,
    task: JoinHandle<C>,
}

impl<C: MailboxClient> Fetch<C> {
    /// Next message in ascending position order, or `None` once the range
    /// is drained. An `Err` is always the last item.
    pub async fn next(&mut self) -> Option<Result<RawMessage>> {
        self.rx.recv().await
    }

    /// Stop consuming and wait for the producer to hand the client back.
    pub async fn finish(self) -> Result<C> {
        let Fetch { mut rx, task } = self;
        rx.close();
        // Drain so a producer blocked on a full queue can observe the close.
        while rx.recv().await.is_some() {}
        task.await
            .map_err(|e| HarvestError::TaskFailed(e.to_string()))
    }
}

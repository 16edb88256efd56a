//! IMAP over implicit TLS.

use std::time::Duration;

use async_imap::Session;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::net::TcpStream;
use tokio_native_tls::native_tls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::config::ImapConfig;
use crate::error::{HarvestError, Result};
use crate::model::position::{FetchRange, MailboxPosition, MailboxSnapshot};

use super::{MailboxClient, RawMessage};

/// Full message, without setting `\Seen`.
const FETCH_QUERY: &str = "BODY.PEEK[]";

type ImapStream = Compat<tokio_native_tls::TlsStream<TcpStream>>;

/// An authenticated IMAP session.
pub struct ImapClient {
    session: Session<ImapStream>,
    timeout: Duration,
}

impl ImapClient {
    /// Open a TLS connection to `config.server` and log in.
    pub async fn connect(config: &ImapConfig) -> Result<Self> {
        let (host, port) = config.host_and_port()?;
        let timeout = Duration::from_secs(config.connect_timeout_secs);

        let tcp = with_timeout("connect", timeout, async {
            TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|source| HarvestError::Connect {
                    server: format!("{host}:{port}"),
                    source,
                })
        })
        .await?;

        let tls = TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        let tls = tokio_native_tls::TlsConnector::from(tls);
        let tls_stream = with_timeout("TLS handshake", timeout, async {
            Ok(tls.connect(&host, tcp).await?)
        })
        .await?;
        debug!(host = %host, port, "imap: connected");

        let client = async_imap::Client::new(tls_stream.compat());
        let session = with_timeout("login", timeout, async {
            client
                .login(&config.username, &config.password)
                .await
                .map_err(|(e, _client)| HarvestError::Auth {
                    username: config.username.clone(),
                    reason: e.to_string(),
                })
        })
        .await?;
        info!(host = %host, username = %config.username, "imap: logged in");

        Ok(Self {
            session,
            timeout: Duration::from_secs(config.read_timeout_secs),
        })
    }
}

#[async_trait]
impl MailboxClient for ImapClient {
    async fn select(&mut self, name: &str) -> Result<MailboxSnapshot> {
        let timeout = self.timeout;
        let mailbox = with_timeout("select", timeout, async {
            self.session.select(name).await.map_err(|e| match e {
                async_imap::error::Error::No(reason) | async_imap::error::Error::Bad(reason) => {
                    HarvestError::MailboxSelect {
                        mailbox: name.to_string(),
                        reason,
                    }
                }
                other => HarvestError::Imap(other),
            })
        })
        .await?;

        debug!(
            mailbox = name,
            exists = mailbox.exists,
            uid_validity = ?mailbox.uid_validity,
            "imap: mailbox selected"
        );
        Ok(MailboxSnapshot {
            total_messages: MailboxPosition(mailbox.exists),
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn fetch_range<'a>(
        &'a mut self,
        range: FetchRange,
    ) -> Result<BoxStream<'a, Result<RawMessage>>> {
        let sequence_set = range.to_sequence_set();
        debug!(sequence_set = %sequence_set, "imap: fetch");
        let stream = self.session.fetch(sequence_set, FETCH_QUERY).await?;

        Ok(stream
            .map(|item| -> Result<RawMessage> {
                let fetch = item?;
                let body = fetch.body().ok_or(HarvestError::MissingBody {
                    position: fetch.message,
                })?;
                Ok(RawMessage {
                    position: MailboxPosition(fetch.message),
                    body: body.to_vec(),
                })
            })
            .boxed())
    }

    async fn logout(&mut self) -> Result<()> {
        debug!("imap: logout");
        self.session
            .logout()
            .await
            .map_err(|e| HarvestError::Logout(e.to_string()))
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| HarvestError::Timeout {
            operation,
            secs: limit.as_secs(),
        })?
}

use std::sync::Arc;

use async_trait::async_trait;
use imap::{ClientBuilder, ConnectionMode};
use imap_proto::types::Envelope;
use mailmirror_core::{MessageStore, normalize_message_id};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::gate::SessionGate;
use crate::pipeline::{ENVELOPE_STRIDE, FetchPipeline};
use crate::{FetchError, FetchKind, FetchReport, MessageSource, RemoteItem, RemoteSession, SessionError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default)]
    pub skip_tls_verify: bool,
    #[serde(default = "default_stride")]
    pub envelope_stride: u32,
}

fn default_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_stride() -> u32 {
    ENVELOPE_STRIDE
}

/// Opens authenticated sessions with the mailbox already selected.
pub trait Connector: Send + Sync + 'static {
    type Session: RemoteSession;

    fn connect(&self) -> Result<Self::Session, SessionError>;
}

pub struct ImapConnector {
    config: ImapConfig,
}

impl ImapConnector {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

impl Connector for ImapConnector {
    type Session = ImapSession;

    fn connect(&self) -> Result<ImapSession, SessionError> {
        let mut inner = imap_connect(&self.config)?;
        let selected = inner.select(&self.config.mailbox)?;
        debug!(mailbox = %self.config.mailbox, exists = selected.exists, "imap mailbox selected");
        Ok(ImapSession {
            inner,
            mailbox: self.config.mailbox.clone(),
        })
    }
}

fn imap_connect(config: &ImapConfig) -> Result<imap::Session<imap::Connection>, SessionError> {
    info!(host = %config.host, port = config.port, "imap connect");
    let client = ClientBuilder::new(config.host.as_str(), config.port)
        .tls_kind(imap::TlsKind::Native)
        .mode(ConnectionMode::AutoTls)
        .danger_skip_tls_verify(config.skip_tls_verify)
        .connect()?;
    debug!("imap tcp connected");
    let session = client
        .login(&config.username, &config.password)
        .map_err(|e| e.0)?;
    debug!(username = %config.username, "imap login ok");
    Ok(session)
}

pub struct ImapSession {
    inner: imap::Session<imap::Connection>,
    mailbox: String,
}

impl RemoteSession for ImapSession {
    fn message_count(&mut self) -> Result<u32, SessionError> {
        Ok(self.inner.select(&self.mailbox)?.exists)
    }

    fn fetch(&mut self, kind: FetchKind) -> Result<Vec<RemoteItem>, SessionError> {
        let (set, query) = match kind {
            FetchKind::Envelopes { first, last } => (format!("{}:{}", first, last), "ENVELOPE"),
            FetchKind::Body { seq } => (seq.to_string(), "(ENVELOPE BODY.PEEK[])"),
        };
        let fetches = self.inner.fetch(set, query)?;
        // The server may interleave unsolicited FETCH responses (flag
        // changes) with ours; those lack the attribute we asked for.
        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                let envelope = fetch.envelope();
                let body = fetch.body();
                let answered = match kind {
                    FetchKind::Envelopes { .. } => envelope.is_some(),
                    FetchKind::Body { .. } => body.is_some(),
                };
                if !answered {
                    debug!(seq = fetch.message, "ignoring unsolicited fetch response");
                    return None;
                }
                Some(RemoteItem {
                    seq: fetch.message,
                    message_id: envelope.and_then(envelope_message_id),
                    subject: envelope.and_then(envelope_subject),
                    body: body.map(<[u8]>::to_vec),
                })
            })
            .collect())
    }

    fn noop(&mut self) -> Result<(), SessionError> {
        self.inner.noop()?;
        Ok(())
    }

    fn logout(&mut self) {
        if let Err(err) = self.inner.logout() {
            debug!(error = %err, "imap logout failed");
        }
    }
}

fn envelope_message_id(envelope: &Envelope<'_>) -> Option<String> {
    let raw = envelope.message_id.as_deref()?;
    normalize_message_id(&String::from_utf8_lossy(raw))
}

fn envelope_subject(envelope: &Envelope<'_>) -> Option<String> {
    let raw = envelope.subject.as_deref()?;
    Some(String::from_utf8_lossy(raw).into_owned())
}

/// Where an [`ImapSource`] stands with its server.
pub enum ConnectionState<S> {
    Disconnected,
    Connecting,
    Ready(S),
}

impl<S> ConnectionState<S> {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready(_) => "ready",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready(_))
    }
}

/// Mirrors one remote mailbox. The session is kept between cycles and
/// checked with NOOP before reuse.
pub struct ImapSource<C: Connector> {
    connector: Arc<C>,
    mailbox: String,
    stride: u32,
    state: ConnectionState<C::Session>,
}

impl ImapSource<ImapConnector> {
    pub fn from_config(config: ImapConfig) -> Self {
        let mailbox = config.mailbox.clone();
        let stride = config.envelope_stride;
        Self::new(ImapConnector::new(config), &mailbox, stride)
    }
}

impl<C: Connector> ImapSource<C> {
    pub fn new(connector: C, mailbox: &str, stride: u32) -> Self {
        Self {
            connector: Arc::new(connector),
            mailbox: mailbox.to_string(),
            stride,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn state(&self) -> &ConnectionState<C::Session> {
        &self.state
    }

    /// Brings the source to `Ready`, reusing a healthy session when there is
    /// one and opening a new one otherwise.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if let ConnectionState::Ready(session) =
            std::mem::replace(&mut self.state, ConnectionState::Connecting)
        {
            let (session, alive) = run_blocking(move || {
                let mut session = session;
                let alive = session.noop();
                (session, alive)
            })
            .await
            .inspect_err(|_| self.state = ConnectionState::Disconnected)?;
            match alive {
                Ok(()) => {
                    debug!(mailbox = %self.mailbox, "reusing imap session");
                    self.state = ConnectionState::Ready(session);
                    return Ok(());
                }
                Err(err) => {
                    warn!(mailbox = %self.mailbox, error = %err, "imap session failed health check, reconnecting");
                }
            }
        }

        let connector = self.connector.clone();
        match run_blocking(move || connector.connect()).await {
            Ok(Ok(session)) => {
                info!(mailbox = %self.mailbox, "imap session ready");
                self.state = ConnectionState::Ready(session);
                Ok(())
            }
            Ok(Err(err)) | Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Logs out and drops the session, if any.
    pub async fn close(&mut self) {
        if let ConnectionState::Ready(session) =
            std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        {
            let _ = run_blocking(move || {
                let mut session = session;
                session.logout();
            })
            .await;
        }
    }

    fn take_session(&mut self) -> Result<C::Session, SessionError> {
        match std::mem::replace(&mut self.state, ConnectionState::Disconnected) {
            ConnectionState::Ready(session) => Ok(session),
            _ => Err(SessionError::Remote("not connected".to_string())),
        }
    }
}

#[async_trait]
impl<C: Connector> MessageSource for ImapSource<C> {
    async fn fetch(&mut self, store: Arc<dyn MessageStore>) -> Result<FetchReport, FetchError> {
        self.connect().await?;
        let session = self.take_session()?;

        let (session, count) = run_blocking(move || {
            let mut session = session;
            let count = session.message_count();
            (session, count)
        })
        .await?;
        let count = count?;
        info!(mailbox = %self.mailbox, count, "fetching mailbox");

        let gate = SessionGate::spawn(session);
        let outcome = match FetchPipeline::new(store.clone(), gate.handle(), self.stride)
            .run(count)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // The session goes down with the gate once the remaining
                // tasks let go of it.
                error!(mailbox = %self.mailbox, error = %err, "fetch cycle aborted");
                return Err(err);
            }
        };

        match gate.shutdown().await {
            Ok(exit) if !exit.poisoned => self.state = ConnectionState::Ready(exit.session),
            Ok(exit) => warn!(
                mailbox = %self.mailbox,
                refused = exit.refused,
                "dropping imap session after failure"
            ),
            Err(err) => warn!(mailbox = %self.mailbox, error = %err, "imap session lost"),
        }

        store
            .replace_membership(&self.mailbox, &outcome.message_ids)
            .await?;
        let report = outcome.report;
        info!(
            mailbox = %self.mailbox,
            envelopes = outcome.message_ids.len(),
            stored = report.stored,
            skipped = report.skipped,
            failed = report.failed(),
            "fetch cycle complete"
        );
        Ok(report)
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| SessionError::Remote(format!("blocking task failed: {}", err)))
}

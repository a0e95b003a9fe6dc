//! Remote mail sources that feed a [`MessageStore`].
//!
//! Two sources exist: a single IMAP mailbox, fetched through a gated
//! session, and a public-inbox git archive walked newest-first.

mod archive;
mod error;
mod gate;
mod imap_source;
mod pipeline;

use std::sync::Arc;

use async_trait::async_trait;
use mailmirror_core::MessageStore;

pub use archive::{ArchiveConfig, ArchiveSource, DEFAULT_DUPLICATE_LIMIT};
pub use error::{FetchError, SessionError};
pub use gate::{FetchKind, RemoteItem, RemoteSession};
pub use imap_source::{
    ConnectionState, Connector, ImapConfig, ImapConnector, ImapSession, ImapSource,
};
pub use pipeline::ENVELOPE_STRIDE;

/// Counts from one fetch cycle.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub stored: usize,
    /// Messages already in the store, plus archive entries that did not parse.
    pub skipped: usize,
    pub failures: Vec<BodyFailure>,
}

impl FetchReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// A message whose body could not be fetched or stored. The cycle carried on
/// without it.
#[derive(Debug)]
pub struct BodyFailure {
    pub seq: u32,
    pub message_id: String,
    pub error: FetchError,
}

#[async_trait]
pub trait MessageSource: Send {
    /// Runs one fetch cycle into `store`.
    async fn fetch(&mut self, store: Arc<dyn MessageStore>) -> Result<FetchReport, FetchError>;
}

//! Local, deduplicated mail store: schema, ingest invariants, thread
//! reconstruction and patch-series export.

mod address;
mod error;
mod export;
mod message;
mod patches;
mod store;
mod threads;

use async_trait::async_trait;

pub use address::{Address, EnvelopeRole, normalize_address_header};
pub use error::StoreError;
pub use export::ExportEntry;
pub use message::{ParsedMessage, StoredMessage, first_message_id, normalize_message_id, parse_message};
pub use patches::{PatchKind, classify_subject, series_for_export};
pub use store::SqliteMailStore;
pub use threads::{MAX_THREAD_DEPTH, MessageTree};

/// Store operations consumed by message sources during ingestion.
///
/// `add_message` is the only dedup arbiter: callers use `is_present` purely as
/// a hint to avoid downloads, and must treat [`StoreError::AlreadyPresent`]
/// from `add_message` as the authoritative answer.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Parses and stores a raw RFC 5322 message, returning its message-id.
    async fn add_message(&self, raw: &[u8]) -> Result<String, StoreError>;
    async fn is_present(&self, message_id: &str) -> Result<bool, StoreError>;
    /// Atomically replaces the membership snapshot of `mailbox`.
    async fn replace_membership(&self, mailbox: &str, message_ids: &[String])
    -> Result<(), StoreError>;
    async fn create_mailbox(&self, name: &str) -> Result<i64, StoreError>;
}

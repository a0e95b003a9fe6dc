use mailmirror_core::StoreError;
use thiserror::Error;

/// Failure of the remote session itself. The session may be unusable
/// afterwards, so these always end the cycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("imap error: {0}")]
    Imap(#[from] imap::Error),

    #[error("remote session: {0}")]
    Remote(String),

    #[error("session gate closed")]
    GateClosed,

    #[error("session unusable after earlier failure")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("unexpected sequence number: wanted {wanted}, got {got}")]
    SequenceMismatch { wanted: u32, got: u32 },

    #[error("unexpected message id for seq {seq}: wanted {wanted}, got {got}")]
    MessageIdMismatch {
        seq: u32,
        wanted: String,
        got: String,
    },

    #[error("no body returned for seq {seq}")]
    MissingBody { seq: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("archive: {0}")]
    Archive(#[from] git2::Error),

    #[error("reading archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch task stopped: {0}")]
    Aborted(String),
}

impl FetchError {
    /// Whether the enclosing cycle must stop rather than move on to the next
    /// message.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, FetchError::Session(_) | FetchError::Aborted(_))
    }

    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            FetchError::SequenceMismatch { .. } | FetchError::MessageIdMismatch { .. }
        )
    }
}

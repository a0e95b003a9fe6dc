use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Headers could not be parsed. Sources skip such messages.
    #[error("parsing message: {0}")]
    Parse(String),

    /// The message-id is already stored. Expected during normal ingestion.
    #[error("message id present: {0}")]
    AlreadyPresent(String),

    #[error("unknown mailbox: {0}")]
    UnknownMailbox(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse(reason.into())
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, Self::AlreadyPresent(_))
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}

impl From<mailparse::MailParseError> for StoreError {
    fn from(err: mailparse::MailParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

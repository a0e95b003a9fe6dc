use chrono::{DateTime, Utc};

use crate::{
    Address, EnvelopeRole, MessageTree, SqliteMailStore, StoreError, StoredMessage,
    series_for_export,
};

/// One message handed to an mbox or patch-series writer.
#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub message_id: String,
    pub from: Option<Address>,
    pub date: DateTime<Utc>,
    pub raw: Vec<u8>,
}

impl SqliteMailStore {
    /// Export entries for the patch series found in `tree`.
    pub async fn export_series(&self, tree: &MessageTree) -> Result<Vec<ExportEntry>, StoreError> {
        self.export_entries(&series_for_export(tree)).await
    }

    pub async fn export_entries(
        &self,
        messages: &[&StoredMessage],
    ) -> Result<Vec<ExportEntry>, StoreError> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            let from = self
                .addresses(&message.message_id, EnvelopeRole::From)
                .await?
                .into_iter()
                .next();
            out.push(ExportEntry {
                message_id: message.message_id.clone(),
                from,
                date: message.date(),
                raw: message.raw.clone(),
            });
        }
        Ok(out)
    }
}

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::warn;

use crate::store::{MESSAGE_COLUMNS, MessageRow, message_from_row};
use crate::{SqliteMailStore, StoreError, StoredMessage};

/// Reply chains deeper than this are cut off when building a tree.
pub const MAX_THREAD_DEPTH: usize = 512;

/// A message and its replies, ordered by date. Built per query, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct MessageTree {
    pub message: StoredMessage,
    pub replies: Vec<MessageTree>,
}

impl MessageTree {
    pub fn leaf(message: StoredMessage) -> Self {
        Self {
            message,
            replies: Vec::new(),
        }
    }

    /// Number of messages in the tree, root included.
    pub fn message_count(&self) -> usize {
        1 + self
            .replies
            .iter()
            .map(MessageTree::message_count)
            .sum::<usize>()
    }

    /// Depth-first, pre-order walk yielding each node with its depth.
    pub fn walk(&self) -> Vec<(usize, &StoredMessage)> {
        let mut out = Vec::new();
        let mut stack = vec![(0usize, self)];
        while let Some((depth, node)) = stack.pop() {
            out.push((depth, &node.message));
            for reply in node.replies.iter().rev() {
                stack.push((depth + 1, reply));
            }
        }
        out
    }

    fn assemble(message: StoredMessage, replies: &mut HashMap<String, Vec<StoredMessage>>) -> Self {
        let children = replies.remove(&message.message_id).unwrap_or_default();
        Self {
            replies: children
                .into_iter()
                .map(|child| MessageTree::assemble(child, replies))
                .collect(),
            message,
        }
    }
}

impl SqliteMailStore {
    /// Roots of every thread touching `mailbox`'s current membership.
    ///
    /// The ancestor set is the closure of in-reply-to links from the
    /// membership. A stored message in that set is a root when its parent is
    /// absent or not stored locally.
    pub async fn get_message_roots(&self, mailbox: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let mailbox_id = self.require_mailbox(mailbox).await?;
        let query = format!(
            "WITH RECURSIVE
                 ancestor(message_id) AS (
                     SELECT message_id FROM mailbox_membership WHERE mailbox_id = ?
                     UNION
                     SELECT m.in_reply_to
                         FROM messages AS m JOIN ancestor ON m.message_id = ancestor.message_id
                         WHERE m.in_reply_to IS NOT NULL
                 )
             SELECT {}
             FROM messages AS self
             WHERE self.message_id IN (SELECT message_id FROM ancestor)
               AND NOT EXISTS (
                   SELECT 1 FROM messages AS parent WHERE parent.message_id = self.in_reply_to
               )
             ORDER BY self.date_ts, self.message_id",
            qualified_columns("self")
        );
        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(mailbox_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    /// Finds the root in `mailbox` whose message-id is `message_id`.
    pub async fn find_root(
        &self,
        mailbox: &str,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let roots = self.get_message_roots(mailbox).await?;
        Ok(roots.into_iter().find(|m| m.message_id == message_id))
    }

    /// Builds the reply tree below `root` by following in-reply-to links.
    pub async fn get_tree(&self, root: StoredMessage) -> Result<MessageTree, StoreError> {
        let mut replies: HashMap<String, Vec<StoredMessage>> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::from([root.message_id.clone()]);
        let mut frontier = vec![root.message_id.clone()];
        let mut depth = 0;

        while !frontier.is_empty() {
            if depth == MAX_THREAD_DEPTH {
                warn!(root = %root.message_id, depth, "thread too deep, truncating");
                break;
            }
            let mut next = Vec::new();
            for parent in frontier {
                let children: Vec<StoredMessage> = self
                    .replies_to(&parent)
                    .await?
                    .into_iter()
                    .filter(|child| seen.insert(child.message_id.clone()))
                    .collect();
                if children.is_empty() {
                    continue;
                }
                next.extend(children.iter().map(|child| child.message_id.clone()));
                replies.insert(parent, children);
            }
            frontier = next;
            depth += 1;
        }

        Ok(MessageTree::assemble(root, &mut replies))
    }

    async fn replies_to(&self, message_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let query = format!(
            "SELECT {} FROM messages WHERE in_reply_to = ? ORDER BY date_ts, message_id",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(message_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }
}

fn qualified_columns(alias: &str) -> String {
    MESSAGE_COLUMNS
        .split(", ")
        .map(|col| format!("{}.{}", alias, col))
        .collect::<Vec<_>>()
        .join(", ")
}

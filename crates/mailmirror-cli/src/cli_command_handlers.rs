use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use mailmirror_core::{MessageStore, MessageTree, SqliteMailStore};
use mailmirror_source::{
    ArchiveConfig, ArchiveSource, DEFAULT_DUPLICATE_LIMIT, FetchReport, ImapConfig, ImapSource,
    MessageSource,
};
use serde_json::json;
use tracing::info;

use super::{
    Cli, CliCommand, MailboxArg, MirrorConfig, load_mirror_config, output_ok, report_to_json,
    summary_to_json, tree_to_json,
};
use crate::mbox::write_mbox;

pub(crate) fn run_cli(rt: &Arc<tokio::runtime::Runtime>, cli: Cli) -> Result<()> {
    let config = load_mirror_config(cli.config.as_deref())?;
    let db_path = cli.db.clone().unwrap_or_else(|| config.db_path.clone());
    let store = Arc::new(rt.block_on(open_store(&db_path))?);

    match cli.command {
        CliCommand::Fetch => {
            let imap = config.require_imap()?.clone();
            let mailbox = imap.mailbox.clone();
            let report = rt.block_on(fetch_imap(store, imap))?;
            output_ok(json!({
                "mailbox": mailbox,
                "report": report_to_json(&report),
            }))
        }
        CliCommand::FetchArchive(args) => {
            let archive = archive_config(&config, args.path)?;
            let report = rt.block_on(fetch_archive(store, &archive))?;
            output_ok(json!({
                "archive": archive.path.display().to_string(),
                "report": report_to_json(&report),
            }))
        }
        CliCommand::Status => {
            let (messages, mailboxes) = rt.block_on(async {
                let messages = store.message_count().await?;
                let mut mailboxes = Vec::new();
                for (_, name) in store.list_mailboxes().await? {
                    let members = store.membership(&name).await?.len();
                    mailboxes.push(json!({ "name": name, "members": members }));
                }
                anyhow::Ok((messages, mailboxes))
            })?;
            output_ok(json!({
                "db_path": db_path,
                "messages": messages,
                "mailboxes": mailboxes,
            }))
        }
        CliCommand::ListThreads(args) => {
            let mailbox = mailbox_for(&config, &args);
            let roots = rt.block_on(store.get_message_roots(&mailbox))?;
            let threads: Vec<_> = roots.iter().map(summary_to_json).collect();
            output_ok(json!({ "mailbox": mailbox, "threads": threads }))
        }
        CliCommand::ListThread(cmd) => {
            let mailbox = mailbox_for(&config, &cmd.mailbox);
            let tree = rt.block_on(thread_tree(&store, &mailbox, &cmd.message_id))?;
            output_ok(json!({ "mailbox": mailbox, "thread": tree_to_json(&tree) }))
        }
        CliCommand::ExportAm(cmd) => {
            let mailbox = mailbox_for(&config, &cmd.mailbox);
            let entries = rt.block_on(async {
                let tree = thread_tree(&store, &mailbox, &cmd.message_id).await?;
                anyhow::Ok(store.export_series(&tree).await?)
            })?;
            if entries.is_empty() {
                return Err(anyhow!("thread {} carries no patches", cmd.message_id));
            }
            info!(count = entries.len(), root = %cmd.message_id, "exporting patch series");
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            write_mbox(&mut out, &entries)?;
            out.flush()?;
            Ok(())
        }
    }
}

async fn open_store(db_path: &str) -> Result<SqliteMailStore> {
    let store = SqliteMailStore::connect(db_path)
        .await
        .with_context(|| format!("opening store {}", db_path))?;
    store.init().await?;
    Ok(store)
}

async fn fetch_imap(store: Arc<SqliteMailStore>, imap: ImapConfig) -> Result<FetchReport> {
    store.create_mailbox(&imap.mailbox).await?;
    let mut source = ImapSource::from_config(imap);
    let result = source.fetch(store).await;
    source.close().await;
    Ok(result?)
}

async fn fetch_archive(store: Arc<SqliteMailStore>, archive: &ArchiveConfig) -> Result<FetchReport> {
    let mut source = ArchiveSource::connect(archive)
        .with_context(|| format!("opening archive {}", archive.path.display()))?;
    Ok(source.fetch(store).await?)
}

fn archive_config(config: &MirrorConfig, path: Option<PathBuf>) -> Result<ArchiveConfig> {
    match (config.archive.clone(), path) {
        (Some(mut archive), Some(path)) => {
            archive.path = path;
            Ok(archive)
        }
        (Some(archive), None) => Ok(archive),
        (None, Some(path)) => Ok(ArchiveConfig {
            path,
            duplicate_limit: DEFAULT_DUPLICATE_LIMIT,
        }),
        (None, None) => Err(anyhow!("missing [archive] section in config (or pass --path)")),
    }
}

fn mailbox_for(config: &MirrorConfig, arg: &MailboxArg) -> String {
    arg.mailbox
        .clone()
        .unwrap_or_else(|| config.default_mailbox().to_string())
}

/// Accepts a message-id with or without its angle brackets.
fn root_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        trimmed.to_string()
    } else {
        format!("<{}>", trimmed)
    }
}

async fn thread_tree(store: &SqliteMailStore, mailbox: &str, message_id: &str) -> Result<MessageTree> {
    let message_id = root_id(message_id);
    let root = store
        .find_root(mailbox, &message_id)
        .await?
        .ok_or_else(|| anyhow!("no thread rooted at {} in {}", message_id, mailbox))?;
    Ok(store.get_tree(root).await?)
}

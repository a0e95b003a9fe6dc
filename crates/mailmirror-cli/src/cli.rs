use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use super::CLI_SCHEMA_VERSION;

#[path = "cli_command_handlers.rs"]
mod cli_command_handlers;
#[path = "cli_config.rs"]
mod cli_config;
#[path = "cli_runtime_helpers.rs"]
mod cli_runtime_helpers;

pub(crate) use cli_command_handlers::run_cli;
pub(crate) use cli_config::{MirrorConfig, load_mirror_config};
pub(crate) use cli_runtime_helpers::{
    output_error, output_ok, report_to_json, summary_to_json, tree_to_json,
};

#[derive(Parser, Debug)]
#[command(
    name = "mailmirror",
    version,
    about = "Mirror mailing lists into a local SQLite store"
)]
pub(crate) struct Cli {
    /// Config file to use instead of the default lookup.
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,
    /// Database file, overriding `db_path` from the config.
    #[arg(long, global = true)]
    pub(crate) db: Option<String>,
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Run one fetch cycle against the configured IMAP mailbox.
    Fetch,
    /// Walk a public-inbox archive into the store.
    FetchArchive(FetchArchiveCmd),
    /// Message count and mailbox memberships.
    Status,
    /// Roots of every thread in a mailbox.
    ListThreads(MailboxArg),
    /// One thread as an indented reply tree.
    ListThread(ThreadCmd),
    /// The patch series of a thread as an mbox for `git am`.
    ExportAm(ThreadCmd),
}

#[derive(Args, Debug)]
pub(crate) struct FetchArchiveCmd {
    /// public-inbox directory, overriding `[archive].path`.
    #[arg(long)]
    pub(crate) path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub(crate) struct MailboxArg {
    /// Defaults to the configured IMAP mailbox.
    #[arg(long)]
    pub(crate) mailbox: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct ThreadCmd {
    /// Message-id of the thread root, angle brackets included.
    pub(crate) message_id: String,
    #[command(flatten)]
    pub(crate) mailbox: MailboxArg,
}

//! public-inbox git archives.
//!
//! An archive directory holds epoch repositories under `git/N.git`. Every
//! commit carries one message as the blob `m` at the root of its tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use git2::{ErrorCode, Repository, Sort};
use mailmirror_core::MessageStore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{FetchError, FetchReport, MessageSource};

/// Consecutive already-stored messages after which a walk stops.
pub const DEFAULT_DUPLICATE_LIMIT: usize = 100;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);
const ARCHIVE_QUEUE_CAPACITY: usize = 32;
const MESSAGE_BLOB: &str = "m";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub path: PathBuf,
    /// 0 walks the whole archive.
    #[serde(default = "default_duplicate_limit")]
    pub duplicate_limit: usize,
}

fn default_duplicate_limit() -> usize {
    DEFAULT_DUPLICATE_LIMIT
}

pub struct ArchiveSource {
    git_dir: PathBuf,
    duplicate_limit: usize,
}

impl ArchiveSource {
    pub fn connect(config: &ArchiveConfig) -> Result<Self, FetchError> {
        let git_dir = config.path.join("git");
        if !git_dir.is_dir() {
            return Err(FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a public-inbox archive", config.path.display()),
            )));
        }
        Ok(Self {
            git_dir,
            duplicate_limit: config.duplicate_limit,
        })
    }

    /// Epoch repositories, newest first.
    pub fn epochs(&self) -> Result<Vec<PathBuf>, FetchError> {
        let mut epochs = Vec::new();
        for entry in std::fs::read_dir(&self.git_dir)? {
            let path = entry?.path();
            let epoch = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".git"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(epoch) = epoch {
                epochs.push((epoch, path));
            }
        }
        epochs.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(epochs.into_iter().map(|(_, path)| path).collect())
    }
}

#[async_trait]
impl MessageSource for ArchiveSource {
    async fn fetch(&mut self, store: Arc<dyn MessageStore>) -> Result<FetchReport, FetchError> {
        let epochs = self.epochs()?;
        info!(archive = %self.git_dir.display(), epochs = epochs.len(), "walking archive");
        let (tx, rx) = mpsc::channel(ARCHIVE_QUEUE_CAPACITY);
        let walker = tokio::task::spawn_blocking(move || walk_epochs(&epochs, &tx));
        let report = ingest(rx, store.as_ref(), self.duplicate_limit).await;
        walker
            .await
            .map_err(|err| FetchError::Aborted(format!("archive walk failed: {}", err)))?;
        report
    }
}

type RawMessage = Result<Vec<u8>, FetchError>;

fn walk_epochs(epochs: &[PathBuf], tx: &mpsc::Sender<RawMessage>) {
    for epoch in epochs {
        match walk_epoch(epoch, tx) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                let _ = tx.blocking_send(Err(err));
                return;
            }
        }
    }
}

/// Sends every message of one epoch, newest first. Returns false once the
/// receiver has gone away.
fn walk_epoch(path: &Path, tx: &mpsc::Sender<RawMessage>) -> Result<bool, FetchError> {
    debug!(epoch = %path.display(), "walking epoch");
    let repo = Repository::open(path)?;
    let mut revwalk = repo.revwalk()?;
    match revwalk.push_head() {
        Ok(()) => {}
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            debug!(epoch = %path.display(), "epoch has no commits");
            return Ok(true);
        }
        Err(err) => return Err(err.into()),
    }
    revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

    for oid in revwalk {
        let commit = repo.find_commit(oid?)?;
        let Some(raw) = message_blob(&repo, &commit)? else {
            continue;
        };
        if tx.blocking_send(Ok(raw)).is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn message_blob(repo: &Repository, commit: &git2::Commit<'_>) -> Result<Option<Vec<u8>>, git2::Error> {
    let tree = commit.tree()?;
    // Commits removing a message carry no `m` blob.
    let Some(entry) = tree.get_name(MESSAGE_BLOB) else {
        return Ok(None);
    };
    let blob = entry.to_object(repo)?.peel_to_blob()?;
    Ok(Some(blob.content().to_vec()))
}

async fn ingest(
    mut messages: mpsc::Receiver<RawMessage>,
    store: &dyn MessageStore,
    duplicate_limit: usize,
) -> Result<FetchReport, FetchError> {
    let mut report = FetchReport::default();
    let mut duplicates_in_a_row = 0usize;
    let mut last_progress = Instant::now();

    while let Some(raw) = messages.recv().await {
        let raw = raw?;
        match store.add_message(&raw).await {
            Ok(_) => {
                report.stored += 1;
                duplicates_in_a_row = 0;
            }
            Err(err) if err.is_already_present() => {
                report.skipped += 1;
                duplicates_in_a_row += 1;
                if duplicate_limit > 0 && duplicates_in_a_row >= duplicate_limit {
                    info!(duplicates_in_a_row, "archive already mirrored from here on, stopping");
                    break;
                }
            }
            Err(err) if err.is_parse() => {
                debug!(error = %err, "skipping unparseable archive message");
                report.skipped += 1;
            }
            Err(err) => return Err(err.into()),
        }
        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            info!(stored = report.stored, skipped = report.skipped, "archive walk progress");
            last_progress = Instant::now();
        }
    }

    info!(stored = report.stored, skipped = report.skipped, "archive walk complete");
    Ok(report)
}

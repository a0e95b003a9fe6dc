//! One fetch cycle over a gated session.
//!
//! Envelopes are requested in fixed strides. Each batch checks its
//! message-ids against the store and schedules body fetches for the missing
//! ones. Bodies complete in any order and report back on a bounded status
//! queue; the cycle is done once every batch and every body has reported.

use std::sync::Arc;

use mailmirror_core::MessageStore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::gate::{FetchKind, GateHandle, GateReply, RemoteItem, wait_done};
use crate::{BodyFailure, FetchError, FetchReport, SessionError};

/// Envelopes requested per batch unless configured otherwise.
pub const ENVELOPE_STRIDE: u32 = 50;
const BATCH_QUEUE_CAPACITY: usize = 1;
const BODY_STATUS_QUEUE_CAPACITY: usize = 16;

pub(crate) struct PipelineOutcome {
    pub(crate) report: FetchReport,
    /// Every message-id the envelopes listed, stored or not.
    pub(crate) message_ids: Vec<String>,
}

struct Wanted {
    seq: u32,
    message_id: String,
}

enum BodyOutcome {
    Stored,
    AlreadyPresent,
}

struct BodyStatus {
    wanted: Wanted,
    result: Result<BodyOutcome, FetchError>,
}

#[derive(Default)]
struct BatchSummary {
    message_ids: Vec<String>,
    present: usize,
}

impl BatchSummary {
    fn absorb(&mut self, other: BatchSummary) {
        self.message_ids.extend(other.message_ids);
        self.present += other.present;
    }
}

type BatchTask = JoinHandle<Result<BatchSummary, FetchError>>;

pub(crate) struct FetchPipeline {
    store: Arc<dyn MessageStore>,
    gate: GateHandle,
    stride: u32,
}

impl FetchPipeline {
    pub(crate) fn new(store: Arc<dyn MessageStore>, gate: GateHandle, stride: u32) -> Self {
        Self {
            store,
            gate,
            stride: stride.max(1),
        }
    }

    /// Runs the cycle for a mailbox holding `message_count` messages.
    pub(crate) async fn run(self, message_count: u32) -> Result<PipelineOutcome, FetchError> {
        let FetchPipeline {
            store,
            gate,
            stride,
        } = self;
        let (status_tx, mut status_rx) = mpsc::channel::<BodyStatus>(BODY_STATUS_QUEUE_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel::<BatchTask>(BATCH_QUEUE_CAPACITY);
        let (summary_tx, summary_rx) = oneshot::channel();

        tokio::spawn(coordinate_batches(batch_rx, status_tx.clone(), summary_tx));
        tokio::spawn(schedule_envelope_batches(
            message_count,
            stride,
            gate,
            store,
            status_tx,
            batch_tx,
        ));

        let mut report = FetchReport::default();
        while let Some(BodyStatus { wanted, result }) = status_rx.recv().await {
            match result {
                Ok(BodyOutcome::Stored) => report.stored += 1,
                Ok(BodyOutcome::AlreadyPresent) => report.skipped += 1,
                Err(err) if err.is_cycle_fatal() => {
                    error!(seq = wanted.seq, message_id = %wanted.message_id, error = %err, "body fetch hit a session failure");
                    return Err(err);
                }
                Err(err) => {
                    warn!(seq = wanted.seq, message_id = %wanted.message_id, error = %err, "body fetch failed");
                    report.failures.push(BodyFailure {
                        seq: wanted.seq,
                        message_id: wanted.message_id,
                        error: err,
                    });
                }
            }
        }

        let summary = summary_rx
            .await
            .map_err(|_| FetchError::Aborted("batch coordinator exited".to_string()))??;
        report.skipped += summary.present;
        Ok(PipelineOutcome {
            report,
            message_ids: summary.message_ids,
        })
    }
}

async fn schedule_envelope_batches(
    message_count: u32,
    stride: u32,
    gate: GateHandle,
    store: Arc<dyn MessageStore>,
    status_tx: mpsc::Sender<BodyStatus>,
    batch_tx: mpsc::Sender<BatchTask>,
) {
    let mut first = 1u32;
    while first <= message_count {
        if gate.is_poisoned() {
            debug!(first, "session failed, no further envelope batches");
            break;
        }
        let last = first.saturating_add(stride - 1).min(message_count);
        debug!(first, last, "requesting envelopes");
        let request = gate.submit(FetchKind::Envelopes { first, last }).await;
        let failed = request.is_err();
        let batch = tokio::spawn(process_envelope_batch(
            request,
            gate.clone(),
            store.clone(),
            status_tx.clone(),
        ));
        if batch_tx.send(batch).await.is_err() || failed {
            break;
        }
        match last.checked_add(1) {
            Some(next) => first = next,
            None => break,
        }
    }
}

async fn process_envelope_batch(
    request: Result<GateReply, SessionError>,
    gate: GateHandle,
    store: Arc<dyn MessageStore>,
    status_tx: mpsc::Sender<BodyStatus>,
) -> Result<BatchSummary, FetchError> {
    let GateReply { mut items, done } = request?;
    let mut summary = BatchSummary::default();
    while let Some(envelope) = items.recv().await {
        let Some(message_id) = envelope.message_id else {
            warn!(seq = envelope.seq, "envelope has no message-id, skipping");
            continue;
        };
        summary.message_ids.push(message_id.clone());
        match store.is_present(&message_id).await {
            Ok(true) => {
                summary.present += 1;
                continue;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(%message_id, error = %err, "presence check failed, fetching body anyway");
            }
        }
        let wanted = Wanted {
            seq: envelope.seq,
            message_id,
        };
        // Submitted here so body requests reach the gate in envelope order.
        let body = gate.submit(FetchKind::Body { seq: wanted.seq }).await;
        tokio::spawn(complete_body(body, wanted, store.clone(), status_tx.clone()));
    }
    wait_done(done).await?;
    Ok(summary)
}

async fn complete_body(
    request: Result<GateReply, SessionError>,
    wanted: Wanted,
    store: Arc<dyn MessageStore>,
    status_tx: mpsc::Sender<BodyStatus>,
) {
    let result = store_body(request, &wanted, store.as_ref()).await;
    let _ = status_tx.send(BodyStatus { wanted, result }).await;
}

async fn store_body(
    request: Result<GateReply, SessionError>,
    wanted: &Wanted,
    store: &dyn MessageStore,
) -> Result<BodyOutcome, FetchError> {
    let items = request?.collect().await?;
    let item = pick_body_item(items, wanted.seq)?;
    let got = item.message_id.unwrap_or_default();
    if got != wanted.message_id {
        return Err(FetchError::MessageIdMismatch {
            seq: wanted.seq,
            wanted: wanted.message_id.clone(),
            got,
        });
    }
    let body = item
        .body
        .ok_or(FetchError::MissingBody { seq: wanted.seq })?;
    match store.add_message(&body).await {
        Ok(_) => Ok(BodyOutcome::Stored),
        Err(err) if err.is_already_present() => Ok(BodyOutcome::AlreadyPresent),
        Err(err) => Err(err.into()),
    }
}

/// Finds the response for `seq` among the items of a body request. Items for
/// other messages without a body are unsolicited updates and are skipped;
/// a body under another sequence number is a desync.
fn pick_body_item(items: Vec<RemoteItem>, seq: u32) -> Result<RemoteItem, FetchError> {
    let mut bodiless = None;
    let mut stray = None;
    for item in items {
        match (item.seq == seq, item.body.is_some()) {
            (true, true) => return Ok(item),
            (true, false) => {
                bodiless.get_or_insert(item);
            }
            (false, true) => {
                stray.get_or_insert(item.seq);
            }
            (false, false) => debug!(seq, other = item.seq, "ignoring unsolicited item"),
        }
    }
    match (bodiless, stray) {
        (Some(item), _) => Ok(item),
        (None, Some(got)) => Err(FetchError::SequenceMismatch { wanted: seq, got }),
        (None, None) => Err(FetchError::MissingBody { seq }),
    }
}

async fn coordinate_batches(
    mut batches: mpsc::Receiver<BatchTask>,
    status_tx: mpsc::Sender<BodyStatus>,
    summary_tx: oneshot::Sender<Result<BatchSummary, FetchError>>,
) {
    let mut all = BatchSummary::default();
    let mut failure = None;
    while let Some(batch) = batches.recv().await {
        match batch.await {
            Ok(Ok(summary)) => all.absorb(summary),
            Ok(Err(err)) => {
                failure.get_or_insert(err);
            }
            Err(err) => {
                failure.get_or_insert(FetchError::Aborted(err.to_string()));
            }
        }
    }
    // Every batch has spawned its body tasks by now. Once those finish, the
    // status queue closes and the orchestrator stops draining.
    drop(status_tx);
    let _ = summary_tx.send(match failure {
        Some(err) => Err(err),
        None => Ok(all),
    });
}

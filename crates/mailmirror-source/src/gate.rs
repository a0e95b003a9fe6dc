//! Single owner of a remote session that must not be used concurrently.
//!
//! The session lives on one blocking thread that drains a bounded request
//! queue. Every other task talks to it through a [`GateHandle`] and waits on
//! the per-request item queue and completion signal.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::SessionError;

pub(crate) const GATE_QUEUE_CAPACITY: usize = 10;
const BODY_ITEM_CAPACITY: usize = 4;

/// A fetch addressed by message sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// Envelopes for the inclusive range `first..=last`.
    Envelopes { first: u32, last: u32 },
    /// Envelope and full body of one message, without setting `\Seen`.
    Body { seq: u32 },
}

impl FetchKind {
    fn covers(&self, seq: u32) -> bool {
        match *self {
            FetchKind::Envelopes { first, last } => (first..=last).contains(&seq),
            FetchKind::Body { .. } => true,
        }
    }

    fn item_capacity(&self) -> usize {
        match *self {
            FetchKind::Envelopes { first, last } => last.saturating_sub(first) as usize + 1,
            FetchKind::Body { .. } => BODY_ITEM_CAPACITY,
        }
    }
}

/// One message in a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub seq: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub body: Option<Vec<u8>>,
}

/// Blocking, single-session remote mailbox, already authenticated and with
/// the mailbox selected.
pub trait RemoteSession: Send + 'static {
    /// Number of messages currently in the selected mailbox.
    fn message_count(&mut self) -> Result<u32, SessionError>;
    fn fetch(&mut self, kind: FetchKind) -> Result<Vec<RemoteItem>, SessionError>;
    fn noop(&mut self) -> Result<(), SessionError>;
    fn logout(&mut self);
}

struct GateRequest {
    kind: FetchKind,
    items: mpsc::Sender<RemoteItem>,
    done: oneshot::Sender<Result<(), SessionError>>,
}

/// Response side of a submitted request. Items arrive first; `done` fires
/// once the session has finished the request.
pub(crate) struct GateReply {
    pub(crate) items: mpsc::Receiver<RemoteItem>,
    pub(crate) done: oneshot::Receiver<Result<(), SessionError>>,
}

impl GateReply {
    pub(crate) async fn collect(self) -> Result<Vec<RemoteItem>, SessionError> {
        let GateReply { mut items, done } = self;
        let mut out = Vec::new();
        while let Some(item) = items.recv().await {
            out.push(item);
        }
        wait_done(done).await?;
        Ok(out)
    }
}

pub(crate) async fn wait_done(
    done: oneshot::Receiver<Result<(), SessionError>>,
) -> Result<(), SessionError> {
    done.await.unwrap_or(Err(SessionError::GateClosed))
}

#[derive(Clone)]
pub(crate) struct GateHandle {
    tx: mpsc::Sender<GateRequest>,
    poisoned: Arc<AtomicBool>,
}

impl GateHandle {
    /// True once a request has failed; later requests are refused.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Queues a request, waiting while the gate's queue is full.
    pub(crate) async fn submit(&self, kind: FetchKind) -> Result<GateReply, SessionError> {
        let (items_tx, items_rx) = mpsc::channel(kind.item_capacity());
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(GateRequest {
                kind,
                items: items_tx,
                done: done_tx,
            })
            .await
            .map_err(|_| SessionError::GateClosed)?;
        Ok(GateReply {
            items: items_rx,
            done: done_rx,
        })
    }
}

/// What the gate hands back once every handle is gone.
pub(crate) struct GateExit<S> {
    pub(crate) session: S,
    pub(crate) poisoned: bool,
    /// Requests answered with [`SessionError::Poisoned`].
    pub(crate) refused: usize,
}

pub(crate) struct SessionGate<S> {
    handle: GateHandle,
    task: JoinHandle<GateExit<S>>,
}

impl<S: RemoteSession> SessionGate<S> {
    pub(crate) fn spawn(session: S) -> Self {
        let (tx, rx) = mpsc::channel(GATE_QUEUE_CAPACITY);
        let poisoned = Arc::new(AtomicBool::new(false));
        let flag = poisoned.clone();
        let task = tokio::task::spawn_blocking(move || run_gate(session, rx, flag));
        Self {
            handle: GateHandle { tx, poisoned },
            task,
        }
    }

    pub(crate) fn handle(&self) -> GateHandle {
        self.handle.clone()
    }

    /// Waits for every outstanding handle to be dropped and returns the
    /// session.
    pub(crate) async fn shutdown(self) -> Result<GateExit<S>, SessionError> {
        drop(self.handle);
        self.task
            .await
            .map_err(|err| SessionError::Remote(format!("session gate failed: {}", err)))
    }
}

fn run_gate<S: RemoteSession>(
    mut session: S,
    mut requests: mpsc::Receiver<GateRequest>,
    flag: Arc<AtomicBool>,
) -> GateExit<S> {
    let mut poisoned = false;
    let mut refused = 0;
    while let Some(GateRequest { kind, items, done }) = requests.blocking_recv() {
        if poisoned {
            refused += 1;
            let _ = done.send(Err(SessionError::Poisoned));
            continue;
        }
        debug!(?kind, "gate: making request");
        match session.fetch(kind) {
            Ok(fetched) => {
                // Envelope queues are sized for one delivery per sequence
                // number, so stray or repeated items are dropped here and the
                // gate never blocks on a batch that is waiting on the gate.
                // Unsolicited FETCH responses (flag updates) carry no
                // message-id and must not claim a sequence number.
                let mut delivered = HashSet::new();
                for item in fetched {
                    if let FetchKind::Envelopes { .. } = kind {
                        if item.message_id.is_none() {
                            debug!(?kind, seq = item.seq, "gate: dropping item without message-id");
                            continue;
                        }
                        if !kind.covers(item.seq) || !delivered.insert(item.seq) {
                            warn!(?kind, seq = item.seq, "gate: dropping unexpected envelope");
                            continue;
                        }
                    }
                    if items.blocking_send(item).is_err() {
                        break;
                    }
                }
                drop(items);
                let _ = done.send(Ok(()));
            }
            Err(err) => {
                warn!(?kind, error = %err, "gate: request failed, refusing further requests");
                poisoned = true;
                flag.store(true, Ordering::Release);
                drop(items);
                let _ = done.send(Err(err));
            }
        }
    }
    debug!(poisoned, refused, "gate: request queue closed");
    GateExit {
        session,
        poisoned,
        refused,
    }
}

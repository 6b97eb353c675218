use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::messaging::message::MessageId;


/// How waiting for the acknowledgement of a message ended
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AckOutcome {
    Acked,
    /// The relay server reported that the message's target has no active session
    Unreachable,
    Timeout,
    /// The session ended before the message was acknowledged
    Closed,
}

struct PendingAck {
    enqueued_at: Instant,
    waiters: Vec<oneshot::Sender<AckOutcome>>,
}

impl PendingAck {
    fn complete(self, outcome: AckOutcome) {
        for waiter in self.waiters {
            // a waiter that gave up in the meantime is not a problem
            let _ = waiter.send(outcome);
        }
    }
}

/// Correlates sent messages with the acknowledgements that arrive for them.
///
/// There is one tracker per session, and message ids are unique per session, so an id can be
///  pending at most once. Lookup is by id in a hash map.
pub struct AckTracker {
    pending: Mutex<FxHashMap<MessageId, PendingAck>>,
}

impl Default for AckTracker {
    fn default() -> Self {
        AckTracker::new()
    }
}

impl AckTracker {
    pub fn new() -> AckTracker {
        AckTracker {
            pending: Default::default(),
        }
    }

    /// Registers a message as awaiting its acknowledgement. The returned handle resolves when the
    ///  ack arrives, or when `window` has elapsed.
    ///
    /// Dropping the handle does not remove the pending entry: a late ack is still consumed, and
    ///  [AckTracker::purge_older_than] cleans up entries that never get one.
    pub async fn track(self: &Arc<Self>, id: MessageId, window: Duration) -> Result<PendingAckHandle, RelayError> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&id) {
            return Err(RelayError::DuplicateMessageId(id));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(id, PendingAck {
            enqueued_at: Instant::now(),
            waiters: vec![tx],
        });
        trace!("tracking {:?}", id);

        Ok(PendingAckHandle {
            id,
            window,
            rx,
            tracker: self.clone(),
        })
    }

    /// Adds another waiter for a message that is already pending. Returns `None` if there is no
    ///  pending entry for the id (it was never tracked, or it completed already).
    pub async fn subscribe(self: &Arc<Self>, id: MessageId, window: Duration) -> Option<PendingAckHandle> {
        let mut pending = self.pending.lock().await;
        let entry = pending.get_mut(&id)?;

        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        Some(PendingAckHandle {
            id,
            window,
            rx,
            tracker: self.clone(),
        })
    }

    /// Completes a pending entry because its ack arrived. Acks for ids that are not pending (late
    ///  or duplicate acks) are ignored, and `false` is returned for them.
    pub async fn resolve(&self, id: MessageId) -> bool {
        self.complete(id, AckOutcome::Acked).await
    }

    /// Completes a pending entry because the relay reported its target as unreachable
    pub async fn reject(&self, id: MessageId) -> bool {
        self.complete(id, AckOutcome::Unreachable).await
    }

    /// Removes a pending entry without an outcome, e.g. because the message could not be sent.
    ///  Its waiters see [AckOutcome::Closed].
    pub async fn forget(&self, id: MessageId) -> bool {
        self.pending.lock().await.remove(&id).is_some()
    }

    async fn expire(&self, id: MessageId) -> bool {
        self.complete(id, AckOutcome::Timeout).await
    }

    async fn complete(&self, id: MessageId, outcome: AckOutcome) -> bool {
        let entry = self.pending.lock().await.remove(&id);
        match entry {
            Some(entry) => {
                trace!("{:?} completed: {:?}", id, outcome);
                entry.complete(outcome);
                true
            }
            None => {
                debug!("{:?} for {:?}, which is not pending - ignoring", outcome, id);
                false
            }
        }
    }

    /// Times out all entries that have been pending for longer than `age`, returning the number
    ///  of entries that were removed.
    pub async fn purge_older_than(&self, age: Duration) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;

        let expired = pending.iter()
            .filter(|(_, p)| now.duration_since(p.enqueued_at) > age)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                entry.complete(AckOutcome::Timeout);
            }
        }
        if !expired.is_empty() {
            debug!("purged {} unacknowledged messages: {:?}", expired.len(), expired);
        }
        expired.len()
    }

    /// Completes all pending entries with [AckOutcome::Closed]. This is called when a session
    ///  ends, acks can not arrive after that.
    pub async fn cancel_all(&self) {
        let drained = std::mem::take(&mut *self.pending.lock().await);
        if !drained.is_empty() {
            debug!("session closed with {} unacknowledged messages", drained.len());
        }
        for (_, entry) in drained {
            entry.complete(AckOutcome::Closed);
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}


/// Awaitable for the acknowledgement of a single message, see [AckTracker::track]
pub struct PendingAckHandle {
    id: MessageId,
    window: Duration,
    rx: oneshot::Receiver<AckOutcome>,
    tracker: Arc<AckTracker>,
}

impl PendingAckHandle {
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Waits for the outcome. If the window elapses first, the pending entry is removed (so a
    ///  late ack is ignored) and the result is [AckOutcome::Timeout].
    ///
    /// A window of zero means 'only if it is acknowledged already', which makes a zero window
    ///  time out deterministically.
    pub async fn wait(mut self) -> AckOutcome {
        if !self.window.is_zero() {
            match time::timeout(self.window, &mut self.rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return AckOutcome::Closed,
                Err(_) => {}
            }
        }

        match self.rx.try_recv() {
            Ok(outcome) => return outcome,
            Err(TryRecvError::Closed) => return AckOutcome::Closed,
            Err(TryRecvError::Empty) => {}
        }

        debug!("no ack for {:?} within {:?}", self.id, self.window);
        self.tracker.expire(self.id).await;
        // the entry may have been completed concurrently, and that outcome wins
        match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Closed) => AckOutcome::Closed,
            Err(TryRecvError::Empty) => AckOutcome::Timeout,
        }
    }
}

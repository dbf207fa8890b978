use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use heating_common::{TriggerKind, TriggerSink};
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, warn};

/// Work items drained serially by the processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Reevaluate,
    RefreshEvents,
}

pub const QUEUE_DEPTH: usize = 32;

#[derive(Clone)]
pub struct RequestQueue {
    sender: mpsc::Sender<Request>,
}

impl RequestQueue {
    pub fn new() -> (Self, mpsc::Receiver<Request>) {
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        (Self { sender }, receiver)
    }

    /// Never blocks. A full queue already holds pending work, and every request
    /// recomputes from current state, so overflow is dropped.
    pub fn request(&self, request: Request) {
        match self.sender.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("request queue full, dropping {request:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("request queue closed, dropping {request:?}");
            }
        }
    }
}

/// Timer-backed [`TriggerSink`]: each trigger is a sleeping task that enqueues
/// a request when it wakes.
pub struct TokioTriggers {
    queue: RequestQueue,
    pending: HashMap<TriggerKind, AbortHandle>,
}

impl TokioTriggers {
    pub fn new(queue: RequestQueue) -> Self {
        Self {
            queue,
            pending: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

impl TriggerSink for TokioTriggers {
    fn schedule(&mut self, kind: TriggerKind, at: DateTime<Utc>) {
        self.cancel(kind);

        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let request = match kind {
            TriggerKind::Event => Request::RefreshEvents,
            TriggerKind::Heating | TriggerKind::Preheat => Request::Reevaluate,
        };
        let queue = self.queue.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("{kind} fired");
            queue.request(request);
        });

        debug!("{kind} set for {at}");
        self.pending.insert(kind, task.abort_handle());
    }

    fn cancel(&mut self, kind: TriggerKind) {
        // Aborting a finished task is a no-op.
        if let Some(handle) = self.pending.remove(&kind) {
            handle.abort();
        }
    }
}

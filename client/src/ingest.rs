//! Push event ingestion.
//!
//! Each event kind has a decision handler that may ignore the event, apply
//! it, or apply a transformed record. Without a handler the decision is the
//! service's `enable_events` option. Accepted events go to the store's event
//! queue; a [`Listener`] task feeds the queue from the transport and flushes
//! debounced batches when their deadline passes.

use crate::service::Service;
use crate::transport::Transport;
use perch_engine::{EventKind, Record, Store};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What to do with an incoming event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ignore,
    Apply,
    /// Apply this record instead of the incoming one
    Replace(Record),
}

impl From<bool> for Decision {
    fn from(apply: bool) -> Self {
        if apply {
            Decision::Apply
        } else {
            Decision::Ignore
        }
    }
}

impl From<(bool, Record)> for Decision {
    fn from((apply, record): (bool, Record)) -> Self {
        if apply {
            Decision::Replace(record)
        } else {
            Decision::Ignore
        }
    }
}

/// Decision handler. Runs with read access to the service's store.
pub type Handler = Arc<dyn Fn(&Record, &Store) -> Decision + Send + Sync>;

/// Per-kind decision handlers.
#[derive(Clone, Default)]
pub struct EventHandlers {
    created: Option<Handler>,
    updated: Option<Handler>,
    patched: Option<Handler>,
    removed: Option<Handler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler for one kind.
    pub fn on<D>(
        mut self,
        kind: EventKind,
        handler: impl Fn(&Record, &Store) -> D + Send + Sync + 'static,
    ) -> Self
    where
        D: Into<Decision>,
    {
        let handler: Handler = Arc::new(move |record, store| handler(record, store).into());
        *self.slot(kind) = Some(handler);
        self
    }

    fn slot(&mut self, kind: EventKind) -> &mut Option<Handler> {
        match kind {
            EventKind::Created => &mut self.created,
            EventKind::Updated => &mut self.updated,
            EventKind::Patched => &mut self.patched,
            EventKind::Removed => &mut self.removed,
        }
    }

    fn handler(&self, kind: EventKind) -> Option<&Handler> {
        match kind {
            EventKind::Created => self.created.as_ref(),
            EventKind::Updated => self.updated.as_ref(),
            EventKind::Patched => self.patched.as_ref(),
            EventKind::Removed => self.removed.as_ref(),
        }
    }

    pub fn decide(
        &self,
        kind: EventKind,
        record: &Record,
        store: &Store,
        enable_events: bool,
    ) -> Decision {
        match self.handler(kind) {
            Some(handler) => handler(record, store),
            None => Decision::from(enable_events),
        }
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("created", &self.created.is_some())
            .field("updated", &self.updated.is_some())
            .field("patched", &self.patched.is_some())
            .field("removed", &self.removed.is_some())
            .finish()
    }
}

/// Handle to a running event pump. The pump stops when the handle drops.
#[derive(Debug)]
pub struct Listener {
    handle: JoinHandle<()>,
}

impl Listener {
    pub(crate) fn spawn<T: Transport>(
        service: Service<T>,
        events: broadcast::Receiver<crate::transport::RemoteEvent>,
    ) -> Self {
        Self {
            handle: tokio::spawn(pump(service, events)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// Far enough out that a disabled sleep branch never fires
const IDLE: Duration = Duration::from_secs(3600);

async fn pump<T: Transport>(
    service: Service<T>,
    mut events: broadcast::Receiver<crate::transport::RemoteEvent>,
) {
    tracing::debug!(service = %service.name(), "event pump started");

    loop {
        let deadline = service.next_event_deadline();
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + IDLE);

        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if let Err(e) = service.handle_event(event.kind, event.record) {
                        tracing::warn!(service = %service.name(), kind = %event.kind, "Dropped event: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(service = %service.name(), skipped, "Event subscription lagged");
                }
                Err(RecvError::Closed) => {
                    service.flush_events();
                    break;
                }
            },
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                service.flush_due();
            }
            _ = service.woken() => {}
        }
    }

    tracing::debug!(service = %service.name(), "event pump stopped");
}

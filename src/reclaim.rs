//! Lazy reclamation of server-side statements and portals.
//!
//! When the last client handle to a named prepared statement or portal is
//! dropped, the backend must still be told to forget the object. Drop impls
//! push the server-side name into an unbounded channel; the executor drains
//! it at safe points and emits `Close` messages, which the backend answers
//! with `CloseComplete` (silently consumed by the demultiplexer).
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Sending half handed to every named statement or portal.
pub(crate) type ReclaimSender = UnboundedSender<String>;

/// One registry of dead server-side names.
///
/// Two instances exist per connection: one for statements, one for portals.
pub(crate) struct ReclaimQueue {
    tx: ReclaimSender,
    rx: UnboundedReceiver<String>,
}

impl ReclaimQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> ReclaimSender {
        self.tx.clone()
    }

    /// Pop one dead name, never blocking.
    pub fn try_next(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

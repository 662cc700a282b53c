//! Server-side result cursors.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{query::SimpleQuery, reclaim::ReclaimSender};

/// A named server-side cursor bound from a prepared statement.
///
/// A portal retains its statement: the backend closes all dependent portals
/// when a statement is closed, so the statement must not be reclaimed while
/// any of its portals is still referenced.
///
/// The executor closes a portal once its Execute completes without
/// suspension; dropping the last handle of a still-open portal enqueues its
/// name for reclamation instead.
#[derive(Clone)]
pub struct Portal {
    inner: Arc<PortalInner>,
}

struct PortalInner {
    query: SimpleQuery,
    name: String,
    /// Whether the backend acknowledged the Bind.
    registered: AtomicBool,
    closed: AtomicBool,
    reclaim: ReclaimSender,
}

impl Portal {
    pub(crate) fn new(query: SimpleQuery, name: String, reclaim: ReclaimSender) -> Self {
        Self {
            inner: Arc::new(PortalInner {
                query,
                name,
                registered: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reclaim,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn query(&self) -> &SimpleQuery {
        &self.inner.query
    }

    /// Mark the Bind as acknowledged by the backend.
    pub(crate) fn register(&self) {
        self.inner.registered.store(true, Ordering::Relaxed);
    }

    /// Enqueue this portal for an explicit Close at the next safe point.
    pub(crate) fn close(&self) {
        self.inner.enqueue_close();
    }
}

impl PortalInner {
    fn enqueue_close(&self) {
        if self.registered.load(Ordering::Relaxed) && !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.reclaim.send(self.name.clone());
        }
    }
}

impl Drop for PortalInner {
    fn drop(&mut self) {
        self.enqueue_close();
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_tuple("Portal").field(&self.inner.name).finish()
    }
}

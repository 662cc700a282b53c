//! Query handles produced by the statement scanner.
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    params::ParameterList,
    postgres::{Oid, UNSPECIFIED, backend::Field},
    reclaim::ReclaimSender,
};

/// An opaque parsed query: a single statement or an ordered list of them.
///
/// Created by [`QueryExecutor::create_simple_query`][1] or
/// [`create_parameterized_query`][2], mutated only by the executor.
///
/// [1]: crate::QueryExecutor::create_simple_query
/// [2]: crate::QueryExecutor::create_parameterized_query
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) kind: QueryKind,
}

#[derive(Debug, Clone)]
pub(crate) enum QueryKind {
    Simple(SimpleQuery),
    Composite {
        subqueries: Vec<SimpleQuery>,
        /// Maps each subquery to its first slot in the caller's flat
        /// parameter list.
        offsets: Vec<usize>,
    },
}

impl Query {
    pub(crate) fn simple(query: SimpleQuery) -> Self {
        Self { kind: QueryKind::Simple(query) }
    }

    pub(crate) fn composite(subqueries: Vec<SimpleQuery>, offsets: Vec<usize>) -> Self {
        Self { kind: QueryKind::Composite { subqueries, offsets } }
    }

    /// Total number of `?` placeholders across all statements.
    pub fn parameter_count(&self) -> usize {
        match &self.kind {
            QueryKind::Simple(q) => q.parameter_count(),
            QueryKind::Composite { subqueries, .. } => {
                subqueries.iter().map(SimpleQuery::parameter_count).sum()
            }
        }
    }

    /// A parameter list sized for this query, all slots unset.
    pub fn create_parameter_list(&self) -> ParameterList {
        ParameterList::new(self.parameter_count())
    }

    /// Whether this is the sentinel produced by scanning an empty string.
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            QueryKind::Simple(q) => q.inner.fragments == [""],
            QueryKind::Composite { .. } => false,
        }
    }
}

/// A single statement: text fragments separated by parameter placeholders,
/// plus the server-side prepared statement it may be bound to.
///
/// Handles are cheap to clone and share one prepared state. Dropping the
/// last handle of a statement that is still prepared server-side enqueues
/// its name for reclamation.
#[derive(Clone)]
pub struct SimpleQuery {
    inner: Arc<StatementInner>,
}

struct StatementInner {
    fragments: Vec<String>,
    state: Mutex<PreparedState>,
    reclaim: ReclaimSender,
}

#[derive(Default)]
struct PreparedState {
    /// Assigned server-side statement name, `None` for unnamed/unprepared.
    name: Option<String>,
    /// Parameter type OIDs recorded when the Parse was sent.
    oids: Option<Vec<Oid>>,
    /// Row description, once known.
    fields: Option<Arc<[Field]>>,
    statement_described: bool,
    portal_described: bool,
    /// Whether the backend acknowledged the Parse. Only acknowledged
    /// statements are reclaimed; a failed Parse never allocated anything.
    registered: bool,
}

impl SimpleQuery {
    pub(crate) fn new(fragments: Vec<String>, reclaim: ReclaimSender) -> Self {
        Self {
            inner: Arc::new(StatementInner {
                fragments,
                state: Mutex::new(PreparedState::default()),
                reclaim,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PreparedState> {
        self.inner.state.lock().expect("query state poisoned")
    }

    pub fn fragments(&self) -> &[String] {
        &self.inner.fragments
    }

    pub fn parameter_count(&self) -> usize {
        self.inner.fragments.len() - 1
    }

    /// The statement rendered with `$1..$n` placeholders between fragments.
    pub fn native_sql(&self) -> String {
        let fragments = &self.inner.fragments;
        let mut sql = String::with_capacity(
            fragments.iter().map(String::len).sum::<usize>() + fragments.len() * 3,
        );
        let mut n = itoa::Buffer::new();
        for (i, fragment) in fragments.iter().enumerate() {
            if i != 0 {
                sql.push('$');
                sql.push_str(n.format(i));
            }
            sql.push_str(fragment);
        }
        sql
    }

    pub fn statement_name(&self) -> Option<String> {
        self.state().name.clone()
    }

    /// Whether a Parse can be skipped: the statement is named and every
    /// current OID matches the recorded one. An UNSPECIFIED current OID
    /// matches anything, since the backend inferred (or will infer) the type.
    pub(crate) fn is_prepared_for(&self, oids: &[Oid]) -> bool {
        let state = self.state();
        if state.name.is_none() {
            return false;
        }
        match &state.oids {
            Some(recorded) => {
                recorded.len() == oids.len()
                    && recorded
                        .iter()
                        .zip(oids)
                        .all(|(rec, cur)| *cur == UNSPECIFIED || rec == cur)
            }
            None => false,
        }
    }

    pub(crate) fn set_prepared(&self, name: String, oids: Vec<Oid>) {
        let mut state = self.state();
        state.name = Some(name);
        state.oids = Some(oids);
    }

    /// Forget the server-side statement. If it was acknowledged by the
    /// backend, enqueue its name so a Close is eventually sent.
    pub(crate) fn unprepare(&self) {
        let mut state = self.state();
        if let Some(name) = state.name.take()
            && state.registered
        {
            let _ = self.inner.reclaim.send(name);
        }
        state.oids = None;
        state.fields = None;
        state.statement_described = false;
        state.portal_described = false;
        state.registered = false;
    }

    /// Mark the Parse as acknowledged by the backend.
    pub(crate) fn register_parsed(&self) {
        self.state().registered = true;
    }

    pub(crate) fn has_unresolved_types(&self) -> bool {
        match &self.state().oids {
            Some(oids) => oids.iter().any(|oid| *oid == UNSPECIFIED),
            None => true,
        }
    }

    pub(crate) fn statement_oids(&self) -> Option<Vec<Oid>> {
        self.state().oids.clone()
    }

    pub(crate) fn set_statement_oids(&self, oids: Vec<Oid>) {
        self.state().oids = Some(oids);
    }

    pub fn fields(&self) -> Option<Arc<[Field]>> {
        self.state().fields.clone()
    }

    pub(crate) fn set_fields(&self, fields: Arc<[Field]>) {
        self.state().fields = Some(fields);
    }

    pub(crate) fn is_statement_described(&self) -> bool {
        self.state().statement_described
    }

    pub(crate) fn set_statement_described(&self) {
        self.state().statement_described = true;
    }

    pub(crate) fn is_portal_described(&self) -> bool {
        self.state().portal_described
    }

    pub(crate) fn set_portal_described(&self) {
        self.state().portal_described = true;
    }
}

impl Drop for StatementInner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut()
            && state.registered
            && let Some(name) = state.name.take()
        {
            let _ = self.reclaim.send(name);
        }
    }
}

impl std::fmt::Debug for SimpleQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SimpleQuery")
            .field("fragments", &self.inner.fragments)
            .field("name", &self.state().name)
            .finish_non_exhaustive()
    }
}

//! Result delivery: the [`ResultHandler`] capability set and execute flags.
use bytes::Bytes;
use std::sync::Arc;

use crate::{
    Error, Result, SqlState,
    portal::Portal,
    postgres::{ServerError, backend::Field},
    query::SimpleQuery,
};

/// One result row: column values in wire order, `None` for NULL.
pub type Tuple = Vec<Option<Bytes>>;

bitflags::bitflags! {
    /// Flags a caller may OR together for [`execute`][crate::QueryExecutor::execute].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u16 {
        /// Discard rows; the row-count limit is forced to one.
        const NO_RESULTS = 0x01;
        /// Skip portal describe, no row metadata is requested.
        const NO_METADATA = 0x02;
        /// Page through a named portal instead of fetching everything.
        const FORWARD_CURSOR = 0x04;
        /// Do not allocate a server-side statement name.
        const ONESHOT = 0x08;
        /// Stop after Describe, nothing is bound or executed.
        const DESCRIBE_ONLY = 0x10;
        /// Do not open an implicit transaction.
        const SUPPRESS_BEGIN = 0x20;
        /// Sync after every statement instead of batching.
        const DISALLOW_BATCHING = 0x40;
        /// Emit both the row batch and the command status for one command.
        const BOTH_ROWS_AND_STATUS = 0x80;
    }
}

/// Callbacks a query result is pushed through.
///
/// Several errors can surface within one Sync window; `handle_error` may be
/// invoked multiple times and implementations must collect, not replace.
pub trait ResultHandler {
    /// A batch of rows. `cursor` is the portal to continue from when the
    /// execute suspended, `None` when the command ran to completion.
    fn handle_result_rows(
        &mut self,
        query: &SimpleQuery,
        fields: Option<Arc<[Field]>>,
        tuples: Vec<Tuple>,
        cursor: Option<Portal>,
    );

    /// A completed command without rows (or alongside them, with
    /// [`BOTH_ROWS_AND_STATUS`][QueryFlags::BOTH_ROWS_AND_STATUS]).
    fn handle_command_status(&mut self, status: &str, update_count: u64, insert_oid: u64);

    fn handle_warning(&mut self, warning: ServerError);

    fn handle_error(&mut self, error: Error);

    /// Called exactly once when the whole operation has drained.
    fn handle_completion(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Delegates everything, remembering whether an error went by. Batching
/// decisions consult this to stop sending after a failure.
pub(crate) struct ErrorTracking<'a> {
    pub delegate: &'a mut dyn ResultHandler,
    pub saw_error: bool,
}

impl<'a> ErrorTracking<'a> {
    pub fn new(delegate: &'a mut dyn ResultHandler) -> Self {
        Self { delegate, saw_error: false }
    }
}

impl ResultHandler for ErrorTracking<'_> {
    fn handle_result_rows(
        &mut self,
        query: &SimpleQuery,
        fields: Option<Arc<[Field]>>,
        tuples: Vec<Tuple>,
        cursor: Option<Portal>,
    ) {
        self.delegate.handle_result_rows(query, fields, tuples, cursor);
    }

    fn handle_command_status(&mut self, status: &str, update_count: u64, insert_oid: u64) {
        self.delegate.handle_command_status(status, update_count, insert_oid);
    }

    fn handle_warning(&mut self, warning: ServerError) {
        self.delegate.handle_warning(warning);
    }

    fn handle_error(&mut self, error: Error) {
        self.saw_error = true;
        self.delegate.handle_error(error);
    }

    fn handle_completion(&mut self) -> Result<()> {
        self.delegate.handle_completion()
    }
}

/// Intercepts the implicit `BEGIN` sent ahead of a query: its command
/// status must read `BEGIN`, and nothing of it reaches the delegate.
pub(crate) struct BeginShim<'a> {
    pub delegate: &'a mut dyn ResultHandler,
    saw_begin: bool,
}

impl<'a> BeginShim<'a> {
    pub fn new(delegate: &'a mut dyn ResultHandler) -> Self {
        Self { delegate, saw_begin: false }
    }
}

impl ResultHandler for BeginShim<'_> {
    fn handle_result_rows(
        &mut self,
        query: &SimpleQuery,
        fields: Option<Arc<[Field]>>,
        tuples: Vec<Tuple>,
        cursor: Option<Portal>,
    ) {
        if self.saw_begin {
            self.delegate.handle_result_rows(query, fields, tuples, cursor);
        }
    }

    fn handle_command_status(&mut self, status: &str, update_count: u64, insert_oid: u64) {
        if !self.saw_begin {
            self.saw_begin = true;
            if status != "BEGIN" {
                self.handle_error(Error::driver(
                    SqlState::ProtocolViolation,
                    format!("expected command status BEGIN, got {status}"),
                ));
            }
        } else {
            self.delegate.handle_command_status(status, update_count, insert_oid);
        }
    }

    fn handle_warning(&mut self, warning: ServerError) {
        self.delegate.handle_warning(warning);
    }

    fn handle_error(&mut self, error: Error) {
        self.delegate.handle_error(error);
    }

    fn handle_completion(&mut self) -> Result<()> {
        self.delegate.handle_completion()
    }
}

/// Turns a bare command status into an empty row batch: a fetch on an
/// exhausted portal yields just a CommandComplete.
pub(crate) struct FetchShim<'a> {
    pub delegate: &'a mut dyn ResultHandler,
    pub portal: &'a Portal,
}

impl ResultHandler for FetchShim<'_> {
    fn handle_result_rows(
        &mut self,
        query: &SimpleQuery,
        fields: Option<Arc<[Field]>>,
        tuples: Vec<Tuple>,
        cursor: Option<Portal>,
    ) {
        self.delegate.handle_result_rows(query, fields, tuples, cursor);
    }

    fn handle_command_status(&mut self, _status: &str, _update_count: u64, _insert_oid: u64) {
        self.delegate
            .handle_result_rows(self.portal.query(), None, Vec::new(), None);
    }

    fn handle_warning(&mut self, warning: ServerError) {
        self.delegate.handle_warning(warning);
    }

    fn handle_error(&mut self, error: Error) {
        self.delegate.handle_error(error);
    }

    fn handle_completion(&mut self) -> Result<()> {
        self.delegate.handle_completion()
    }
}

/// Collector for the `BEGIN` issued before fastpath and COPY calls.
///
/// Warnings are treated as errors here: they are not expected on a bare
/// BEGIN and there is no surface to report them through.
#[derive(Default)]
pub(crate) struct SubprotocolBegin {
    saw_begin: bool,
    error: Option<Error>,
}

impl SubprotocolBegin {
    pub fn finish(self) -> Result<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ResultHandler for SubprotocolBegin {
    fn handle_result_rows(
        &mut self,
        _query: &SimpleQuery,
        _fields: Option<Arc<[Field]>>,
        _tuples: Vec<Tuple>,
        _cursor: Option<Portal>,
    ) {
    }

    fn handle_command_status(&mut self, status: &str, _update_count: u64, _insert_oid: u64) {
        if !self.saw_begin {
            if status != "BEGIN" {
                self.handle_error(Error::driver(
                    SqlState::ProtocolViolation,
                    format!("expected command status BEGIN, got {status}"),
                ));
            }
            self.saw_begin = true;
        } else {
            self.handle_error(Error::driver(
                SqlState::ProtocolViolation,
                format!("unexpected command status: {status}"),
            ));
        }
    }

    fn handle_warning(&mut self, warning: ServerError) {
        self.handle_error(warning.into());
    }

    fn handle_error(&mut self, error: Error) {
        match &mut self.error {
            Some(first) => first.chain(error),
            None => self.error = Some(error),
        }
    }
}

#[cfg(test)]
pub(crate) mod collect {
    use super::*;

    /// Records every callback for assertions.
    #[derive(Default)]
    pub(crate) struct CollectingHandler {
        pub rows: Vec<RowBatch>,
        pub statuses: Vec<(String, u64, u64)>,
        pub warnings: Vec<ServerError>,
        pub errors: Vec<Error>,
        pub completions: usize,
    }

    pub(crate) struct RowBatch {
        pub fields: Option<Arc<[Field]>>,
        pub tuples: Vec<Tuple>,
        pub cursor: Option<Portal>,
    }

    impl ResultHandler for CollectingHandler {
        fn handle_result_rows(
            &mut self,
            _query: &SimpleQuery,
            fields: Option<Arc<[Field]>>,
            tuples: Vec<Tuple>,
            cursor: Option<Portal>,
        ) {
            self.rows.push(RowBatch { fields, tuples, cursor });
        }

        fn handle_command_status(&mut self, status: &str, update_count: u64, insert_oid: u64) {
            self.statuses.push((status.to_owned(), update_count, insert_oid));
        }

        fn handle_warning(&mut self, warning: ServerError) {
            self.warnings.push(warning);
        }

        fn handle_error(&mut self, error: Error) {
            self.errors.push(error);
        }

        fn handle_completion(&mut self) -> Result<()> {
            self.completions += 1;
            Ok(())
        }
    }
}

//! The extended-query executor.
//!
//! Drives Parse/Bind/Describe/Execute/Sync pipelines over a single duplex
//! stream, demultiplexes the response stream against five pending FIFOs,
//! and owns the COPY and fastpath subprotocols.
use bytes::Bytes;

use crate::{
    Error, Result, SqlState,
    copy::{CopyDirection, CopyOperation},
    handler::{BeginShim, ErrorTracking, FetchShim, QueryFlags, ResultHandler, SubprotocolBegin, Tuple},
    params::{BoundParams, ParameterList},
    portal::Portal,
    postgres::{
        Oid, PgFormat, ServerError,
        backend::{BackendMessage, DataRowError, NotificationResponse, ReadyForQuery},
        frontend,
    },
    query::{Query, QueryKind, SimpleQuery},
    reclaim::ReclaimQueue,
    sql,
    transport::PgTransport,
};

// Deadlock avoidance:
//
// It's possible for the send and receive streams to get "deadlocked" against
// each other since there is no separate reader task. If the server->client
// buffer fills while we are still writing, and the client->server buffer
// then fills too, both sides block on write. To avoid this we guess at how
// many queries can be sent before the server->client buffer is full, force a
// Sync there and read until ReadyForQuery before sending more.
//
// Assume 64k server->client buffering and 250 bytes response per query
// (conservative).
pub(crate) const MAX_BUFFERED_QUERIES: usize = 64000 / 250;

/// Mirror of the server-reported transaction status, updated only on
/// receipt of ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    Open,
    Failed,
}

/// Executor configuration, from a name/value property mapping.
#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Tolerate a non-UTF8 `client_encoding` instead of closing the
    /// connection.
    pub allow_encoding_changes: bool,
}

impl Options {
    pub fn from_properties<'a>(properties: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut me = Self::default();
        for (name, value) in properties {
            if name == "allowEncodingChanges" {
                me.allow_encoding_changes = value.eq_ignore_ascii_case("true");
            }
        }
        me
    }
}

/// Record of one in-flight DescribeStatement.
struct DescribeRecord {
    query: SimpleQuery,
    params: BoundParams,
    describe_only: bool,
    /// Statement name at send time; describe results only bind back into
    /// the query if the name is still current when they arrive.
    name: Option<String>,
}

/// Query executor for the v3 protocol.
///
/// A connection is a serial resource: every entry point takes `&mut self`,
/// so exclusive access is enforced by the borrow. The cooperative lock
/// above that ([`start_copy`][QueryExecutor::start_copy]) covers the
/// multi-call COPY session.
pub struct QueryExecutor<IO> {
    io: IO,

    tx_status: TransactionStatus,
    standard_conforming_strings: bool,
    allow_encoding_changes: bool,
    closed: bool,

    notifications: Vec<NotificationResponse>,
    warnings: Vec<ServerError>,
    cancel: Option<tokio::sync::mpsc::UnboundedSender<()>>,

    next_unique_id: u64,
    /// Statements sent since the last result drain, see
    /// [`MAX_BUFFERED_QUERIES`].
    query_count: usize,
    /// Copy operation currently owning the connection.
    locked_for: Option<u64>,

    pending_parse: Vec<(SimpleQuery, Option<String>)>,
    pending_bind: Vec<Option<Portal>>,
    pending_describe_statement: Vec<DescribeRecord>,
    pending_describe_portal: Vec<SimpleQuery>,
    pending_execute: Vec<(SimpleQuery, Option<Portal>)>,

    dead_statements: ReclaimQueue,
    dead_portals: ReclaimQueue,

    begin_query: SimpleQuery,

    /// CopyOut data staged by the copy demultiplexer.
    copy_data: Option<Bytes>,
    /// Row count reported by the CommandComplete of a copy.
    copy_row_count: Option<u64>,
}

impl<IO: PgTransport> QueryExecutor<IO> {
    pub fn new(io: IO, options: Options) -> Self {
        let dead_statements = ReclaimQueue::new();
        let begin_query = SimpleQuery::new(vec!["BEGIN".into()], dead_statements.sender());
        Self {
            io,
            tx_status: TransactionStatus::Idle,
            standard_conforming_strings: true,
            allow_encoding_changes: options.allow_encoding_changes,
            closed: false,
            notifications: Vec::new(),
            warnings: Vec::new(),
            cancel: None,
            next_unique_id: 1,
            query_count: 0,
            locked_for: None,
            pending_parse: Vec::new(),
            pending_bind: Vec::new(),
            pending_describe_statement: Vec::new(),
            pending_describe_portal: Vec::new(),
            pending_execute: Vec::new(),
            dead_statements,
            dead_portals: ReclaimQueue::new(),
            begin_query,
            copy_data: None,
            copy_row_count: None,
        }
    }

    // ===== connection state =====

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    pub fn standard_conforming_strings(&self) -> bool {
        self.standard_conforming_strings
    }

    pub fn set_standard_conforming_strings(&mut self, value: bool) {
        self.standard_conforming_strings = value;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drain async notifications received so far.
    pub fn take_notifications(&mut self) -> Vec<NotificationResponse> {
        std::mem::take(&mut self.notifications)
    }

    /// Drain warnings received outside result processing.
    pub fn take_warnings(&mut self) -> Vec<ServerError> {
        std::mem::take(&mut self.warnings)
    }

    /// Out-of-band cancel channel, serviced by whoever owns the cancel
    /// socket for this backend.
    pub fn set_cancel_channel(&mut self, cancel: tokio::sync::mpsc::UnboundedSender<()>) {
        self.cancel = Some(cancel);
    }

    fn close_connection(&mut self) {
        self.closed = true;
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::driver(
                SqlState::ConnectionFailure,
                "this connection has been closed",
            ));
        }
        Ok(())
    }

    // ===== cooperative connection lock =====

    fn lock(&mut self, op_id: u64) -> Result<()> {
        if self.locked_for == Some(op_id) {
            return Err(Error::driver(
                SqlState::ObjectNotInState,
                "tried to obtain lock while already holding it",
            ));
        }
        self.wait_on_lock()?;
        self.locked_for = Some(op_id);
        Ok(())
    }

    fn unlock(&mut self, op_id: u64) -> Result<()> {
        if self.locked_for != Some(op_id) {
            return Err(Error::driver(
                SqlState::ObjectNotInState,
                "tried to break lock on database connection",
            ));
        }
        self.locked_for = None;
        Ok(())
    }

    /// Entry-point guard: the connection must not be inside a COPY session.
    ///
    /// Exclusive `&mut` access means nothing could release the lock while
    /// we waited, so this fails instead of blocking.
    fn wait_on_lock(&self) -> Result<()> {
        if self.locked_for.is_some() {
            return Err(Error::driver(
                SqlState::ObjectNotInState,
                "connection is busy with a copy operation",
            ));
        }
        Ok(())
    }

    fn has_lock(&self, op_id: u64) -> bool {
        self.locked_for == Some(op_id)
    }

    // ===== query parsing =====

    pub fn create_simple_query(&self, sql: &str) -> Query {
        self.parse_query(sql, false)
    }

    pub fn create_parameterized_query(&self, sql: &str) -> Query {
        self.parse_query(sql, true)
    }

    fn parse_query(&self, sql: &str, with_parameters: bool) -> Query {
        let mut statements =
            sql::split_statements(sql, with_parameters, self.standard_conforming_strings);

        match statements.len() {
            // Empty query.
            0 => Query::simple(SimpleQuery::new(
                vec![String::new()],
                self.dead_statements.sender(),
            )),
            1 => Query::simple(SimpleQuery::new(
                statements.remove(0),
                self.dead_statements.sender(),
            )),
            _ => {
                let mut subqueries = Vec::with_capacity(statements.len());
                let mut offsets = Vec::with_capacity(statements.len());
                let mut offset = 0;
                for fragments in statements {
                    offsets.push(offset);
                    offset += fragments.len() - 1;
                    subqueries.push(SimpleQuery::new(fragments, self.dead_statements.sender()));
                }
                Query::composite(subqueries, offsets)
            }
        }
    }

    // ===== query execution =====

    /// Execute one query, pushing results into `handler`.
    ///
    /// `max_rows` zero means unlimited; `fetch_size` only matters with
    /// [`FORWARD_CURSOR`][QueryFlags::FORWARD_CURSOR].
    pub async fn execute(
        &mut self,
        query: &Query,
        parameters: &ParameterList,
        handler: &mut dyn ResultHandler,
        max_rows: i32,
        fetch_size: i32,
        flags: QueryFlags,
    ) -> Result<()> {
        self.check_usable()?;
        self.wait_on_lock()?;
        log::debug!("execute, maxRows={max_rows}, fetchSize={fetch_size}, flags={flags:?}");

        let describe_only = flags.contains(QueryFlags::DESCRIBE_ONLY);
        if !describe_only {
            parameters.check_all_set()?;
        }
        if parameters.len() != query.parameter_count() {
            return Err(Error::driver(
                SqlState::InvalidParameterValue,
                format!(
                    "query expects {} parameters, the list has {}",
                    query.parameter_count(),
                    parameters.len(),
                ),
            ));
        }

        let mut begin_shim;
        let mut handler: &mut dyn ResultHandler = handler;

        match self.send_query_preamble(flags) {
            Ok(true) => {
                begin_shim = BeginShim::new(handler);
                handler = &mut begin_shim;
            }
            Ok(false) => {}
            Err(err) => {
                self.handle_terminal_failure(err, handler);
                return handler.handle_completion();
            }
        }

        let mut tracking = ErrorTracking::new(handler);
        self.query_count = 0;
        let sent = self
            .send_query(query, parameters, max_rows, fetch_size, flags, &mut tracking)
            .await;
        let handler = tracking.delegate;

        match sent {
            Ok(()) => {
                if let Err(err) = self.sync_and_process(handler, flags).await {
                    self.handle_terminal_failure(err, handler);
                }
            }
            Err(err) if err.is_state(SqlState::InvalidParameterValue) => {
                // No Execute was sent for this statement, but the backend
                // state must still be realigned before surfacing the bind
                // failure.
                match self.sync_and_process(handler, flags).await {
                    Ok(()) => handler.handle_error(err),
                    Err(io_err) => self.handle_terminal_failure(io_err, handler),
                }
            }
            Err(err) => {
                self.handle_terminal_failure(err, handler);
            }
        }

        handler.handle_completion()
    }

    /// Execute a batch of queries in one or more Sync windows.
    pub async fn execute_batch(
        &mut self,
        queries: &[(&Query, &ParameterList)],
        handler: &mut dyn ResultHandler,
        max_rows: i32,
        fetch_size: i32,
        flags: QueryFlags,
    ) -> Result<()> {
        self.check_usable()?;
        self.wait_on_lock()?;
        log::debug!("batch execute {} queries, flags={flags:?}", queries.len());

        let describe_only = flags.contains(QueryFlags::DESCRIBE_ONLY);
        for (query, parameters) in queries {
            if !describe_only {
                parameters.check_all_set()?;
            }
            if parameters.len() != query.parameter_count() {
                return Err(Error::driver(
                    SqlState::InvalidParameterValue,
                    format!(
                        "query expects {} parameters, the list has {}",
                        query.parameter_count(),
                        parameters.len(),
                    ),
                ));
            }
        }

        let mut begin_shim;
        let mut handler: &mut dyn ResultHandler = handler;

        match self.send_query_preamble(flags) {
            Ok(true) => {
                begin_shim = BeginShim::new(handler);
                handler = &mut begin_shim;
            }
            Ok(false) => {}
            Err(err) => {
                self.handle_terminal_failure(err, handler);
                return handler.handle_completion();
            }
        }

        let mut tracking = ErrorTracking::new(handler);
        self.query_count = 0;
        let mut sent: Result<()> = Ok(());
        for (query, parameters) in queries.iter().copied() {
            sent = self
                .send_query(query, parameters, max_rows, fetch_size, flags, &mut tracking)
                .await;
            if sent.is_err() || tracking.saw_error {
                break;
            }
        }
        let saw_error = tracking.saw_error;
        let handler = tracking.delegate;

        match sent {
            Ok(()) if !saw_error => {
                if let Err(err) = self.sync_and_process(handler, flags).await {
                    self.handle_terminal_failure(err, handler);
                }
            }
            Ok(()) => {}
            Err(err) => {
                self.handle_terminal_failure(err, handler);
            }
        }

        handler.handle_completion()
    }

    /// Continue an open portal.
    pub async fn fetch(
        &mut self,
        cursor: &Portal,
        handler: &mut dyn ResultHandler,
        fetch_size: i32,
    ) -> Result<()> {
        self.check_usable()?;
        self.wait_on_lock()?;

        // A fetch that returns no rows yields a bare CommandStatus; the
        // shim turns it into an empty batch.
        let mut shim = FetchShim { delegate: handler, portal: cursor };

        self.process_dead_parsed_queries();
        self.process_dead_portals();

        let query = cursor.query().clone();
        self.send_execute(&query, Some(cursor), fetch_size);

        if let Err(err) = self.sync_and_process(&mut shim, QueryFlags::empty()).await {
            self.handle_terminal_failure(err, &mut shim);
        }

        shim.handle_completion()
    }

    /// Synchronously drain any buffered async notifications.
    pub async fn process_notifies(&mut self) -> Result<()> {
        self.check_usable()?;
        self.wait_on_lock()?;

        // Asynchronous notifies only arrive when we are not in a transaction.
        if self.tx_status != TransactionStatus::Idle {
            return Ok(());
        }

        while self.io.has_pending() {
            match self.io.recv().await? {
                BackendMessage::NotificationResponse(n) => self.notifications.push(n),
                BackendMessage::ErrorResponse(e) => return Err(e.to_server_error().into()),
                BackendMessage::NoticeResponse(n) => self.warnings.push(n.to_server_error()),
                other => {
                    return Err(Error::driver(
                        SqlState::ConnectionFailure,
                        format!("unknown response type '{}'", other.msgtype() as char),
                    ));
                }
            }
        }
        Ok(())
    }

    // ===== fastpath subprotocol =====

    pub fn create_fastpath_parameters(&self, count: usize) -> ParameterList {
        ParameterList::new(count)
    }

    /// Call a backend function by OID, returning its binary result.
    pub async fn fastpath_call(
        &mut self,
        fnid: Oid,
        parameters: &ParameterList,
        suppress_begin: bool,
    ) -> Result<Option<Bytes>> {
        self.check_usable()?;
        self.wait_on_lock()?;

        if !suppress_begin {
            self.do_subprotocol_begin().await?;
        }

        let bound = parameters.all();
        self.send_fastpath_call(fnid, &bound);
        if let Err(err) = self.io.flush().await {
            self.close_connection();
            return Err(Self::connection_failure(err.into()));
        }

        match self.receive_fastpath_result().await {
            Ok(value) => Ok(value),
            Err(err) if err.is_io() => {
                self.close_connection();
                Err(Self::connection_failure(err))
            }
            Err(err) => Err(err),
        }
    }

    fn send_fastpath_call(&mut self, fnid: Oid, params: &BoundParams) {
        log::debug!(" FE=> FunctionCall({fnid}, {} params)", params.len());
        let formats = params.formats();
        let values = params.bind_values();
        self.io.send(frontend::FunctionCall {
            fnid,
            arg_formats: &formats,
            args: &values,
            result_format: PgFormat::Binary,
        });
        self.io.send(frontend::Sync);
    }

    async fn receive_fastpath_result(&mut self) -> Result<Option<Bytes>> {
        let mut error: Option<Error> = None;
        let mut value = None;

        loop {
            match self.io.recv().await? {
                BackendMessage::NotificationResponse(n) => self.notifications.push(n),
                BackendMessage::ErrorResponse(e) => {
                    let new = Error::from(e.to_server_error());
                    match &mut error {
                        Some(first) => first.chain(new),
                        None => error = Some(new),
                    }
                }
                BackendMessage::NoticeResponse(n) => self.warnings.push(n.to_server_error()),
                BackendMessage::ReadyForQuery(rfq) => {
                    self.receive_rfq(rfq)?;
                    break;
                }
                BackendMessage::FunctionCallResponse(resp) => {
                    log::debug!(
                        " <=BE FunctionCallResponse({} bytes)",
                        resp.value.as_ref().map_or(-1, |v| v.len() as i64),
                    );
                    value = resp.value;
                }
                other => {
                    return Err(Error::driver(
                        SqlState::ConnectionFailure,
                        format!("unknown response type '{}'", other.msgtype() as char),
                    ));
                }
            }
        }

        match error {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    /// Open the implicit transaction ahead of a fastpath or COPY call.
    async fn do_subprotocol_begin(&mut self) -> Result<()> {
        if self.tx_status != TransactionStatus::Idle {
            return Ok(());
        }
        log::debug!("issuing BEGIN before fastpath or copy call");

        let mut handler = SubprotocolBegin::default();
        let begin = self.begin_query.clone();
        self.send_one_query(&begin, BoundParams::none(), 0, 0, QueryFlags::NO_METADATA)?;
        self.io.send(frontend::Sync);
        self.io
            .flush()
            .await
            .map_err(|e| Self::connection_failure(e.into()))?;
        match self.process_results(&mut handler, QueryFlags::empty()).await {
            Ok(()) => handler.finish(),
            Err(err) => Err(Self::connection_failure(err)),
        }
    }

    // ===== COPY subprotocol =====

    /// Send the given COPY statement and take exclusive access of the
    /// connection for the resulting operation.
    pub async fn start_copy(&mut self, sql: &str, suppress_begin: bool) -> Result<CopyOperation> {
        self.check_usable()?;
        self.wait_on_lock()?;

        if !suppress_begin {
            self.do_subprotocol_begin().await?;
        }

        log::debug!(" FE=> Query(CopyStart)");
        self.io.send(frontend::Query { sql });
        self.copy_row_count = None;
        if let Err(err) = self.io.flush().await {
            return Err(Self::copy_failure(err.into(), "database connection failed when starting copy"));
        }

        // Expect a CopyInResponse or CopyOutResponse to the query above.
        match self.process_copy_results(None, true).await {
            Ok(Some(op)) => Ok(op),
            Ok(None) => Err(Error::driver(
                SqlState::ProtocolViolation,
                "requested copy operation did not start",
            )),
            Err(err) => Err(Self::copy_failure(err, "database connection failed when starting copy")),
        }
    }

    /// Send data on an active CopyIn operation.
    ///
    /// Buffered; [`flush_copy`][QueryExecutor::flush_copy] or
    /// [`end_copy`][QueryExecutor::end_copy] pushes it out.
    pub async fn write_to_copy(&mut self, op: &CopyOperation, data: &[u8]) -> Result<()> {
        if !self.has_lock(op.id) || op.direction() != CopyDirection::In {
            return Err(Error::driver(
                SqlState::ObjectNotInState,
                "tried to write to an inactive copy operation",
            ));
        }
        log::trace!(" FE=> CopyData({})", data.len());

        self.io.send(frontend::CopyData { data });

        // Collect any pending notifications without blocking so the
        // server's buffer does not silently fill.
        match self.process_copy_results(Some(op), false).await {
            Ok(_) => Ok(()),
            Err(err) => Err(Self::copy_failure(err, "database connection failed when writing to copy")),
        }
    }

    /// Flush buffered copy data to the backend.
    pub async fn flush_copy(&mut self, op: &CopyOperation) -> Result<()> {
        if !self.has_lock(op.id) || op.direction() != CopyDirection::In {
            return Err(Error::driver(
                SqlState::ObjectNotInState,
                "tried to write to an inactive copy operation",
            ));
        }

        if let Err(err) = self.io.flush().await {
            return Err(Self::copy_failure(err.into(), "database connection failed when writing to copy"));
        }
        match self.process_copy_results(Some(op), false).await {
            Ok(_) => Ok(()),
            Err(err) => Err(Self::copy_failure(err, "database connection failed when writing to copy")),
        }
    }

    /// Block for the next data row of an active CopyOut operation.
    ///
    /// `None` means the copy completed and the connection is free again.
    pub async fn read_from_copy(&mut self, op: &CopyOperation) -> Result<Option<Bytes>> {
        if !self.has_lock(op.id) || op.direction() != CopyDirection::Out {
            return Err(Error::driver(
                SqlState::ObjectNotInState,
                "tried to read from inactive copy",
            ));
        }

        match self.process_copy_results(Some(op), true).await {
            Ok(_) => Ok(self.copy_data.take()),
            Err(err) => Err(Self::copy_failure(err, "database connection failed when reading from copy")),
        }
    }

    /// Finish writing to a CopyIn and release the connection.
    ///
    /// Returns the server-reported row count, when the server sent one.
    pub async fn end_copy(&mut self, op: &CopyOperation) -> Result<Option<u64>> {
        if !self.has_lock(op.id) || op.direction() != CopyDirection::In {
            return Err(Error::driver(SqlState::ObjectNotInState, "tried to end inactive copy"));
        }
        log::debug!(" FE=> CopyDone");

        self.io.send(frontend::CopyDone);
        if let Err(err) = self.io.flush().await {
            return Err(Self::copy_failure(err.into(), "database connection failed when ending copy"));
        }

        match self.process_copy_results(Some(op), true).await {
            Ok(_) => Ok(self.copy_row_count.take()),
            Err(err) => Err(Self::copy_failure(err, "database connection failed when ending copy")),
        }
    }

    /// Abort an active copy operation, discarding exchanged data.
    ///
    /// For CopyIn a `CopyFail` is sent and the backend must answer with
    /// exactly one error response; for CopyOut an out-of-band query cancel
    /// is issued instead.
    pub async fn cancel_copy(&mut self, op: &CopyOperation) -> Result<()> {
        if !self.has_lock(op.id) {
            return Err(Error::driver(
                SqlState::ObjectNotInState,
                "tried to cancel an inactive copy operation",
            ));
        }

        match op.direction() {
            CopyDirection::In => {
                log::debug!(" FE=> CopyFail");
                self.io.send(frontend::CopyFail { message: "copy cancel requested" });
                if let Err(err) = self.io.flush().await {
                    return Err(Self::copy_failure(
                        err.into(),
                        "database connection failed when canceling copy operation",
                    ));
                }

                let mut error: Option<Error> = None;
                let mut errors = 0usize;

                // Discard the rest of the input until the lock is released
                // at ReadyForQuery.
                while self.has_lock(op.id) {
                    match self.process_copy_results(Some(op), true).await {
                        Ok(_) => {}
                        Err(err) if err.is_io() => {
                            return Err(Self::copy_failure(
                                err,
                                "database connection failed when canceling copy operation",
                            ));
                        }
                        // expected error response to the failing copy
                        Err(mut err) => {
                            errors += 1;
                            if let Some(prev) = error.take() {
                                err.chain(prev);
                            }
                            error = Some(err);
                        }
                    }
                }

                match errors {
                    1 => Ok(()),
                    0 => Err(Error::driver(
                        SqlState::CommunicationError,
                        "missing expected error response to copy cancel request",
                    )),
                    n => {
                        let mut err = Error::driver(
                            SqlState::CommunicationError,
                            format!("got {n} error responses to single copy cancel request"),
                        );
                        if let Some(chain) = error {
                            err.chain(chain);
                        }
                        Err(err)
                    }
                }
            }
            CopyDirection::Out => self.send_query_cancel(),
        }
    }

    /// Issue a protocol-level query cancel on the out-of-band channel.
    fn send_query_cancel(&mut self) -> Result<()> {
        match &self.cancel {
            Some(cancel) if cancel.send(()).is_ok() => Ok(()),
            _ => Err(Error::driver(
                SqlState::NotImplemented,
                "no out-of-band cancel channel is configured",
            )),
        }
    }

    /// Demultiplexer for the COPY subprotocol.
    ///
    /// With `block` false only already-buffered messages are consumed.
    /// Returns the newly started operation when a CopyInResponse or
    /// CopyOutResponse arrives.
    async fn process_copy_results(
        &mut self,
        op: Option<&CopyOperation>,
        mut block: bool,
    ) -> Result<Option<CopyOperation>> {
        let mut errors: Option<Error> = None;
        let mut started: Option<CopyOperation> = None;
        let mut active = op.map(|o| (o.id, o.direction()));
        let mut end_receiving = false;

        let collect = |errors: &mut Option<Error>, mut err: Error| {
            if let Some(prev) = errors.take() {
                err.chain(prev);
            }
            *errors = Some(err);
        };

        while !end_receiving && (block || self.io.has_pending()) {
            // The server returns CommandComplete upon receiving the EOF
            // marker of a binary copy, potentially before we have issued
            // CopyDone. While not blocking we are not done, so leave it on
            // the wire until we are.
            if !block && self.io.peek().await? == b'C' {
                log::debug!(" <=BE CommandStatus, ignored until CopyDone");
                break;
            }

            match self.io.recv().await? {
                BackendMessage::NotificationResponse(n) => self.notifications.push(n),
                BackendMessage::NoticeResponse(n) => self.warnings.push(n.to_server_error()),
                BackendMessage::CommandComplete(cmd) => {
                    let handled = if active.is_none() {
                        Err(Error::driver(
                            SqlState::ObjectNotInState,
                            format!(
                                "received CommandComplete '{}' without an active copy operation",
                                cmd.tag,
                            ),
                        ))
                    } else {
                        self.handle_copy_command_status(&cmd.tag)
                    };
                    if let Err(err) = handled {
                        collect(&mut errors, err);
                    }
                    block = true;
                }
                // expected response to CopyFail; ReadyForQuery may still be
                // on the wire, so block for it
                BackendMessage::ErrorResponse(e) => {
                    collect(&mut errors, e.to_server_error().into());
                    block = true;
                }
                BackendMessage::CopyInResponse(resp) => {
                    log::debug!(" <=BE CopyInResponse");
                    if active.is_some() {
                        collect(
                            &mut errors,
                            Error::driver(
                                SqlState::ObjectNotInState,
                                "got CopyInResponse from server during an active copy",
                            ),
                        );
                    }
                    let new = CopyOperation::new(
                        self.next_id(),
                        CopyDirection::In,
                        resp.format,
                        resp.column_formats,
                    );
                    self.lock(new.id)?;
                    active = Some((new.id, CopyDirection::In));
                    started = Some(new);
                    end_receiving = true;
                }
                BackendMessage::CopyOutResponse(resp) => {
                    log::debug!(" <=BE CopyOutResponse");
                    if active.is_some() {
                        collect(
                            &mut errors,
                            Error::driver(
                                SqlState::ObjectNotInState,
                                "got CopyOutResponse from server during an active copy",
                            ),
                        );
                    }
                    let new = CopyOperation::new(
                        self.next_id(),
                        CopyDirection::Out,
                        resp.format,
                        resp.column_formats,
                    );
                    self.lock(new.id)?;
                    active = Some((new.id, CopyDirection::Out));
                    started = Some(new);
                    end_receiving = true;
                }
                BackendMessage::CopyData(data) => {
                    match active {
                        None => collect(
                            &mut errors,
                            Error::driver(
                                SqlState::ObjectNotInState,
                                "got CopyData without an active copy operation",
                            ),
                        ),
                        Some((_, CopyDirection::In)) => collect(
                            &mut errors,
                            Error::driver(
                                SqlState::CommunicationError,
                                "unexpected copydata from server for a copy-in operation",
                            ),
                        ),
                        Some((_, CopyDirection::Out)) => self.copy_data = Some(data.data),
                    }
                    end_receiving = true;
                }
                BackendMessage::CopyDone(_) => {
                    log::debug!(" <=BE CopyDone");
                    if !matches!(active, Some((_, CopyDirection::Out))) {
                        collect(
                            &mut errors,
                            Error::driver(
                                SqlState::ObjectNotInState,
                                "got CopyDone while not copying from server",
                            ),
                        );
                    }
                    // keep receiving, a CommandComplete follows
                    block = true;
                }
                BackendMessage::ReadyForQuery(rfq) => {
                    self.receive_rfq(rfq)?;
                    if let Some((id, _)) = active
                        && self.has_lock(id)
                    {
                        self.unlock(id)?;
                    }
                    active = None;
                    started = None;
                    end_receiving = true;
                }
                // a non-copy statement slipped in; its rows mean nothing here
                BackendMessage::RowDescription(_) | BackendMessage::DataRow(_) => {}
                other => return Err(other.unexpected("copy subprotocol").into()),
            }
        }

        match errors {
            Some(err) => Err(err),
            None => Ok(started),
        }
    }

    fn handle_copy_command_status(&mut self, tag: &str) -> Result<()> {
        if tag.starts_with("COPY") {
            self.copy_row_count = tag.rfind(' ').and_then(|i| tag[i + 1..].parse().ok());
            Ok(())
        } else {
            Err(Error::driver(
                SqlState::CommunicationError,
                format!("CommandComplete expected COPY but got: {tag}"),
            ))
        }
    }

    // ===== message sending =====

    /// Drain deferred Close messages and open the implicit transaction.
    ///
    /// Returns whether a BEGIN went out (the caller must interpose the
    /// BEGIN shim on its handler).
    fn send_query_preamble(&mut self, flags: QueryFlags) -> Result<bool> {
        // First, close statements and portals whose owners are gone.
        self.process_dead_parsed_queries();
        self.process_dead_portals();

        if flags.contains(QueryFlags::SUPPRESS_BEGIN)
            || self.tx_status != TransactionStatus::Idle
        {
            return Ok(false);
        }

        let begin = self.begin_query.clone();
        self.send_one_query(&begin, BoundParams::none(), 0, 0, QueryFlags::NO_METADATA)?;
        Ok(true)
    }

    async fn send_query(
        &mut self,
        query: &Query,
        parameters: &ParameterList,
        max_rows: i32,
        fetch_size: i32,
        flags: QueryFlags,
        tracking: &mut ErrorTracking<'_>,
    ) -> Result<()> {
        let disallow_batching = flags.contains(QueryFlags::DISALLOW_BATCHING);

        match &query.kind {
            QueryKind::Simple(simple) => {
                self.query_count += 1;
                if disallow_batching || self.query_count >= MAX_BUFFERED_QUERIES {
                    self.sync_and_process(&mut *tracking, flags).await?;
                    self.query_count = 0;
                }

                // If we saw errors, don't send anything more.
                if !tracking.saw_error {
                    let params = parameters.window(0, simple.parameter_count())?;
                    self.send_one_query(simple, params, max_rows, fetch_size, flags)?;
                }
            }
            QueryKind::Composite { subqueries, offsets } => {
                for (subquery, offset) in subqueries.iter().zip(offsets) {
                    self.query_count += 1;
                    if disallow_batching || self.query_count >= MAX_BUFFERED_QUERIES {
                        self.sync_and_process(&mut *tracking, flags).await?;
                        if tracking.saw_error {
                            break;
                        }
                        self.query_count = 0;
                    }

                    let params = parameters.window(*offset, subquery.parameter_count())?;
                    self.send_one_query(subquery, params, max_rows, fetch_size, flags)?;
                }
            }
        }
        Ok(())
    }

    // send_one_query sends a single statement via the extended query
    // protocol:
    //
    //   Parse     S_n from the placeholder fragments; skipped if already
    //             prepared for these types, unnamed if oneshot
    //   Describe  S_n when types need resolving (or describe-only)
    //   Bind      C_n (or the unnamed portal) from S_n plus parameters
    //   Describe  C_n; skipped if metadata is unwanted or already known
    //   Execute   C_n with the computed row limit
    //
    // The caller owns the surrounding Sync.
    fn send_one_query(
        &mut self,
        query: &SimpleQuery,
        params: BoundParams,
        max_rows: i32,
        fetch_size: i32,
        flags: QueryFlags,
    ) -> Result<()> {
        // nb: a portal requires a named statement, as the unnamed statement
        // is rewritten by the next Parse while the portal is still open.
        let no_results = flags.contains(QueryFlags::NO_RESULTS);
        let no_meta = flags.contains(QueryFlags::NO_METADATA);
        let describe_only = flags.contains(QueryFlags::DESCRIBE_ONLY);
        let use_portal = flags.contains(QueryFlags::FORWARD_CURSOR)
            && !no_results
            && !no_meta
            && fetch_size > 0
            && !describe_only;
        let one_shot = flags.contains(QueryFlags::ONESHOT) && !use_portal;

        let rows = if no_results {
            1 // discarding results anyway, keep the transfer minimal
        } else if !use_portal {
            max_rows
        } else if max_rows != 0 && fetch_size > max_rows {
            max_rows
        } else {
            fetch_size
        };

        self.send_parse(query, &params, one_shot);

        // Pick up any state changes from the Parse before deciding on the
        // statement describe.
        let query_has_unknown = query.has_unresolved_types();
        let params_has_unknown = params.has_unresolved_types();

        let describe_statement = describe_only
            || (!one_shot
                && params_has_unknown
                && query_has_unknown
                && !query.is_statement_described());

        if !describe_statement
            && params_has_unknown
            && !query_has_unknown
            && let Some(statement_oids) = query.statement_oids()
        {
            params.adopt_unspecified(&statement_oids);
        }

        if describe_statement {
            self.send_describe_statement(query, &params, describe_only);
            if describe_only {
                return Ok(());
            }
        }

        let portal = if use_portal {
            let name = self.next_portal_name();
            Some(Portal::new(query.clone(), name, self.dead_portals.sender()))
        } else {
            None
        };

        self.send_bind(query, &params, portal.as_ref())?;

        // A statement describe already produces a RowDescription, don't
        // reissue it for the portal.
        if !no_meta && !describe_statement && !query.is_portal_described() {
            self.send_describe_portal(query, portal.as_ref());
        }

        self.send_execute(query, portal.as_ref(), rows);
        Ok(())
    }

    fn send_parse(&mut self, query: &SimpleQuery, params: &BoundParams, one_shot: bool) {
        // Already parsed, or we have a Parse pending and the types are right?
        let type_oids = params.type_oids();
        if query.is_prepared_for(&type_oids) {
            return;
        }

        // Clean up any existing statement, as we can't use it.
        query.unprepare();
        self.process_dead_parsed_queries();

        let name = if one_shot {
            None
        } else {
            let name = self.next_statement_name();
            query.set_prepared(name.clone(), type_oids.clone());
            Some(name)
        };

        let sql = query.native_sql();
        log::debug!(" FE=> Parse(stmt={name:?}, query={sql:?}, oids={type_oids:?})");

        self.io.send(frontend::Parse {
            name: name.as_deref().unwrap_or(""),
            sql: &sql,
            param_oids: &type_oids,
        });

        self.pending_parse.push((query.clone(), name));
    }

    fn send_bind(
        &mut self,
        query: &SimpleQuery,
        params: &BoundParams,
        portal: Option<&Portal>,
    ) -> Result<()> {
        let stmt_name = query.statement_name().unwrap_or_default();
        let portal_name = portal.map(Portal::name).unwrap_or_default().to_owned();
        let values = params.bind_values();

        // The backend's MaxAllocSize bounds the largest message it will
        // take; do not send a Bind we already know it must reject.
        let encoded = frontend::Bind::encoded_size(&portal_name, &stmt_name, &values);
        if encoded > 0x3fff_ffff {
            return Err(Error::driver(
                SqlState::InvalidParameterValue,
                format!("bind message length {encoded} too long"),
            ));
        }

        log::debug!(" FE=> Bind(stmt={stmt_name}, portal={portal_name})");
        let formats = params.formats();
        self.io.send(frontend::Bind {
            portal_name: &portal_name,
            stmt_name: &stmt_name,
            param_formats: &formats,
            params: &values,
        });

        self.pending_bind.push(portal.cloned());
        Ok(())
    }

    fn send_describe_statement(
        &mut self,
        query: &SimpleQuery,
        params: &BoundParams,
        describe_only: bool,
    ) {
        let name = query.statement_name();
        log::debug!(" FE=> Describe(statement={name:?})");

        self.io.send(frontend::Describe {
            kind: b'S',
            name: name.as_deref().unwrap_or(""),
        });

        self.pending_describe_statement.push(DescribeRecord {
            query: query.clone(),
            params: params.clone(),
            describe_only,
            name,
        });
        // the statement describe also emits a RowDescription
        self.pending_describe_portal.push(query.clone());
        query.set_statement_described();
        query.set_portal_described();
    }

    fn send_describe_portal(&mut self, query: &SimpleQuery, portal: Option<&Portal>) {
        let name = portal.map(Portal::name).unwrap_or_default().to_owned();
        log::debug!(" FE=> Describe(portal={name})");

        self.io.send(frontend::Describe { kind: b'P', name: &name });
        self.pending_describe_portal.push(query.clone());
        query.set_portal_described();
    }

    fn send_execute(&mut self, query: &SimpleQuery, portal: Option<&Portal>, rows: i32) {
        let name = portal.map(Portal::name).unwrap_or_default().to_owned();
        log::debug!(" FE=> Execute(portal={name}, limit={rows})");

        self.io.send(frontend::Execute { portal_name: &name, max_rows: rows });
        self.pending_execute.push((query.clone(), portal.cloned()));
    }

    async fn sync_and_process(
        &mut self,
        handler: &mut dyn ResultHandler,
        flags: QueryFlags,
    ) -> Result<()> {
        log::debug!(" FE=> Sync");
        self.io.send(frontend::Sync);
        self.io.flush().await?;
        self.process_results(handler, flags).await
    }

    // ===== reclamation =====

    fn process_dead_parsed_queries(&mut self) {
        while let Some(name) = self.dead_statements.try_next() {
            log::debug!(" FE=> CloseStatement({name})");
            self.io.send(frontend::Close { kind: b'S', name: &name });
        }
    }

    fn process_dead_portals(&mut self) {
        while let Some(name) = self.dead_portals.try_next() {
            log::debug!(" FE=> ClosePortal({name})");
            self.io.send(frontend::Close { kind: b'P', name: &name });
        }
    }

    // ===== response demultiplexer =====

    /// Read and dispatch messages until ReadyForQuery.
    ///
    /// Errors returned here are connection-level; backend errors go to the
    /// handler so the whole Sync window drains cleanly.
    async fn process_results(
        &mut self,
        handler: &mut dyn ResultHandler,
        flags: QueryFlags,
    ) -> Result<()> {
        let no_results = flags.contains(QueryFlags::NO_RESULTS);
        let both_rows_and_status = flags.contains(QueryFlags::BOTH_ROWS_AND_STATUS);

        let mut tuples: Option<Vec<Tuple>> = None;
        let mut end_query = false;

        // A describe-only run has no CommandComplete to finish on; the next
        // RowDescription or NoData is its end.
        let mut done_after_row_desc_no_data = false;

        let mut parse_index = 0;
        let mut describe_index = 0;
        let mut describe_portal_index = 0;
        let mut bind_index = 0;
        let mut execute_index = 0;

        while !end_query {
            match self.io.recv().await? {
                BackendMessage::NotificationResponse(n) => self.notifications.push(n),

                BackendMessage::ParseComplete(_) => {
                    let Some((query, name)) = self.pending_parse.get(parse_index) else {
                        return Err(Error::driver(
                            SqlState::ProtocolViolation,
                            "ParseComplete without a pending parse",
                        ));
                    };
                    parse_index += 1;
                    log::debug!(" <=BE ParseComplete [{name:?}]");
                    // The statement now exists server-side; from here its
                    // name is reclaimed when the last owner disappears.
                    if name.is_some() {
                        query.register_parsed();
                    }
                }

                BackendMessage::ParameterDescription(desc) => {
                    log::debug!(" <=BE ParameterDescription");
                    let Some(rec) = self.pending_describe_statement.get(describe_index) else {
                        return Err(Error::driver(
                            SqlState::ProtocolViolation,
                            "ParameterDescription without a pending statement describe",
                        ));
                    };
                    rec.params.resolve_types(&desc.oids);

                    // Multiple Parse and DescribeStatement messages can
                    // share a network trip; only bind the resolved types
                    // into the query if it still carries the name this
                    // describe was sent for.
                    if rec.name == rec.query.statement_name() {
                        rec.query.set_statement_oids(rec.params.type_oids());
                    }

                    if rec.describe_only {
                        done_after_row_desc_no_data = true;
                    } else {
                        describe_index += 1;
                    }
                }

                BackendMessage::BindComplete(_) => {
                    let Some(portal) = self.pending_bind.get(bind_index) else {
                        return Err(Error::driver(
                            SqlState::ProtocolViolation,
                            "BindComplete without a pending bind",
                        ));
                    };
                    bind_index += 1;
                    log::debug!(" <=BE BindComplete [{portal:?}]");
                    if let Some(portal) = portal {
                        portal.register();
                    }
                }

                BackendMessage::CloseComplete(_) => {
                    log::debug!(" <=BE CloseComplete");
                }

                BackendMessage::NoData(_) => {
                    log::debug!(" <=BE NoData");
                    describe_portal_index += 1;

                    if done_after_row_desc_no_data {
                        let Some(rec) = self.pending_describe_statement.get(describe_index) else {
                            return Err(Error::driver(
                                SqlState::ProtocolViolation,
                                "NoData without a pending statement describe",
                            ));
                        };
                        describe_index += 1;
                        if let Some(fields) = rec.query.fields() {
                            // there was a resultset
                            handler.handle_result_rows(&rec.query, Some(fields), Vec::new(), None);
                        }
                    }
                }

                BackendMessage::PortalSuspended(_) => {
                    // nb: this appears *instead* of CommandComplete; only a
                    // row-returning statement can suspend.
                    log::debug!(" <=BE PortalSuspended");
                    let Some((query, portal)) = self.pending_execute.get(execute_index) else {
                        return Err(Error::driver(
                            SqlState::ProtocolViolation,
                            "PortalSuspended without a pending execute",
                        ));
                    };
                    execute_index += 1;

                    let fields = query.fields();
                    if fields.is_some() && !no_results && tuples.is_none() {
                        tuples = Some(Vec::new());
                    }
                    let batch = tuples.take().unwrap_or_default();
                    handler.handle_result_rows(query, fields, batch, portal.clone());
                }

                BackendMessage::CommandComplete(cmd) => {
                    log::debug!(" <=BE CommandStatus({})", cmd.tag);
                    done_after_row_desc_no_data = false;

                    let Some((query, portal)) = self.pending_execute.get(execute_index) else {
                        return Err(Error::driver(
                            SqlState::ProtocolViolation,
                            "CommandComplete without a pending execute",
                        ));
                    };
                    execute_index += 1;

                    let fields = query.fields();
                    if fields.is_some() && !no_results && tuples.is_none() {
                        tuples = Some(Vec::new());
                    }

                    if fields.is_some() || tuples.is_some() {
                        // there was a resultset
                        let batch = tuples.take().unwrap_or_default();
                        handler.handle_result_rows(query, fields, batch, None);
                        if both_rows_and_status {
                            interpret_command_status(&cmd.tag, handler);
                        }
                    } else {
                        interpret_command_status(&cmd.tag, handler);
                    }

                    if let Some(portal) = portal {
                        portal.close();
                    }
                }

                BackendMessage::DataRow(row) => {
                    log::trace!(" <=BE DataRow");
                    match row.columns() {
                        Ok(columns) => {
                            if !no_results {
                                tuples.get_or_insert_with(Vec::new).push(columns);
                            }
                        }
                        Err(DataRowError::Alloc(err)) => {
                            // drop the row, report, keep draining
                            if !no_results {
                                handler.handle_error(Error::driver(
                                    SqlState::OutOfMemory,
                                    format!("ran out of memory retrieving query results: {err}"),
                                ));
                            }
                        }
                        Err(DataRowError::Protocol(err)) => return Err(err.into()),
                    }
                }

                BackendMessage::ErrorResponse(e) => {
                    // response to pretty much everything; the backend skips
                    // to the Sync, we keep draining
                    handler.handle_error(e.to_server_error().into());
                }

                BackendMessage::EmptyQueryResponse(_) => {
                    log::debug!(" <=BE EmptyQuery");
                    let Some((_, portal)) = self.pending_execute.get(execute_index) else {
                        return Err(Error::driver(
                            SqlState::ProtocolViolation,
                            "EmptyQueryResponse without a pending execute",
                        ));
                    };
                    execute_index += 1;
                    handler.handle_command_status("EMPTY", 0, 0);
                    if let Some(portal) = portal {
                        portal.close();
                    }
                }

                BackendMessage::NoticeResponse(notice) => {
                    handler.handle_warning(notice.to_server_error());
                }

                BackendMessage::ParameterStatus(status) => {
                    log::debug!(" <=BE ParameterStatus({} = {})", status.name, status.value);
                    if self.apply_parameter_status(&status, handler) {
                        end_query = true;
                    }
                }

                BackendMessage::RowDescription(desc) => {
                    log::debug!(" <=BE RowDescription({})", desc.fields.len());
                    let fields: std::sync::Arc<[_]> = desc.fields.into();
                    tuples = Some(Vec::new());

                    let Some(query) = self.pending_describe_portal.get(describe_portal_index)
                    else {
                        return Err(Error::driver(
                            SqlState::ProtocolViolation,
                            "RowDescription without a pending describe",
                        ));
                    };
                    describe_portal_index += 1;
                    query.set_fields(fields.clone());

                    if done_after_row_desc_no_data {
                        let Some(rec) = self.pending_describe_statement.get(describe_index) else {
                            return Err(Error::driver(
                                SqlState::ProtocolViolation,
                                "RowDescription without a pending statement describe",
                            ));
                        };
                        describe_index += 1;
                        handler.handle_result_rows(&rec.query, Some(fields), Vec::new(), None);
                        tuples = None;
                    }
                }

                BackendMessage::ReadyForQuery(rfq) => {
                    self.receive_rfq(rfq)?;
                    end_query = true;

                    // Reset the statement name of Parses that failed.
                    while let Some((failed, _)) = self.pending_parse.get(parse_index) {
                        parse_index += 1;
                        failed.unprepare();
                    }

                    self.pending_parse.clear();
                    self.pending_describe_statement.clear();
                    self.pending_describe_portal.clear();
                    self.pending_bind.clear();
                    self.pending_execute.clear();
                }

                BackendMessage::CopyInResponse(_) => {
                    // COPY is not supported at this entry point; fail it so
                    // the backend does not wait for data.
                    log::debug!(" <=BE CopyInResponse, FE=> CopyFail");
                    self.io.send(frontend::CopyFail {
                        message: "COPY is not supported via the execute entry point",
                    });
                    self.io.send(frontend::Sync);
                    self.io.flush().await?;
                    // skip the response to the CopyFail
                    let _ = self.io.recv().await?;
                }

                BackendMessage::CopyOutResponse(_) => {
                    log::debug!(" <=BE CopyOutResponse");
                    // data transfer cannot be aborted, ignore the CopyData
                    handler.handle_error(Error::driver(
                        SqlState::NotImplemented,
                        "COPY is not supported via the execute entry point",
                    ));
                }

                BackendMessage::CopyDone(_) => log::debug!(" <=BE CopyDone (ignored)"),
                BackendMessage::CopyData(_) => log::trace!(" <=BE CopyData (ignored)"),

                other => return Err(other.unexpected("query results").into()),
            }
        }

        Ok(())
    }

    /// Session-invariant guards. Returns whether the processing loop must
    /// end because the connection was force-closed.
    fn apply_parameter_status(
        &mut self,
        status: &crate::postgres::backend::ParameterStatus,
        handler: &mut dyn ResultHandler,
    ) -> bool {
        let name = status.name.as_str();
        let value = status.value.as_str();

        if name == "client_encoding"
            && !value.eq_ignore_ascii_case("UTF8")
            && !self.allow_encoding_changes
        {
            // we can't trust any subsequent string
            self.close_connection();
            handler.handle_error(Error::driver(
                SqlState::ConnectionFailure,
                format!("client_encoding was changed to {value}, only UTF8 is supported"),
            ));
            return true;
        }

        if name == "DateStyle" && !value.starts_with("ISO,") {
            // we can't trust any subsequent date
            self.close_connection();
            handler.handle_error(Error::driver(
                SqlState::ConnectionFailure,
                format!("DateStyle was changed to {value}, it must begin with ISO"),
            ));
            return true;
        }

        if name == "standard_conforming_strings" {
            match value {
                "on" => self.standard_conforming_strings = true,
                "off" => self.standard_conforming_strings = false,
                other => {
                    // we no longer know how to escape string literals
                    self.close_connection();
                    handler.handle_error(Error::driver(
                        SqlState::ConnectionFailure,
                        format!("standard_conforming_strings was reported as {other}"),
                    ));
                    return true;
                }
            }
        }

        false
    }

    fn receive_rfq(&mut self, rfq: ReadyForQuery) -> Result<()> {
        log::debug!(" <=BE ReadyForQuery({})", rfq.status as char);
        self.tx_status = match rfq.status {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::Open,
            b'E' => TransactionStatus::Failed,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected transaction state in ReadyForQuery: {other}"),
                )
                .into());
            }
        };
        Ok(())
    }

    // ===== failure plumbing =====

    fn handle_terminal_failure(&mut self, err: Error, handler: &mut dyn ResultHandler) {
        self.close_connection();
        handler.handle_error(Self::connection_failure(err));
    }

    fn connection_failure(err: Error) -> Error {
        let mut failure = Error::driver(
            SqlState::ConnectionFailure,
            "an I/O error occurred while talking to the backend",
        );
        failure.chain(err);
        failure
    }

    fn copy_failure(err: Error, context: &str) -> Error {
        if err.is_io() {
            let mut failure = Error::driver(SqlState::ConnectionFailure, context.to_owned());
            failure.chain(err);
            failure
        } else {
            err
        }
    }

    // ===== name generation =====

    fn next_id(&mut self) -> u64 {
        let id = self.next_unique_id;
        self.next_unique_id += 1;
        id
    }

    fn next_statement_name(&mut self) -> String {
        let id = self.next_id();
        let mut buf = itoa::Buffer::new();
        let mut name = String::with_capacity(12);
        name.push_str("S_");
        name.push_str(buf.format(id));
        name
    }

    fn next_portal_name(&mut self) -> String {
        let id = self.next_id();
        let mut buf = itoa::Buffer::new();
        let mut name = String::with_capacity(12);
        name.push_str("C_");
        name.push_str(buf.format(id));
        name
    }

    #[cfg(test)]
    pub(crate) fn io_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    #[cfg(test)]
    pub(crate) fn set_transaction_status(&mut self, status: TransactionStatus) {
        self.tx_status = status;
    }
}

/// Split a command tag into the status callback's update count and, for
/// INSERT, the row OID.
fn interpret_command_status(status: &str, handler: &mut dyn ResultHandler) {
    let mut update_count = 0;
    let mut insert_oid = 0;

    if ["INSERT", "UPDATE", "DELETE", "MOVE"]
        .iter()
        .any(|prefix| status.starts_with(prefix))
    {
        let parsed = (|| {
            let last_space = status.rfind(' ')?;
            let count: u64 = status[last_space + 1..].parse().ok()?;
            let oid = if status.starts_with("INSERT") {
                let first_space = status.find(' ')?;
                status[first_space + 1..last_space].parse().ok()?
            } else {
                0
            };
            Some((count, oid))
        })();

        match parsed {
            Some((count, oid)) => {
                update_count = count;
                insert_oid = oid;
            }
            None => {
                handler.handle_error(Error::driver(
                    SqlState::ConnectionFailure,
                    format!("unable to interpret the update count in command completion tag: {status}"),
                ));
                return;
            }
        }
    }

    handler.handle_command_status(status, update_count, insert_oid);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handler::collect::CollectingHandler;
    use crate::transport::mock::{self, MockTransport};

    fn executor() -> QueryExecutor<MockTransport> {
        QueryExecutor::new(MockTransport::new(), Options::default())
    }

    const SUPPRESS: QueryFlags = QueryFlags::SUPPRESS_BEGIN;

    #[tokio::test]
    async fn simple_select() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::notification(7, "jobs", ""));
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();

        assert_eq!(exec.io_mut().sent_types(), "PBDES");
        assert_eq!(handler.rows.len(), 1);
        let batch = &handler.rows[0];
        assert_eq!(batch.fields.as_ref().unwrap()[0].name, "?column?");
        assert_eq!(batch.fields.as_ref().unwrap()[0].type_oid, 23);
        assert_eq!(batch.tuples, vec![vec![Some(bytes::Bytes::from_static(b"1"))]]);
        assert!(batch.cursor.is_none());
        assert!(handler.statuses.is_empty());
        assert!(handler.errors.is_empty());
        assert_eq!(handler.completions, 1);

        // the notification interleaved with the results was kept
        let notifications = exec.take_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].channel, "jobs");
    }

    #[tokio::test]
    async fn implicit_begin() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::command_complete("BEGIN"));
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'T'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, QueryFlags::empty())
            .await
            .unwrap();

        // BEGIN goes out as its own Parse/Bind/Execute ahead of the query
        assert_eq!(exec.io_mut().sent_types(), "PBEPBDES");
        assert_eq!(exec.io_mut().sent_str(0, 0), "S_1");
        assert_eq!(exec.io_mut().sent_str(3, 0), "S_2");
        // the BEGIN status is swallowed by the shim
        assert!(handler.statuses.is_empty());
        assert_eq!(handler.rows.len(), 1);
        assert_eq!(exec.transaction_status(), TransactionStatus::Open);

        // inside a transaction no further BEGIN is emitted
        exec.io_mut().clear_sent();
        let io = exec.io_mut();
        io.push(mock::bind_complete());
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'T'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, QueryFlags::empty())
            .await
            .unwrap();
        assert_eq!(exec.io_mut().sent_types(), "BES");
        assert_eq!(handler.rows.len(), 1);
    }

    #[tokio::test]
    async fn begin_shim_rejects_unexpected_status() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::command_complete("ROLLBACK"));
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::command_complete("SELECT 0"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, QueryFlags::empty())
            .await
            .unwrap();

        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].sql_state(), "08P01");
    }

    #[tokio::test]
    async fn insert_no_results() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("INSERT INTO t VALUES (?)");
        let mut params = query.create_parameter_list();
        params.set_text(0, "42", 0).unwrap();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::parameter_description(&[23]));
        io.push(mock::no_data());
        io.push(mock::bind_complete());
        io.push(mock::command_complete("INSERT 0 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS | QueryFlags::NO_RESULTS)
            .await
            .unwrap();

        assert_eq!(exec.io_mut().sent_types(), "PDBES");
        // discarded results cap the row transfer at one
        assert_eq!(&exec.io_mut().sent()[3].1[..], &[0, 0, 0, 0, 1]);
        assert_eq!(handler.statuses, vec![("INSERT 0 1".to_string(), 1, 0)]);
        assert!(handler.rows.is_empty());
        // the described parameter type landed in the caller's list
        assert_eq!(params.type_oids(), [23]);
    }

    #[tokio::test]
    async fn composite_statements() {
        let mut exec = executor();
        let query = exec.create_simple_query("BEGIN; SELECT 1; COMMIT");
        let params = ParameterList::new(0);

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::no_data());
        io.push(mock::command_complete("BEGIN"));
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::no_data());
        io.push(mock::command_complete("COMMIT"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();

        assert_eq!(handler.statuses.len(), 2);
        assert_eq!(handler.statuses[0].0, "BEGIN");
        assert_eq!(handler.statuses[1].0, "COMMIT");
        assert_eq!(handler.rows.len(), 1);
        assert_eq!(handler.completions, 1);
        assert_eq!(exec.transaction_status(), TransactionStatus::Idle);
    }

    #[tokio::test]
    async fn batch_sync_windows() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = ParameterList::new(0);

        let io = exec.io_mut();
        for _ in 0..MAX_BUFFERED_QUERIES - 1 {
            io.push(mock::parse_complete());
            io.push(mock::bind_complete());
            io.push(mock::command_complete("SELECT 1"));
        }
        io.push(mock::ready_for_query(b'I'));
        for _ in 0..300 - (MAX_BUFFERED_QUERIES - 1) {
            io.push(mock::parse_complete());
            io.push(mock::bind_complete());
            io.push(mock::command_complete("SELECT 1"));
        }
        io.push(mock::ready_for_query(b'I'));

        let batch: Vec<(&Query, &ParameterList)> = (0..300).map(|_| (&query, &params)).collect();
        let mut handler = CollectingHandler::default();
        exec.execute_batch(
            &batch,
            &mut handler,
            0,
            0,
            SUPPRESS | QueryFlags::ONESHOT | QueryFlags::NO_RESULTS | QueryFlags::NO_METADATA,
        )
        .await
        .unwrap();

        // 300 statements cannot fit one window, the executor must have
        // synced mid-batch to drain the backend
        assert_eq!(exec.io_mut().count_sent(b'S'), 2);
        assert_eq!(handler.statuses.len(), 300);
        assert!(handler.errors.is_empty());
    }

    #[tokio::test]
    async fn disallow_batching_syncs_every_statement() {
        let mut exec = executor();
        let query = exec.create_simple_query("SELECT 1; SELECT 2");
        let params = ParameterList::new(0);

        let io = exec.io_mut();
        io.push(mock::ready_for_query(b'I'));
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(
            &query,
            &params,
            &mut handler,
            0,
            0,
            SUPPRESS
                | QueryFlags::DISALLOW_BATCHING
                | QueryFlags::ONESHOT
                | QueryFlags::NO_RESULTS
                | QueryFlags::NO_METADATA,
        )
        .await
        .unwrap();

        assert_eq!(exec.io_mut().count_sent(b'S'), 3);
        assert_eq!(handler.statuses.len(), 2);
    }

    #[tokio::test]
    async fn forward_cursor_and_fetch() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT * FROM big");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("id", 23)]));
        for i in 0..10 {
            let v = i.to_string();
            io.push(mock::data_row(&[Some(v.as_bytes())]));
        }
        io.push(mock::portal_suspended());
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(
            &query,
            &params,
            &mut handler,
            0,
            10,
            SUPPRESS | QueryFlags::FORWARD_CURSOR,
        )
        .await
        .unwrap();

        assert_eq!(exec.io_mut().sent_types(), "PBDES");
        // bound into a named portal
        assert_eq!(exec.io_mut().sent_str(1, 0), "C_2");
        let batch = &handler.rows[0];
        assert_eq!(batch.tuples.len(), 10);
        let cursor = batch.cursor.clone().expect("suspended execute returns a cursor");
        assert_eq!(cursor.name(), "C_2");

        // continue the open portal
        exec.io_mut().clear_sent();
        let io = exec.io_mut();
        for i in 10..15 {
            let v = i.to_string();
            io.push(mock::data_row(&[Some(v.as_bytes())]));
        }
        io.push(mock::command_complete("SELECT 15"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.fetch(&cursor, &mut handler, 10).await.unwrap();
        assert_eq!(exec.io_mut().sent_types(), "ES");
        let batch = &handler.rows[0];
        assert_eq!(batch.tuples.len(), 5);
        assert!(batch.cursor.is_none(), "completed execute has no continuation");

        // CommandComplete closed the portal, the next safe point sends the Close
        exec.io_mut().clear_sent();
        let io = exec.io_mut();
        io.push(mock::close_complete());
        io.push(mock::bind_complete());
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        let sent = exec.io_mut().sent();
        assert_eq!(sent[0].0, b'C');
        assert_eq!(sent[0].1[0], b'P');
        assert_eq!(exec.io_mut().sent_str(0, 1), "C_2");
    }

    #[tokio::test]
    async fn suspended_portal_is_not_closed() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT * FROM big");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("id", 23)]));
        io.push(mock::data_row(&[Some(&b"0"[..])]));
        io.push(mock::portal_suspended());
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 1, SUPPRESS | QueryFlags::FORWARD_CURSOR)
            .await
            .unwrap();
        let cursor = handler.rows[0].cursor.clone().unwrap();

        // no Close for the suspended portal at the next safe point
        exec.io_mut().clear_sent();
        let io = exec.io_mut();
        io.push(mock::bind_complete());
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(exec.io_mut().sent_types(), "BES");
        drop(cursor);
    }

    #[tokio::test]
    async fn dropped_statement_is_closed() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        drop(query);
        drop(params);

        // the next safe point deallocates S_1
        exec.io_mut().clear_sent();
        let query2 = exec.create_parameterized_query("SELECT 2");
        let params2 = query2.create_parameter_list();
        let io = exec.io_mut();
        io.push(mock::close_complete());
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::data_row(&[Some(&b"2"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query2, &params2, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();

        let sent = exec.io_mut().sent();
        assert_eq!(sent[0].0, b'C');
        assert_eq!(sent[0].1[0], b'S');
        assert_eq!(exec.io_mut().sent_str(0, 1), "S_1");
        assert!(handler.errors.is_empty());
    }

    #[tokio::test]
    async fn parse_skipped_on_reuse() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::command_complete("SELECT 0"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(exec.io_mut().sent_types(), "PBDES");

        exec.io_mut().clear_sent();
        let io = exec.io_mut();
        io.push(mock::bind_complete());
        io.push(mock::command_complete("SELECT 0"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        // no Parse, no Describe: statement and row description are known
        assert_eq!(exec.io_mut().sent_types(), "BES");
    }

    #[tokio::test]
    async fn described_types_are_adopted() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT ?");
        let mut params = query.create_parameter_list();
        params.set_text(0, "42", 0).unwrap();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::parameter_description(&[23]));
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::bind_complete());
        io.push(mock::data_row(&[Some(&b"42"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(exec.io_mut().sent_types(), "PDBES");
        assert_eq!(params.type_oids(), [23]);

        // a fresh list with unspecified types adopts the statement types
        // and does not force a re-Parse
        let mut fresh = query.create_parameter_list();
        fresh.set_text(0, "43", 0).unwrap();

        exec.io_mut().clear_sent();
        let io = exec.io_mut();
        io.push(mock::bind_complete());
        io.push(mock::data_row(&[Some(&b"43"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &fresh, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(exec.io_mut().sent_types(), "BES");
        assert_eq!(fresh.type_oids(), [23]);
    }

    #[tokio::test]
    async fn describe_only() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT ?");
        // unset parameters are allowed when only describing
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::parameter_description(&[25]));
        io.push(mock::row_description(&[("?column?", 25)]));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS | QueryFlags::DESCRIBE_ONLY)
            .await
            .unwrap();

        assert_eq!(exec.io_mut().sent_types(), "PDS");
        assert_eq!(params.type_oids(), [25]);
        assert_eq!(handler.rows.len(), 1);
        assert!(handler.rows[0].tuples.is_empty());
        assert_eq!(handler.rows[0].fields.as_ref().unwrap()[0].type_oid, 25);
        assert!(handler.statuses.is_empty());
    }

    #[tokio::test]
    async fn encoding_change_closes_connection() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::parameter_status("client_encoding", "LATIN1"));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();

        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].sql_state(), "08006");
        assert!(exec.is_closed());

        let err = exec
            .execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap_err();
        assert!(err.is_state(SqlState::ConnectionFailure));
    }

    #[tokio::test]
    async fn encoding_change_tolerated_when_allowed() {
        let mut exec = QueryExecutor::new(
            MockTransport::new(),
            Options::from_properties([("allowEncodingChanges", "true")]),
        );
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::parameter_status("client_encoding", "LATIN1"));
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::command_complete("SELECT 0"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert!(handler.errors.is_empty());
        assert!(!exec.is_closed());
    }

    #[tokio::test]
    async fn datestyle_guard_closes_connection() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::parameter_status("DateStyle", "German"));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(handler.errors[0].sql_state(), "08006");
        assert!(exec.is_closed());
    }

    #[tokio::test]
    async fn standard_conforming_strings_follows_status() {
        let mut exec = executor();
        assert!(exec.standard_conforming_strings());
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::parameter_status("standard_conforming_strings", "off"));
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::command_complete("SELECT 0"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert!(!exec.standard_conforming_strings());
        assert!(handler.errors.is_empty());

        // any other value means we no longer know how to quote
        let io = exec.io_mut();
        io.push(mock::bind_complete());
        io.push(mock::parameter_status("standard_conforming_strings", "maybe"));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(handler.errors[0].sql_state(), "08006");
        assert!(exec.is_closed());
    }

    #[tokio::test]
    async fn copy_in_roundtrip() {
        let mut exec = executor();
        exec.io_mut().push(mock::copy_in_response(2));
        let op = exec.start_copy("COPY t FROM STDIN", true).await.unwrap();
        assert_eq!(op.direction(), CopyDirection::In);
        assert_eq!(op.column_count(), 2);
        assert_eq!(exec.io_mut().sent_types(), "Q");

        // the copy holds the connection exclusively
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();
        let mut handler = CollectingHandler::default();
        let err = exec
            .execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap_err();
        assert!(err.is_state(SqlState::ObjectNotInState));

        exec.write_to_copy(&op, b"1\tfoo\n").await.unwrap();
        exec.write_to_copy(&op, b"2\tbar\n").await.unwrap();
        assert_eq!(exec.io_mut().count_sent(b'd'), 2);

        let io = exec.io_mut();
        io.push(mock::command_complete("COPY 2"));
        io.push(mock::ready_for_query(b'I'));
        let rows = exec.end_copy(&op).await.unwrap();
        assert_eq!(rows, Some(2));

        // the connection is usable again
        exec.io_mut().clear_sent();
        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::command_complete("SELECT 0"));
        io.push(mock::ready_for_query(b'I'));
        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert!(handler.errors.is_empty());
    }

    #[tokio::test]
    async fn copy_must_be_driven_by_its_owner() {
        let mut exec = executor();
        exec.io_mut().push(mock::copy_in_response(1));
        let op = exec.start_copy("COPY t FROM STDIN", true).await.unwrap();

        let stranger = CopyOperation::new(999, CopyDirection::In, 0, vec![]);
        let err = exec.write_to_copy(&stranger, b"x").await.unwrap_err();
        assert!(err.is_state(SqlState::ObjectNotInState));
        let err = exec.end_copy(&stranger).await.unwrap_err();
        assert!(err.is_state(SqlState::ObjectNotInState));

        // reading from a copy-in is also out of state
        let err = exec.read_from_copy(&op).await.unwrap_err();
        assert!(err.is_state(SqlState::ObjectNotInState));
    }

    #[tokio::test]
    async fn copy_cancel_requires_exactly_one_error() {
        let mut exec = executor();
        exec.io_mut().push(mock::copy_in_response(1));
        let op = exec.start_copy("COPY t FROM STDIN", true).await.unwrap();

        let io = exec.io_mut();
        io.push(mock::error_response("57014", "COPY from stdin failed"));
        io.push(mock::ready_for_query(b'I'));
        exec.cancel_copy(&op).await.unwrap();
        assert_eq!(exec.io_mut().count_sent(b'f'), 1);

        // no error response at all is a communication error
        exec.io_mut().clear_sent();
        exec.io_mut().push(mock::copy_in_response(1));
        let op = exec.start_copy("COPY t FROM STDIN", true).await.unwrap();
        exec.io_mut().push(mock::ready_for_query(b'I'));
        let err = exec.cancel_copy(&op).await.unwrap_err();
        assert!(err.is_state(SqlState::CommunicationError));
    }

    #[tokio::test]
    async fn copy_out_stream() {
        let mut exec = executor();
        exec.io_mut().push(mock::copy_out_response(1));
        let op = exec.start_copy("COPY t TO STDOUT", true).await.unwrap();
        assert_eq!(op.direction(), CopyDirection::Out);

        exec.io_mut().push(mock::copy_data(b"1\n"));
        let row = exec.read_from_copy(&op).await.unwrap();
        assert_eq!(row.as_deref(), Some(&b"1\n"[..]));

        let io = exec.io_mut();
        io.push(mock::copy_done());
        io.push(mock::command_complete("COPY 1"));
        io.push(mock::ready_for_query(b'I'));
        let row = exec.read_from_copy(&op).await.unwrap();
        assert!(row.is_none(), "copy ended");

        // lock released at ReadyForQuery
        exec.process_notifies().await.unwrap();
    }

    #[tokio::test]
    async fn copy_out_cancel_uses_cancel_channel() {
        let mut exec = executor();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        exec.set_cancel_channel(tx);

        exec.io_mut().push(mock::copy_out_response(1));
        let op = exec.start_copy("COPY t TO STDOUT", true).await.unwrap();
        exec.cancel_copy(&op).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn copy_rejected_by_plain_execute() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("COPY t FROM STDIN");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::no_data());
        io.push(mock::copy_in_response(1));
        // response to our CopyFail, skipped
        io.push(mock::error_response("57014", "COPY from stdin failed"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();

        // a CopyFail went out so the backend is not left waiting for data
        assert_eq!(exec.io_mut().count_sent(b'f'), 1);
        assert!(!exec.is_closed());
    }

    #[tokio::test]
    async fn copy_out_rejected_by_plain_execute() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("COPY t TO STDOUT");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::no_data());
        io.push(mock::copy_out_response(1));
        io.push(mock::copy_data(b"1\n"));
        io.push(mock::copy_done());
        io.push(mock::command_complete("COPY 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();

        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].sql_state(), "0A000");
    }

    #[tokio::test]
    async fn fastpath_call_with_begin() {
        let mut exec = executor();
        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::command_complete("BEGIN"));
        io.push(mock::ready_for_query(b'T'));
        io.push(mock::function_call_response(Some(&[0, 0, 0, 42])));
        io.push(mock::ready_for_query(b'T'));

        let mut params = exec.create_fastpath_parameters(2);
        params.set_binary(0, &b"\x00\x00\x00\x01"[..], 26).unwrap();
        params.set_binary(1, &b"\x00\x02\x00\x00"[..], 23).unwrap();

        let result = exec.fastpath_call(952, &params, false).await.unwrap();
        assert_eq!(result.as_deref(), Some(&[0u8, 0, 0, 42][..]));
        // BEGIN subprotocol first, then FunctionCall
        assert_eq!(exec.io_mut().sent_types(), "PBESFS");
        assert_eq!(exec.transaction_status(), TransactionStatus::Open);
    }

    #[tokio::test]
    async fn fastpath_null_result() {
        let mut exec = executor();
        let io = exec.io_mut();
        io.push(mock::function_call_response(None));
        io.push(mock::ready_for_query(b'I'));

        let params = exec.create_fastpath_parameters(0);
        let result = exec.fastpath_call(952, &params, true).await.unwrap();
        assert!(result.is_none());
        assert_eq!(exec.io_mut().sent_types(), "FS");
    }

    #[tokio::test]
    async fn fastpath_chains_errors_until_ready() {
        let mut exec = executor();
        let io = exec.io_mut();
        io.push(mock::error_response("42883", "no such function"));
        io.push(mock::error_response("25P02", "transaction aborted"));
        io.push(mock::ready_for_query(b'E'));

        let params = exec.create_fastpath_parameters(0);
        let err = exec.fastpath_call(952, &params, true).await.unwrap_err();
        assert_eq!(err.iter().count(), 2);
        assert_eq!(exec.transaction_status(), TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn subprotocol_begin_treats_warnings_as_errors() {
        let mut exec = executor();
        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::notice_response("implicit transaction"));
        io.push(mock::command_complete("BEGIN"));
        io.push(mock::ready_for_query(b'T'));

        let params = exec.create_fastpath_parameters(0);
        let err = exec.fastpath_call(952, &params, false).await.unwrap_err();
        assert_eq!(err.sql_state(), "01000");
    }

    #[tokio::test]
    async fn empty_query_sentinel() {
        let mut exec = executor();
        let query = exec.create_simple_query("  ;  ");
        assert!(query.is_empty());
        let params = ParameterList::new(0);

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::no_data());
        io.push(mock::empty_query_response());
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(handler.statuses, vec![("EMPTY".to_string(), 0, 0)]);
    }

    #[tokio::test]
    async fn errors_collected_until_ready() {
        let mut exec = executor();
        let query = exec.create_simple_query("SELECT 1; SELECT bogus");
        let params = ParameterList::new(0);

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::error_response("42703", "column bogus does not exist"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();

        assert_eq!(handler.rows.len(), 1);
        assert_eq!(handler.errors.len(), 1);
        assert_eq!(handler.errors[0].sql_state(), "42703");
        assert_eq!(handler.completions, 1);

        // the failed Parse left no statement name behind
        let QueryKind::Composite { subqueries, .. } = &query.kind else {
            panic!("expected composite");
        };
        assert!(subqueries[0].statement_name().is_some());
        assert!(subqueries[1].statement_name().is_none());
    }

    #[tokio::test]
    async fn multiple_errors_are_all_reported() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::error_response("42601", "syntax error"));
        io.push(mock::error_response("08P01", "another one"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap();
        assert_eq!(handler.errors.len(), 2);
    }

    #[tokio::test]
    async fn unset_parameter_fails_before_send() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT ?");
        let params = query.create_parameter_list();

        let mut handler = CollectingHandler::default();
        let err = exec
            .execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap_err();
        assert!(err.is_state(SqlState::InvalidParameterValue));
        assert!(exec.io_mut().sent().is_empty());
    }

    #[tokio::test]
    async fn parameter_count_must_match() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT ?");
        let mut params = ParameterList::new(2);
        params.set_text(0, "1", 0).unwrap();
        params.set_text(1, "2", 0).unwrap();

        let mut handler = CollectingHandler::default();
        let err = exec
            .execute(&query, &params, &mut handler, 0, 0, SUPPRESS)
            .await
            .unwrap_err();
        assert!(err.is_state(SqlState::InvalidParameterValue));
    }

    #[tokio::test]
    async fn both_rows_and_status() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::row_description(&[("?column?", 23)]));
        io.push(mock::data_row(&[Some(&b"1"[..])]));
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(
            &query,
            &params,
            &mut handler,
            0,
            0,
            SUPPRESS | QueryFlags::BOTH_ROWS_AND_STATUS,
        )
        .await
        .unwrap();
        assert_eq!(handler.rows.len(), 1);
        assert_eq!(handler.statuses.len(), 1);
    }

    #[tokio::test]
    async fn no_metadata_skips_describe() {
        let mut exec = executor();
        let query = exec.create_parameterized_query("SELECT 1");
        let params = query.create_parameter_list();

        let io = exec.io_mut();
        io.push(mock::parse_complete());
        io.push(mock::bind_complete());
        io.push(mock::command_complete("SELECT 1"));
        io.push(mock::ready_for_query(b'I'));

        let mut handler = CollectingHandler::default();
        exec.execute(&query, &params, &mut handler, 0, 0, SUPPRESS | QueryFlags::NO_METADATA)
            .await
            .unwrap();
        assert_eq!(exec.io_mut().sent_types(), "PBES");
        assert_eq!(handler.statuses.len(), 1);
    }

    #[tokio::test]
    async fn process_notifies_drains_buffered() {
        let mut exec = executor();
        let io = exec.io_mut();
        io.push(mock::notification(42, "jobs", "ping"));
        io.push(mock::notification(42, "jobs", "pong"));

        exec.process_notifies().await.unwrap();
        let notifications = exec.take_notifications();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].payload, "ping");

        // nothing pending is a no-op
        exec.process_notifies().await.unwrap();
        assert!(exec.take_notifications().is_empty());
    }

    #[tokio::test]
    async fn notifies_skipped_inside_transaction() {
        let mut exec = executor();
        exec.set_transaction_status(TransactionStatus::Open);
        exec.io_mut().push(mock::notification(42, "jobs", "ping"));

        exec.process_notifies().await.unwrap();
        // only drained when idle
        assert!(exec.take_notifications().is_empty());
    }

    #[tokio::test]
    async fn update_count_parsing() {
        struct Check(Vec<(String, u64, u64)>, Vec<Error>);
        impl ResultHandler for Check {
            fn handle_result_rows(
                &mut self,
                _: &SimpleQuery,
                _: Option<std::sync::Arc<[crate::Field]>>,
                _: Vec<Tuple>,
                _: Option<Portal>,
            ) {
            }
            fn handle_command_status(&mut self, status: &str, count: u64, oid: u64) {
                self.0.push((status.to_owned(), count, oid));
            }
            fn handle_warning(&mut self, _: ServerError) {}
            fn handle_error(&mut self, error: Error) {
                self.1.push(error);
            }
        }

        let mut check = Check(Vec::new(), Vec::new());
        interpret_command_status("INSERT 123 7", &mut check);
        interpret_command_status("UPDATE 9", &mut check);
        interpret_command_status("CREATE TABLE", &mut check);
        assert_eq!(
            check.0,
            vec![
                ("INSERT 123 7".to_string(), 7, 123),
                ("UPDATE 9".to_string(), 9, 0),
                ("CREATE TABLE".to_string(), 0, 0),
            ]
        );

        interpret_command_status("UPDATE x", &mut check);
        assert_eq!(check.1.len(), 1);
        assert_eq!(check.0.len(), 3);
    }
}

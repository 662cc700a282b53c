//! Postgres Backend Messages
use bytes::{Buf, Bytes};

use super::{
    Oid,
    error::{ProtocolError, ServerError},
};
use crate::ext::BytesExt;

/// A type that can be decoded from a postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages
///
/// Messages from the startup and authentication phase are not represented;
/// this crate operates on an already-established connection.
#[derive(Debug)]
pub enum BackendMessage {
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    FunctionCallResponse(FunctionCallResponse),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    FunctionCallResponse,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    pub(crate) fn unexpected(&self, phase: &'static str) -> ProtocolError {
        ProtocolError::unexpected_phase(self.msgtype(), phase)
    }
}

macro_rules! assert_msgtype {
    ($self:ident,$typ:ident) => {
        if $self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(stringify!($self), $self::MSGTYPE, $typ));
        }
    };
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: String,
    /// The current value of the parameter
    pub value: String,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterStatus, msgtype);
        Ok(Self {
            name: body.get_nul_string()?,
            value: body.get_nul_string()?,
        })
    }
}

/// Identifies the message as a notification response.
///
/// Sent when a NOTIFY command is executed for a channel the session is
/// listening on.
#[derive(Debug)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: i32,
    /// The name of the channel that the notify has been raised on.
    pub channel: String,
    /// The “payload” string passed from the notifying process.
    pub payload: String,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NotificationResponse, msgtype);
        Ok(Self {
            process_id: body.get_i32(),
            channel: body.get_nul_string()?,
            payload: body.get_nul_string()?,
        })
    }
}

/// A warning message. The frontend should display the message.
///
/// The body has the same field layout as [`ErrorResponse`].
#[derive(Debug, Clone)]
pub struct NoticeResponse {
    pub body: Bytes,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';

    pub fn to_server_error(&self) -> ServerError {
        ServerError::from_fields(self.body.clone())
    }
}

impl std::fmt::Display for NoticeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.to_server_error().fmt(f)
    }
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NoticeResponse, msgtype);
        Ok(NoticeResponse { body })
    }
}

/// Identifies the message as an error
///
/// The message body consists of one or more identified fields, followed by a zero byte as a
/// terminator. Fields can appear in any order.
///
/// For each field there is the following:
///
/// `Byte1` A code identifying the field type; if zero, this is the message terminator and no
/// string follows. Since more field types might be added in future, frontends should silently
/// ignore fields of unrecognized type.
///
/// `String` The field value.
#[derive(Debug)]
pub struct ErrorResponse {
    pub body: Bytes,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    pub fn to_server_error(&self) -> ServerError {
        ServerError::from_fields(self.body.clone())
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ErrorResponse, msgtype);
        Ok(Self { body })
    }
}

/// A single field of a [`RowDescription`] message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// The field name.
    pub name: String,
    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub table_oid: Oid,
    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub column_attr: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see pg_type.typlen).
    /// Note that negative values denote variable-width types.
    pub type_len: i16,
    /// The type modifier (see pg_attribute.atttypmod).
    /// The meaning of the modifier is type-specific.
    pub type_modifier: i32,
    /// The format code being used for the field. Currently will be zero (text)
    /// or one (binary). In a RowDescription returned from the statement variant
    /// of Describe, the format code is not yet known and will always be zero.
    pub format_code: i16,
}

/// Identifies the message as a row description
#[derive(Debug)]
pub struct RowDescription {
    pub fields: Vec<Field>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(RowDescription, msgtype);

        // Specifies the number of fields in a row (can be zero).
        let field_len = body.get_i16();
        let mut fields = Vec::with_capacity(field_len.max(0) as usize);

        for _ in 0..field_len {
            fields.push(Field {
                name: body.get_nul_string()?,
                table_oid: body.get_u32(),
                column_attr: body.get_i16(),
                type_oid: body.get_u32(),
                type_len: body.get_i16(),
                type_modifier: body.get_i32(),
                format_code: body.get_i16(),
            });
        }

        Ok(Self { fields })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub column_len: i16,
    /// Column values, decoded lazily by [`columns`][DataRow::columns].
    pub body: Bytes,
}

/// Failure to materialise a [`DataRow`] into column values.
#[derive(Debug, thiserror::Error)]
pub enum DataRowError {
    #[error("cannot allocate row: {0}")]
    Alloc(#[from] std::collections::TryReserveError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';

    /// Materialise the column values.
    ///
    /// Each column is an `Int32` length (-1 for NULL) followed by that many
    /// bytes. Allocation failure is reported instead of aborting.
    pub fn columns(mut self) -> Result<Vec<Option<Bytes>>, DataRowError> {
        let mut columns = Vec::new();
        columns.try_reserve(self.column_len.max(0) as usize)?;

        for _ in 0..self.column_len {
            if self.body.remaining() < 4 {
                return Err(ProtocolError::truncated(Self::MSGTYPE).into());
            }
            let len = self.body.get_i32();
            if len < 0 {
                columns.push(None);
                continue;
            }
            let len = len as usize;
            if self.body.remaining() < len {
                return Err(ProtocolError::truncated(Self::MSGTYPE).into());
            }
            columns.push(Some(self.body.split_to(len)));
        }

        Ok(columns)
    }
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(DataRow, msgtype);
        let column_len = body.get_i16();
        Ok(Self { column_len, body })
    }
}

/// Identifies the message as a command-completed response
///
/// For an INSERT command, the tag is `INSERT oid rows`. oid used to be the object ID of the
/// inserted row if rows was 1 and the target table had OIDs, but OIDs system columns are not
/// supported anymore; therefore oid is always 0.
///
/// For DELETE / UPDATE / MERGE / SELECT / MOVE / FETCH / COPY, the tag is the command word
/// followed by the affected row count.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which SQL command was completed.
    pub tag: String,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CommandComplete, msgtype);
        Ok(Self {
            tag: body.get_nul_string()?,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type used by the statement.
    pub oids: Vec<Oid>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterDescription, msgtype);
        let param_len = body.get_i16();
        let mut oids = Vec::with_capacity(param_len.max(0) as usize);
        for _ in 0..param_len {
            oids.push(body.get_u32());
        }
        Ok(Self { oids })
    }
}

/// Identifies the message as a Start Copy In response.
///
/// The frontend must now send copy-in data (if not prepared to do so, send a CopyFail message).
#[derive(Debug)]
pub struct CopyInResponse {
    /// 0 indicates the overall COPY format is textual (rows separated by newlines, columns
    /// separated by separator characters, etc.). 1 indicates the overall copy format is binary.
    pub format: i8,
    /// The format codes to be used for each column.
    pub column_formats: Vec<i16>,
}

impl CopyInResponse {
    pub const MSGTYPE: u8 = b'G';
}

/// Identifies the message as a Start Copy Out response.
///
/// This message will be followed by copy-out data.
#[derive(Debug)]
pub struct CopyOutResponse {
    /// The overall COPY format, as in [`CopyInResponse`].
    pub format: i8,
    /// The format codes to be used for each column.
    pub column_formats: Vec<i16>,
}

impl CopyOutResponse {
    pub const MSGTYPE: u8 = b'H';
}

macro_rules! copy_response {
    ($name:ident) => {
        impl BackendProtocol for $name {
            fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!($name, msgtype);
                let format = body.get_i8();
                let column_len = body.get_i16();
                let mut column_formats = Vec::with_capacity(column_len.max(0) as usize);
                for _ in 0..column_len {
                    column_formats.push(body.get_i16());
                }
                Ok(Self { format, column_formats })
            }
        }
    };
}

copy_response!(CopyInResponse);
copy_response!(CopyOutResponse);

/// Identifies the message as COPY data.
#[derive(Debug)]
pub struct CopyData {
    /// Data that forms part of a COPY data stream.
    ///
    /// Messages sent from the backend will always correspond to single data rows.
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CopyData, msgtype);
        Ok(Self { data: body })
    }
}

/// Identifies the message as a COPY-completion indicator.
#[derive(Debug)]
pub struct CopyDone;

impl CopyDone {
    pub const MSGTYPE: u8 = b'c';
}

impl BackendProtocol for CopyDone {
    // Some servers append garbage after the length; tolerate a non-empty body.
    fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CopyDone, msgtype);
        Ok(Self)
    }
}

/// Identifies the message as a function call result.
#[derive(Debug)]
pub struct FunctionCallResponse {
    /// The value of the function result. `None` when the result is NULL.
    pub value: Option<Bytes>,
}

impl FunctionCallResponse {
    pub const MSGTYPE: u8 = b'V';
}

impl BackendProtocol for FunctionCallResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(FunctionCallResponse, msgtype);
        let len = body.get_i32();
        let value = match len {
            -1 => None,
            len => {
                let len = len as usize;
                if body.remaining() < len {
                    return Err(ProtocolError::truncated(Self::MSGTYPE));
                }
                Some(body.split_to(len))
            }
        };
        Ok(Self { value })
    }
}

/// ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator. Possible values are 'I' if idle
    /// (not in a transaction block); 'T' if in a transaction block; or 'E' if in a
    /// failed transaction block (queries will be rejected until block is ended).
    pub status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ReadyForQuery, msgtype);
        if body.remaining() != 1 {
            return Err(ProtocolError::truncated(Self::MSGTYPE));
        }
        Ok(Self { status: body.get_u8() })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!($name, msgtype);
                Ok(Self)
            }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

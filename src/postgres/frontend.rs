//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, BytesMut};

use super::{Oid, PgFormat};
use crate::ext::{BufMutExt, StrExt, UsizeExt};

// Frontend messages not used by this crate:
// CancelRequest
// GSSENCRequest
// GSSENCResponse('p')
// PasswordMessage('p')
// SASLInitialResponse('p')
// SASLResponse('p')
// SSLRequest
// Startup

/// write a frontend message to `buf`
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "[BUG] Frontend Message body not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
pub trait FrontendProtocol {
    /// message type
    const MSGTYPE: u8;

    /// size of the main body
    ///
    /// note that this is *only* the size of main body as oppose of actual postgres message
    fn size_hint(&self) -> i32;

    /// write the main body of the message
    ///
    /// `buf` have the length returned from `size_hint`
    ///
    /// writing less or past length results in panic
    fn encode(self, buf: impl BufMut);
}

/// A bind parameter value, already encoded for the wire.
///
/// `None` is sent as the special -1 length with no value bytes following.
pub type BindValue<'a> = Option<&'a [u8]>;

fn bind_values_size(params: &[BindValue]) -> i32 {
    params.iter().fold(0i32, |acc, p| match p {
        // Int32 length only, -1 for NULL
        None => acc + 4,
        Some(v) => acc + 4 + v.len().to_i32(),
    })
}

fn put_bind_values(buf: &mut impl BufMut, params: &[BindValue]) {
    for param in params {
        match param {
            None => buf.put_i32(-1),
            Some(v) => {
                buf.put_i32(v.len().to_i32());
                buf.put_slice(v);
            }
        }
    }
}

/// Identifies the message as a simple query
#[derive(Debug)]
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a str,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql);
    }
}

/// Identifies the message as a Parse command
#[derive(Debug)]
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub name: &'a str,
    /// The query string to be parsed.
    pub sql: &'a str,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    ///
    /// Note that this is not an indication of the number of parameters that might appear in the
    /// query string, only the number that the frontend wants to prespecify types for.
    pub param_oids: &'a [Oid],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.name.nul_string_len()
            + self.sql.nul_string_len()
            + 2
            + self.param_oids.len().to_i32() * 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.name);
        buf.put_nul_string(self.sql);
        buf.put_i16(self.param_oids.len().to_i16());
        for oid in self.param_oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Bind command.
///
/// The number of result-column format codes sent is always zero: all result
/// columns use the default text format.
#[derive(Debug)]
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub stmt_name: &'a str,
    /// The parameter format codes, one per parameter.
    pub param_formats: &'a [PgFormat],
    /// The parameter values, in the format indicated by the associated format code.
    pub params: &'a [BindValue<'a>],
}

impl Bind<'_> {
    /// Size of the message body, usable before constructing the message to
    /// check the backend's MaxAllocSize limit without i32 overflow.
    pub fn encoded_size(
        portal_name: &str,
        stmt_name: &str,
        params: &[BindValue],
    ) -> u64 {
        let values: u64 = params
            .iter()
            .map(|p| match p {
                None => 4,
                Some(v) => 4 + v.len() as u64,
            })
            .sum();
        portal_name.len() as u64 + 1
            + stmt_name.len() as u64 + 1
            + 2 + params.len() as u64 * 2
            + 2 + values
            + 2
    }
}

impl FrontendProtocol for Bind<'_> {
    const MSGTYPE: u8 = b'B';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len()
            + self.stmt_name.nul_string_len()
            + 2
            + self.param_formats.len().to_i32() * 2
            + 2
            + bind_values_size(self.params)
            + 2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_nul_string(self.stmt_name);

        buf.put_i16(self.param_formats.len().to_i16());
        for format in self.param_formats {
            buf.put_i16(format.format_code());
        }

        buf.put_i16(self.params.len().to_i16());
        put_bind_values(&mut buf, self.params);

        // result-column format codes
        buf.put_i16(0);
    }
}

/// Identifies the message as a Describe command.
#[derive(Debug)]
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as an Execute command
#[derive(Debug)]
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal_name: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_rows: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal_name.nul_string_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal_name);
        buf.put_i32(self.max_rows);
    }
}

/// Identifies the message as a Close command
#[derive(Debug)]
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a function call.
#[derive(Debug)]
pub struct FunctionCall<'a> {
    /// Specifies the object ID of the function to call.
    pub fnid: Oid,
    /// The argument format codes, one per argument.
    pub arg_formats: &'a [PgFormat],
    /// The arguments, in the format indicated by the associated format code.
    pub args: &'a [BindValue<'a>],
    /// The format code for the function result.
    pub result_format: PgFormat,
}

impl FrontendProtocol for FunctionCall<'_> {
    const MSGTYPE: u8 = b'F';

    fn size_hint(&self) -> i32 {
        4 + 2
            + self.arg_formats.len().to_i32() * 2
            + 2
            + bind_values_size(self.args)
            + 2
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u32(self.fnid);
        buf.put_i16(self.arg_formats.len().to_i16());
        for format in self.arg_formats {
            buf.put_i16(format.format_code());
        }
        buf.put_i16(self.args.len().to_i16());
        put_bind_values(&mut buf, self.args);
        buf.put_i16(self.result_format.format_code());
    }
}

/// Identifies the message as COPY data.
#[derive(Debug)]
pub struct CopyData<'a> {
    /// Data that forms part of a COPY data stream. Messages sent from the
    /// frontend might divide the data stream arbitrarily.
    pub data: &'a [u8],
}

impl FrontendProtocol for CopyData<'_> {
    const MSGTYPE: u8 = b'd';

    fn size_hint(&self) -> i32 {
        self.data.len().to_i32()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_slice(self.data);
    }
}

/// Identifies the message as a COPY-failure indicator.
#[derive(Debug)]
pub struct CopyFail<'a> {
    /// An error message to report as the cause of failure.
    pub message: &'a str,
}

impl FrontendProtocol for CopyFail<'_> {
    const MSGTYPE: u8 = b'f';

    fn size_hint(&self) -> i32 {
        self.message.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.message);
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl FrontendProtocol for $name {
            const MSGTYPE: u8 = $ty;

            fn size_hint(&self) -> i32 { 0 }

            fn encode(self, _: impl BufMut) { }
        }
    )*};
}

unit_msg! {
    /// Identifies the message as a Sync command
    struct Sync, b'S';

    /// Identifies the message as a Flush command
    struct Flush, b'H';

    /// Identifies the message as a COPY-completion indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a termination.
    struct Terminate, b'X';
}

//! Protocol level errors.
use bytes::{Buf, Bytes};
use std::str::Utf8Error;

/// An error when translating a buffer from postgres.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type {}", DisplayChar(*.0))]
    Unknown(u8),
    #[error("expected {expect} ({}), found {}", DisplayChar(*.msgtype), DisplayChar(*.found))]
    Unexpected {
        expect: &'static str,
        msgtype: u8,
        found: u8,
    },
    #[error("unexpected message {} during {phase}", DisplayChar(*.found))]
    UnexpectedPhase {
        found: u8,
        phase: &'static str,
    },
    #[error("message {} body shorter than declared", DisplayChar(*.0))]
    Truncated(u8),
    #[error("postgres string is not nul terminated")]
    MissingNul,
    #[error("non utf8 string from postgres: {0}")]
    NonUtf8(Utf8Error),
}

struct DisplayChar(u8);

impl std::fmt::Display for DisplayChar {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.0 {
            c @ (b' '..=b'~') => write!(f, "'{}'", c as char),
            c => write!(f, "0x{c:02x}"),
        }
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unknown(found)
    }

    pub(crate) fn unexpected(expect: &'static str, msgtype: u8, found: u8) -> ProtocolError {
        Self::Unexpected { expect, msgtype, found }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::UnexpectedPhase { found, phase }
    }

    pub(crate) fn truncated(msgtype: u8) -> ProtocolError {
        Self::Truncated(msgtype)
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::MissingNul
    }

    pub(crate) fn non_utf8(err: Utf8Error) -> ProtocolError {
        Self::NonUtf8(err)
    }
}

/// An error or notice reported by the backend.
///
/// Parsed from the `(Byte1 code, String value)*` field list shared by
/// `ErrorResponse` and `NoticeResponse`.
#[derive(Debug, Clone)]
pub struct ServerError {
    severity: String,
    code: String,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
    position: Option<String>,
}

impl ServerError {
    pub(crate) fn from_fields(mut body: Bytes) -> Self {
        let mut me = Self {
            severity: String::new(),
            code: String::new(),
            message: String::new(),
            detail: None,
            hint: None,
            position: None,
        };

        while body.has_remaining() {
            let field = body.get_u8();
            if field == 0 {
                break;
            }
            let end = body
                .iter()
                .position(|e| matches!(e, b'\0'))
                .unwrap_or(body.len());
            let value = String::from_utf8_lossy(&body[..end]).into_owned();
            body.advance(body.remaining().min(end + 1));

            match field {
                b'S' => me.severity = value,
                b'C' => me.code = value,
                b'M' => me.message = value,
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'P' => me.position = Some(value),
                // frontends should silently ignore fields of unrecognized type
                _ => {}
            }
        }

        me
    }

    /// The severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, or LOG.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

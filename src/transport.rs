//! The [`PgTransport`] trait.
use std::io;

use crate::{
    Result,
    postgres::{BackendMessage, FrontendProtocol},
};

/// A buffered stream which can send and receive postgres messages.
///
/// Unlike a higher level transport, `recv` here returns `ErrorResponse` as a
/// *message*: the executor accumulates backend errors until `ReadyForQuery`
/// instead of failing on the first one.
pub trait PgTransport {
    /// Send a message to the backend.
    ///
    /// This does not actually write to the underlying io, implementors
    /// should buffer it. Use [`flush`][PgTransport::flush] to actually send
    /// the buffered messages.
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Actually write buffered messages to the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>>;

    /// Receive one backend message.
    fn recv(&mut self) -> impl Future<Output = Result<BackendMessage>>;

    /// Look at the type code of the next backend message without consuming it.
    fn peek(&mut self) -> impl Future<Output = Result<u8>>;

    /// Whether a backend message (or part of one) can be read without blocking.
    fn has_pending(&mut self) -> bool;
}

impl<P> PgTransport for &mut P
where
    P: PgTransport,
{
    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        P::flush(self)
    }

    fn recv(&mut self) -> impl Future<Output = Result<BackendMessage>> {
        P::recv(self)
    }

    fn peek(&mut self) -> impl Future<Output = Result<u8>> {
        P::peek(self)
    }

    fn has_pending(&mut self) -> bool {
        P::has_pending(self)
    }
}

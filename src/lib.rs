//! PostgreSQL v3 extended-query executor core.
//!
//! This crate is the query-driving middle of a postgres client: it speaks
//! the extended-query subprotocol (Parse/Bind/Describe/Execute/Sync) over
//! an already-established connection, plus the COPY and fastpath
//! subprotocols, and reclaims server-side statements and portals whose
//! client owners are gone.
//!
//! # Examples
//!
//! ```no_run
//! use postex::{Options, PgStream, QueryExecutor, QueryFlags, ResultHandler};
//!
//! # async fn app(socket: tokio::net::TcpStream, handler: &mut dyn ResultHandler) -> postex::Result<()> {
//! // the socket has already gone through startup and authentication
//! let mut executor = QueryExecutor::new(PgStream::new(socket), Options::default());
//!
//! let query = executor.create_parameterized_query("SELECT id, name FROM user WHERE id = ?");
//! let mut params = query.create_parameter_list();
//! params.set_text(0, "420", 0)?;
//!
//! executor.execute(&query, &params, handler, 0, 0, QueryFlags::empty()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Connection establishment, authentication, row decoding and pooling are
//! deliberately out of scope; results are delivered through the
//! [`ResultHandler`] callbacks as raw wire values.

mod ext;

// Protocol
pub mod postgres;

// Component
mod sql;
mod query;
mod params;
mod portal;
mod reclaim;
mod copy;

// Operation
pub mod transport;
mod stream;
pub mod handler;
pub mod executor;

mod error;

#[doc(inline)]
pub use executor::{Options, QueryExecutor, TransactionStatus};
#[doc(inline)]
pub use handler::{QueryFlags, ResultHandler, Tuple};
pub use copy::{CopyDirection, CopyOperation};
pub use params::ParameterList;
pub use portal::Portal;
pub use query::{Query, SimpleQuery};
pub use stream::PgStream;

pub use postgres::backend::{Field, NotificationResponse as Notification};

#[doc(inline)]
pub use error::{Error, ErrorKind, Result, SqlState};

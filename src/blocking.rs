//! Adapting connections whose combined exchange is a blocking call.
//!
//! Plenty of clients only offer a synchronous "write these requests, read that many responses"
//! primitive. [`Blocking`] wraps such a connection in a Tower [`Service`] that runs each exchange on
//! Tokio's blocking thread pool, so it can be handed to a
//! [`PipeliningConn`](crate::PipeliningConn) like any asynchronous connection.
//!
//! ```no_run
//! use tokio_coalesce::blocking::{Blocking, EncodeDecode};
//! use tokio_coalesce::PipeliningConn;
//! use std::io;
//!
//! struct Echo;
//!
//! impl EncodeDecode<String> for Echo {
//!     type Response = String;
//!     type Decode = io::Error;
//!     type Error = io::Error;
//!
//!     fn encode_decode(
//!         &mut self,
//!         requests: Vec<String>,
//!     ) -> Result<Vec<Result<String, io::Error>>, io::Error> {
//!         Ok(requests.into_iter().map(Ok).collect())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let conn = PipeliningConn::new(Blocking::new(Echo));
//! let reply = conn.submit(String::from("hello")).await.unwrap();
//! assert_eq!(reply, "hello");
//! # }
//! ```

use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::{error, fmt};
use tower_service::Service;

/// A connection that performs a combined exchange synchronously.
pub trait EncodeDecode<Request> {
    /// The decoded response for a single request.
    type Response;

    /// The error produced when a single response fails to decode.
    type Decode;

    /// The error produced when the round trip as a whole fails.
    type Error;

    /// Write every request in `requests`, then read back and decode one response per request, in
    /// the same order. Blocks until the round trip is done.
    fn encode_decode(
        &mut self,
        requests: Vec<Request>,
    ) -> Result<Vec<Result<Self::Response, Self::Decode>>, Self::Error>;
}

/// Runs a blocking [`EncodeDecode`] connection on Tokio's blocking pool.
///
/// The connection sits behind a mutex, so clones of a `Blocking` share it and exchanges never
/// overlap, even if the service is driven by something other than a pipelining connection.
pub struct Blocking<C> {
    conn: Arc<Mutex<C>>,
}

impl<C> Blocking<C> {
    /// Wrap the given blocking connection.
    pub fn new(conn: C) -> Self {
        Blocking {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

impl<C> Clone for Blocking<C> {
    fn clone(&self) -> Self {
        Blocking {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<C> fmt::Debug for Blocking<C>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blocking").field("conn", &self.conn).finish()
    }
}

/// An error from a [`Blocking`] exchange.
pub enum BlockingError<E> {
    /// The connection reported that the round trip failed.
    Conn(E),

    /// The connection panicked, either during this exchange or an earlier one.
    Panicked,
}

impl<E> fmt::Display for BlockingError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BlockingError::Conn(ref e) => fmt::Display::fmt(e, f),
            BlockingError::Panicked => f.pad("blocking connection panicked"),
        }
    }
}

impl<E> fmt::Debug for BlockingError<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            BlockingError::Conn(ref e) => write!(f, "Conn({:?})", e),
            BlockingError::Panicked => f.pad("Panicked"),
        }
    }
}

impl<E> error::Error for BlockingError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            BlockingError::Conn(ref e) => Some(e),
            BlockingError::Panicked => None,
        }
    }
}

impl<C, Request> Service<Vec<Request>> for Blocking<C>
where
    C: EncodeDecode<Request> + Send + 'static,
    C::Response: Send + 'static,
    C::Decode: Send + 'static,
    C::Error: Send + 'static,
    Request: Send + 'static,
{
    type Response = Vec<Result<C::Response, C::Decode>>;
    type Error = BlockingError<C::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, requests: Vec<Request>) -> Self::Future {
        let conn = Arc::clone(&self.conn);
        let span = tracing::Span::current();
        let exchange = tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            // a poisoned lock means an earlier exchange panicked halfway through, so the
            // connection may be mid-response
            let mut conn = match conn.lock() {
                Ok(conn) => conn,
                Err(_) => return Err(BlockingError::Panicked),
            };
            tracing::trace!(size = requests.len(), "running blocking exchange");
            conn.encode_decode(requests).map_err(BlockingError::Conn)
        });

        Box::pin(async move {
            match exchange.await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "blocking exchange did not complete");
                    Err(BlockingError::Panicked)
                }
            }
        })
    }
}

//! This crate provides a *pipelining connection* for [Tokio](https://tokio.rs) and
//! [Tower](https://github.com/tower-rs/tower): a wrapper around a single request/response
//! connection that coalesces many concurrently-issued, independent requests into fewer combined
//! round trips.
//!
//! # Combined exchanges
//!
//! Many protocols (Redis being the classic example) let a client write several requests
//! back-to-back and then read the same number of responses, in the same order. Doing so costs
//! one round trip instead of one per request. The connection underneath this crate is assumed to
//! expose exactly that primitive: take a `Vec` of requests, send them all, and hand back one
//! decoded response per request, positionally matched. See [`Exchange`] for the asynchronous
//! form of that contract and [`blocking`] for connections that can only do it synchronously.
//!
//! # Coalescing
//!
//! Callers do not build batches themselves. They each [`submit`](pipelining::PipeliningConn::submit)
//! one request and wait for one response, exactly as they would against an ordinary client. A
//! single coordinating task collects those requests into a batch and flushes it, either when the
//! batch is full or when a short timer armed by the batch's first request runs out, whichever
//! happens first. The results of the combined exchange are then fanned back out, each caller
//! receiving its own response and nobody else's. See the [`pipelining`] module for details.
//!
//! # Transports
//!
//! As with most Tower-facing crates, on-the-wire encoding is left to other crates (like
//! [`async-bincode`](https://docs.rs/async-bincode)). Anything that implements
//! `Service<Vec<Request>>` with a `Vec<Result<Response, _>>` response can act as the underlying
//! connection.
#![deny(missing_docs)]

pub mod blocking;
mod error;
pub use error::Error;
mod exchange;
pub use exchange::Exchange;
pub mod pipelining;
mod wrappers;

pub use pipelining::PipeliningConn;

/// Upper bound on how many queued messages the coordinator handles in one poll before it yields
/// back to the executor.
const YIELD_EVERY: usize = 24;

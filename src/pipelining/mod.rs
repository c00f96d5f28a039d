//! A pipelining connection coalesces concurrently-issued requests into combined exchanges over a
//! single connection.
//!
//! Every request handed to [`PipeliningConn::submit`] joins the *current batch*. A batch is
//! flushed, meaning its requests go out in one [`Exchange`](crate::Exchange) and its responses are
//! fanned back to the waiting callers, as soon as one of the following happens:
//!
//!  - the batch reaches [`Config::batch_size`] requests;
//!  - [`Config::flush_period`] has passed since the batch's *first* request arrived;
//!  - someone calls [`PipeliningConn::flush`].
//!
//! The size threshold keeps the number of round trips low under sustained load, while the flush
//! period bounds how long an isolated request can wait for company. Smaller periods favor
//! latency; larger batch sizes favor throughput.
//!
//! Once a batch starts flushing it is frozen: requests arriving afterwards start a new batch,
//! which keeps collecting while the previous exchange is on the wire. Only one exchange is ever
//! outstanding against the connection, and batches go out in the order they were sealed.
//!
//! Requests within a batch are sent in submission order, and the response at position `i` of the
//! exchange goes to the caller that submitted request `i`. If the exchange as a whole fails, every
//! caller in the batch receives the same [`Error::Exchange`]. A response that fails to decode
//! only fails its own caller with [`Error::Decode`].
//!
//! There is no per-request timeout or cancellation: dropping the future returned by `submit` only
//! discards the response once it arrives. Wrap the connection in a Tower timeout layer if callers
//! need to give up early.

use std::time::Duration;

mod client;
pub use self::client::{Builder, PipeliningConn};
pub use crate::Error;
mod coordinator;

/// Tuning knobs for a [`PipeliningConn`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The maximum number of requests merged into one combined exchange.
    ///
    /// Must be greater than zero.
    pub batch_size: usize,

    /// How long a non-empty batch may wait for more requests before it is flushed anyway.
    ///
    /// The period is measured from the first request of the batch, not the most recent one.
    pub flush_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            batch_size: 10,
            flush_period: Duration::from_micros(150),
        }
    }
}

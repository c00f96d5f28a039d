use crate::Exchange;
use std::sync::Arc;
use std::{error, fmt};

/// An error that occurred while servicing a submitted request.
#[non_exhaustive]
pub enum Error<C, Request>
where
    C: Exchange<Request>,
{
    /// The combined exchange carrying this request failed.
    ///
    /// Every request in the failed batch observes the same error: the `Arc` handed to each caller
    /// points at one shared value. Because that value crosses into every caller's task, the
    /// connection's error type must be `Send + Sync`; a `Box<dyn Error + Send>` needs to be
    /// converted (for example into a `Box<dyn Error + Send + Sync>`) before it can be used here.
    Exchange(Arc<C::Error>),

    /// The exchange succeeded, but the response to this particular request could not be decoded.
    Decode(C::Decode),

    /// The connection returned a different number of responses than requests were sent.
    Desynchronized,

    /// Attempted to issue a request after the connection was closed.
    Closed,

    /// The coordinating task went away before the request was resolved.
    Cancelled,
}

impl<C, Request> fmt::Display for Error<C, Request>
where
    C: Exchange<Request>,
    C::Error: fmt::Display,
    C::Decode: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Exchange(ref e) => write!(f, "combined exchange failed: {}", e),
            Error::Decode(ref e) => write!(f, "failed to decode response: {}", e),
            Error::Desynchronized => f.pad("connection returned the wrong number of responses"),
            Error::Closed => f.pad("pipelining connection is closed"),
            Error::Cancelled => f.pad("request was cancelled internally"),
        }
    }
}

impl<C, Request> fmt::Debug for Error<C, Request>
where
    C: Exchange<Request>,
    C::Error: fmt::Debug,
    C::Decode: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Exchange(ref e) => write!(f, "Exchange({:?})", e),
            Error::Decode(ref e) => write!(f, "Decode({:?})", e),
            Error::Desynchronized => f.pad("Desynchronized"),
            Error::Closed => f.pad("Closed"),
            Error::Cancelled => f.pad("Cancelled"),
        }
    }
}

impl<C, Request> error::Error for Error<C, Request>
where
    C: Exchange<Request>,
    C::Error: error::Error + 'static,
    C::Decode: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Exchange(ref e) => Some(&**e),
            Error::Decode(ref e) => Some(e),
            _ => None,
        }
    }
}

impl<C, Request> Error<C, Request>
where
    C: Exchange<Request>,
{
    /// Returns true if this error came from a failed combined exchange.
    pub fn is_exchange(&self) -> bool {
        matches!(*self, Error::Exchange(_))
    }

    /// Returns true if the request was rejected because the connection was closed.
    pub fn is_closed(&self) -> bool {
        matches!(*self, Error::Closed)
    }
}

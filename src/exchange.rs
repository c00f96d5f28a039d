use std::future::Future;
use std::task::{Context, Poll};
use tower_service::Service;

/// A connection that can carry many requests in one combined round trip.
///
/// An exchange takes the requests of a whole batch, in order, and resolves to one decoded
/// response per request. The response at position `i` must be the one produced for the request at
/// position `i`; the [`PipeliningConn`](crate::PipeliningConn) relies on this to hand every caller
/// its own result.
///
/// Failures come in two flavors. If the round trip itself fails (the connection broke, the peer
/// sent garbage), the exchange resolves to `Err(Self::Error)` and every request in the batch is
/// considered failed. If the round trip went fine but a single response could not be decoded,
/// only that position holds `Err(Self::Decode)`.
///
/// You will rarely implement this trait directly: it is implemented for every
/// [`Service`] that maps `Vec<Request>` to `Vec<Result<Response, D>>`.
pub trait Exchange<Request> {
    /// The decoded response for a single request.
    type Response;

    /// The error produced when a single response fails to decode.
    type Decode;

    /// The error produced when the combined round trip fails.
    type Error;

    /// The future driving one combined round trip.
    type Future: Future<Output = Result<Vec<Result<Self::Response, Self::Decode>>, Self::Error>>;

    /// Returns `Poll::Ready(Ok(()))` once the connection can start another exchange.
    ///
    /// The coordinator never has more than one exchange outstanding, so this is called at most
    /// once between exchanges.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    /// Send every request in `requests` and decode as many responses.
    fn exchange(&mut self, requests: Vec<Request>) -> Self::Future;
}

impl<S, Request, Response, D> Exchange<Request> for S
where
    S: Service<Vec<Request>, Response = Vec<Result<Response, D>>>,
{
    type Response = Response;
    type Decode = D;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::poll_ready(self, cx)
    }

    fn exchange(&mut self, requests: Vec<Request>) -> Self::Future {
        Service::call(self, requests)
    }
}

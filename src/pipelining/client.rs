use super::coordinator::{Coordinator, Message};
use super::Config;
use crate::wrappers::{Command, CommandResult};
use crate::{Error, Exchange};
use futures_util::future::BoxFuture;
use std::fmt;
use std::marker::PhantomData;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tower_service::Service;

/// A handle to a pipelining connection.
///
/// Handles are cheap to clone; all clones feed the same coordinating task and therefore the same
/// batches. The coordinator is spawned onto the current Tokio runtime when the connection is built,
/// and it owns the underlying connection until the pipelining connection is
/// [closed](PipeliningConn::close) or every handle has been dropped.
///
/// Besides the inherent [`submit`](PipeliningConn::submit), the handle implements Tower's
/// [`Service`], so it can sit underneath any stack of Tower middleware.
pub struct PipeliningConn<C, Request>
where
    C: Exchange<Request>,
{
    tx: mpsc::UnboundedSender<Message<C, Request>>,
    config: Config,
}

impl<C, Request> Clone for PipeliningConn<C, Request>
where
    C: Exchange<Request>,
{
    fn clone(&self) -> Self {
        PipeliningConn {
            tx: self.tx.clone(),
            config: self.config,
        }
    }
}

impl<C, Request> fmt::Debug for PipeliningConn<C, Request>
where
    C: Exchange<Request>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeliningConn")
            .field("config", &self.config)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

// ===== Builder =====

/// Builder for [`PipeliningConn`], used to configure batching before the coordinator is spawned.
///
/// # Defaults
///
/// Unless told otherwise the builder uses [`Config::default`]: batches of up to 10 requests, and
/// a flush period of 150 microseconds.
pub struct Builder<C, Request> {
    conn: C,
    config: Config,
    _pd: PhantomData<fn(Request)>,
}

impl<C, Request> Builder<C, Request>
where
    C: Exchange<Request> + Send + 'static,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
    C::Decode: Send + 'static,
    C::Error: Send + Sync + 'static,
    Request: Send + 'static,
{
    fn new(conn: C) -> Self {
        Builder {
            conn,
            config: Config::default(),
            _pd: PhantomData,
        }
    }

    /// Set the maximum number of requests merged into one combined exchange.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is zero.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be greater than zero");
        self.config.batch_size = batch_size;
        self
    }

    /// Set how long a batch may wait, counted from its first request, before it is flushed even
    /// though it is not full.
    pub fn flush_period(mut self, flush_period: Duration) -> Self {
        self.config.flush_period = flush_period;
        self
    }

    /// Replace the whole configuration at once.
    ///
    /// # Panics
    ///
    /// Panics if `config.batch_size` is zero.
    pub fn config(mut self, config: Config) -> Self {
        assert!(config.batch_size > 0, "batch size must be greater than zero");
        self.config = config;
        self
    }

    /// Spawn the coordinator and return a handle to it.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn build(self) -> PipeliningConn<C, Request> {
        PipeliningConn::new_internal(self.conn, self.config)
    }
}

impl<C, Request> fmt::Debug for Builder<C, Request>
where
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("conn", &self.conn)
            .field("config", &self.config)
            .finish()
    }
}

// ===== PipeliningConn =====

impl<C, Request> PipeliningConn<C, Request>
where
    C: Exchange<Request> + Send + 'static,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
    C::Decode: Send + 'static,
    C::Error: Send + Sync + 'static,
    Request: Send + 'static,
{
    /// Construct a new [`PipeliningConn`] over `conn` with the default [`Config`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(conn: C) -> Self {
        Self::builder(conn).build()
    }

    /// Create a new builder wrapping `conn`.
    pub fn builder(conn: C) -> Builder<C, Request> {
        Builder::new(conn)
    }

    fn new_internal(conn: C, config: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(rx, conn, config);
        tokio::spawn(async move {
            let closers = coordinator.await;
            for closer in closers {
                let _ = closer.send(());
            }
        });

        PipeliningConn { tx, config }
    }
}

impl<C, Request> PipeliningConn<C, Request>
where
    C: Exchange<Request>,
{
    /// The configuration this connection was built with.
    pub fn config(&self) -> Config {
        self.config
    }

    /// Returns true once the connection no longer accepts requests.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Submit `req` and wait for its response.
    ///
    /// The request joins the current batch, and the returned future resolves once that batch has
    /// been flushed. If the connection is already closed, this fails with [`Error::Closed`]
    /// without the request ever joining a batch.
    pub async fn submit(&self, req: Request) -> Result<C::Response, Error<C, Request>> {
        let rx = self.enqueue(req)?;
        wait(rx).await
    }

    /// Flush the current batch now, without waiting for it to fill up or for its flush period to
    /// pass.
    ///
    /// This only starts the flush. Callers waiting in [`submit`](PipeliningConn::submit) are
    /// resolved when the exchange completes. Flushing while no batch is collecting does nothing.
    pub fn flush(&self) -> Result<(), Error<C, Request>> {
        self.tx.send(Message::Flush).map_err(|_| Error::Closed)
    }

    /// Close the connection.
    ///
    /// New requests are rejected with [`Error::Closed`] from this point on. Requests that were
    /// already submitted are still flushed, after which the underlying connection is dropped and
    /// this future resolves. Closing an already closed connection fails with [`Error::Closed`].
    pub async fn close(&self) -> Result<(), Error<C, Request>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Message::Close(tx))
            .map_err(|_| Error::Closed)?;
        tracing::debug!("waiting for in-flight requests before closing");
        rx.await.map_err(|_| Error::Cancelled)
    }

    fn enqueue(
        &self,
        req: Request,
    ) -> Result<oneshot::Receiver<CommandResult<C, Request>>, Error<C, Request>> {
        let (tx, rx) = oneshot::channel();
        let span = tracing::Span::current();
        tracing::trace!("issuing request");
        let cmd = Command { req, span, res: tx };
        self.tx
            .send(Message::Submit(cmd))
            .map_err(|_| Error::Closed)?;
        Ok(rx)
    }
}

async fn wait<C, Request>(
    rx: oneshot::Receiver<CommandResult<C, Request>>,
) -> CommandResult<C, Request>
where
    C: Exchange<Request>,
{
    match rx.await {
        Ok(r) => {
            tracing::trace!("response returned");
            r
        }
        Err(_) => Err(Error::Cancelled),
    }
}

impl<C, Request> Service<Request> for PipeliningConn<C, Request>
where
    C: Exchange<Request>,
    C::Response: Send + 'static,
    C::Decode: Send + 'static,
    C::Error: Send + Sync + 'static,
    Request: 'static,
    C: 'static,
{
    type Response = C::Response;
    type Error = Error<C, Request>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.tx.is_closed() {
            Poll::Ready(Err(Error::Closed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let rx = self.enqueue(req);
        Box::pin(async move { wait(rx?).await })
    }
}

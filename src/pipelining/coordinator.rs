use super::Config;
use crate::wrappers::{Command, Pending};
use crate::{Error, Exchange};
use futures_core::ready;
use pin_project::pin_project;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};

/// Stand-in deadline for flush periods too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Everything a [`PipeliningConn`](super::PipeliningConn) handle can ask of the coordinator.
pub(crate) enum Message<C, Request>
where
    C: Exchange<Request>,
{
    Submit(Command<C, Request>),
    Flush,
    Close(oneshot::Sender<()>),
}

/// What caused a batch to be sealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Size,
    Timer,
    Manual,
    Close,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Trigger::Size => "size",
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
            Trigger::Close => "close",
        })
    }
}

/// The batch currently collecting requests, plus the batches already sealed and waiting for the
/// connection.
struct Batches<C, Request>
where
    C: Exchange<Request>,
{
    config: Config,
    current: Vec<Command<C, Request>>,
    /// Whether the flush timer belongs to `current`.
    armed: bool,
    sealed: VecDeque<Vec<Command<C, Request>>>,
}

impl<C, Request> Batches<C, Request>
where
    C: Exchange<Request>,
{
    fn new(config: Config) -> Self {
        Batches {
            config,
            current: Vec::new(),
            armed: false,
            sealed: VecDeque::new(),
        }
    }

    /// Add `cmd` to the current batch, sealing the batch if that fills it.
    ///
    /// Returns true if the flush timer must be (re)started for a freshly opened batch.
    fn accept(&mut self, cmd: Command<C, Request>) -> bool {
        let opened = self.current.is_empty();
        self.current.push(cmd);
        if opened {
            self.armed = true;
        }

        if self.current.len() >= self.config.batch_size {
            self.seal(Trigger::Size);
        }

        opened && self.armed
    }

    /// Freeze the current batch and queue it for the connection.
    ///
    /// A no-op if the current batch is empty, so whichever trigger fires second finds nothing to
    /// do.
    fn seal(&mut self, trigger: Trigger) {
        self.armed = false;
        if self.current.is_empty() {
            return;
        }

        let batch = mem::take(&mut self.current);
        tracing::debug!(size = batch.len(), %trigger, "batch sealed");
        self.sealed.push_back(batch);
    }

    fn is_empty(&self) -> bool {
        self.current.is_empty() && self.sealed.is_empty()
    }
}

/// A combined exchange on the wire, with the callers waiting on it in request order.
struct InFlight<C, Request>
where
    C: Exchange<Request>,
{
    exchange: Pin<Box<C::Future>>,
    pending: Vec<Pending<C, Request>>,
}

impl<C, Request> InFlight<C, Request>
where
    C: Exchange<Request>,
{
    fn start(conn: &mut C, batch: Vec<Command<C, Request>>) -> Self {
        let (requests, pending): (Vec<_>, Vec<_>) = batch.into_iter().map(Command::split).unzip();
        tracing::debug!(size = requests.len(), "starting combined exchange");
        InFlight {
            exchange: Box::pin(conn.exchange(requests)),
            pending,
        }
    }

    /// Drive the exchange, and once it resolves hand every waiting caller its result.
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let result = ready!(self.exchange.as_mut().poll(cx));
        let pending = mem::take(&mut self.pending);

        match result {
            Ok(responses) if responses.len() == pending.len() => {
                tracing::debug!(size = pending.len(), "combined exchange completed");
                for (pending, response) in pending.into_iter().zip(responses) {
                    tracing::trace!(parent: &pending.span, "response arrived; forwarding");
                    pending.send(response.map_err(Error::Decode));
                }
            }
            Ok(responses) => {
                tracing::warn!(
                    sent = pending.len(),
                    received = responses.len(),
                    "connection returned the wrong number of responses"
                );
                for pending in pending {
                    pending.send(Err(Error::Desynchronized));
                }
            }
            Err(e) => fail(pending, e),
        }

        Poll::Ready(())
    }
}

/// Deliver one shared exchange failure to every caller in a batch.
fn fail<C, Request>(pending: Vec<Pending<C, Request>>, e: C::Error)
where
    C: Exchange<Request>,
{
    tracing::debug!(size = pending.len(), "combined exchange failed");
    let e = Arc::new(e);
    for pending in pending {
        tracing::trace!(parent: &pending.span, "exchange failed; forwarding error");
        pending.send(Err(Error::Exchange(Arc::clone(&e))));
    }
}

/// The single task that owns the batches and the underlying connection.
///
/// Resolves once the connection has been closed (explicitly, or by dropping every handle) and
/// every accepted request has been resolved. The output is the list of `close` callers to notify;
/// they are notified only after the coordinator, and with it the connection, has been dropped.
#[pin_project]
pub(crate) struct Coordinator<C, Request>
where
    C: Exchange<Request>,
{
    messages: mpsc::UnboundedReceiver<Message<C, Request>>,
    conn: C,
    batches: Batches<C, Request>,
    #[pin]
    timer: Sleep,
    in_flight: Option<InFlight<C, Request>>,
    closers: Vec<oneshot::Sender<()>>,
    finish: bool,
}

impl<C, Request> Coordinator<C, Request>
where
    C: Exchange<Request>,
{
    pub(crate) fn new(
        messages: mpsc::UnboundedReceiver<Message<C, Request>>,
        conn: C,
        config: Config,
    ) -> Self {
        Coordinator {
            messages,
            conn,
            batches: Batches::new(config),
            timer: tokio::time::sleep(config.flush_period),
            in_flight: None,
            closers: Vec::new(),
            finish: false,
        }
    }
}

impl<C, Request> Future for Coordinator<C, Request>
where
    C: Exchange<Request>,
{
    type Output = Vec<oneshot::Sender<()>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        // track how many times we have iterated
        let mut i = 0;

        if !*this.finish {
            loop {
                match this.messages.poll_recv(cx) {
                    Poll::Ready(Some(Message::Submit(cmd))) => {
                        let now = Instant::now();
                        // the timer may have fired since we last ran; that batch takes no more requests
                        if this.batches.armed && this.timer.deadline() <= now {
                            this.batches.seal(Trigger::Timer);
                        }
                        tracing::trace!(parent: &cmd.span, "request accepted into batch");
                        if this.batches.accept(cmd) {
                            let deadline = now
                                .checked_add(this.batches.config.flush_period)
                                .unwrap_or_else(|| now + FAR_FUTURE);
                            this.timer.as_mut().reset(deadline);
                        }
                    }
                    Poll::Ready(Some(Message::Flush)) => this.batches.seal(Trigger::Manual),
                    Poll::Ready(Some(Message::Close(closer))) => {
                        tracing::debug!("close requested; no longer accepting requests");
                        // requests already queued still arrive before recv returns None
                        this.messages.close();
                        this.closers.push(closer);
                    }
                    Poll::Ready(None) => {
                        *this.finish = true;
                        this.batches.seal(Trigger::Close);
                        break;
                    }
                    Poll::Pending => break,
                }

                // if we have run for a while without yielding, yield so we can make progress
                i += 1;
                if i == crate::YIELD_EVERY {
                    // we're forcing a yield, so need to ensure we get woken up again
                    cx.waker().wake_by_ref();
                    break;
                }
            }
        }

        if this.batches.armed && this.timer.as_mut().poll(cx).is_ready() {
            this.batches.seal(Trigger::Timer);
        }

        loop {
            if let Some(in_flight) = this.in_flight.as_mut() {
                if in_flight.poll(cx).is_pending() {
                    break;
                }
                *this.in_flight = None;
            }

            if this.batches.sealed.is_empty() {
                break;
            }

            match this.conn.poll_ready(cx) {
                Poll::Pending => break,
                Poll::Ready(Err(e)) => {
                    if let Some(batch) = this.batches.sealed.pop_front() {
                        tracing::warn!("connection failed to become ready");
                        let pending = batch.into_iter().map(|cmd| cmd.split().1).collect();
                        fail(pending, e);
                    }
                }
                Poll::Ready(Ok(())) => {
                    if let Some(batch) = this.batches.sealed.pop_front() {
                        *this.in_flight = Some(InFlight::start(this.conn, batch));
                    }
                }
            }
        }

        if *this.finish && this.batches.is_empty() && this.in_flight.is_none() {
            tracing::debug!("all requests resolved; releasing connection");
            return Poll::Ready(mem::take(this.closers));
        }

        Poll::Pending
    }
}

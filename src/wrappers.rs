use crate::{Error, Exchange};

pub(crate) type CommandResult<C, Request> =
    Result<<C as Exchange<Request>>::Response, Error<C, Request>>;

/// One caller's request on its way to the coordinator.
pub(crate) struct Command<C, Request>
where
    C: Exchange<Request>,
{
    pub(crate) req: Request,
    pub(crate) span: tracing::Span,
    pub(crate) res: tokio::sync::oneshot::Sender<CommandResult<C, Request>>,
}

/// The completion side of a [`Command`] once its request has been moved into a batch.
pub(crate) struct Pending<C, Request>
where
    C: Exchange<Request>,
{
    pub(crate) span: tracing::Span,
    pub(crate) res: tokio::sync::oneshot::Sender<CommandResult<C, Request>>,
}

impl<C, Request> Command<C, Request>
where
    C: Exchange<Request>,
{
    pub(crate) fn split(self) -> (Request, Pending<C, Request>) {
        (
            self.req,
            Pending {
                span: self.span,
                res: self.res,
            },
        )
    }
}

impl<C, Request> Pending<C, Request>
where
    C: Exchange<Request>,
{
    pub(crate) fn send(self, result: CommandResult<C, Request>) {
        // ignore send failures
        // the caller may just no longer care about the response
        let _ = self.res.send(result);
    }
}

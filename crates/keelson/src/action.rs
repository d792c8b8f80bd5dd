//! What a step asks the fiber to do next.

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::api::ApiCall;
use crate::error::FiberError;
use crate::response::ResponseStep;
use crate::step::StepId;

/// Result of applying a step or a response step.
pub enum NextAction {
    /// Run `StepId` next, synchronously.
    Continue(StepId),

    /// Park until the [`Resumer`] paired with this handle delivers the next action.
    Suspend(Pending),

    /// Resume at `resume` no earlier than `delay` from now.
    Retry { delay: Duration, resume: StepId },

    /// Issue an API call and hand its outcome to a response step.
    Invoke(Invocation),

    /// The fiber completed.
    Done,

    /// The fiber failed with a classified error.
    Fail(FiberError),
}

impl NextAction {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Continue(_) => "continue",
            Self::Suspend(_) => "suspend",
            Self::Retry { .. } => "retry",
            Self::Invoke(_) => "invoke",
            Self::Done => "done",
            Self::Fail(_) => "fail",
        }
    }

    pub fn invoke(call: ApiCall, response: impl ResponseStep) -> Self {
        Self::Invoke(Invocation::new(call, response))
    }
}

impl fmt::Debug for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue(step) => f.debug_tuple("Continue").field(step).finish(),
            Self::Suspend(_) => f.write_str("Suspend"),
            Self::Retry { delay, resume } => f
                .debug_struct("Retry")
                .field("delay", delay)
                .field("resume", resume)
                .finish(),
            Self::Invoke(invocation) => f.debug_tuple("Invoke").field(invocation).finish(),
            Self::Done => f.write_str("Done"),
            Self::Fail(error) => f.debug_tuple("Fail").field(error).finish(),
        }
    }
}

/// An API call bound to the response step that will receive its outcome.
pub struct Invocation {
    pub(crate) call: ApiCall,
    pub(crate) response: Box<dyn ResponseStep>,
}

impl Invocation {
    pub fn new(call: ApiCall, response: impl ResponseStep) -> Self {
        Self {
            call,
            response: Box::new(response),
        }
    }

    #[must_use]
    pub const fn call(&self) -> &ApiCall {
        &self.call
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("call", &self.call.to_string())
            .field("response", &self.response.name())
            .finish()
    }
}

/// Fiber side of a suspension.
pub struct Pending {
    rx: oneshot::Receiver<NextAction>,
}

/// Waker side of a suspension. Dropping it without resuming fails the
/// parked fiber with a logic error.
#[derive(Debug)]
pub struct Resumer {
    tx: oneshot::Sender<NextAction>,
}

impl Pending {
    #[must_use]
    pub fn channel() -> (Self, Resumer) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, Resumer { tx })
    }

    pub(crate) async fn wait(self) -> NextAction {
        self.rx.await.unwrap_or_else(|_| {
            NextAction::Fail(FiberError::logic("suspension abandoned before resuming"))
        })
    }
}

impl Resumer {
    /// Delivers the fiber's next action. Returns `false` when the fiber is gone.
    pub fn resume(self, action: NextAction) -> bool {
        self.tx.send(action).is_ok()
    }

    /// True once the parked fiber stopped waiting, e.g. after cancellation.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

//! A latched event: once triggered, stays triggered until explicitly
//! replaced. Models the disk-alive / buffer-full conditions the arbiter and
//! buffered write path wait on.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::sim::{Cause, Ctx, Interrupted};

struct Inner {
    triggered: bool,
    cause: Option<Cause>,
    waiters: Vec<Waker>,
}

/// An event that, once triggered, remains triggered until
/// [`Latch::replace`] swaps in a fresh instance. Clones made before a
/// replacement keep referring to the old (now permanently triggered)
/// latch, which is the point: processes that observed the old state don't
/// get silently rewound.
#[derive(Clone)]
pub struct Latch {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                triggered: false,
                cause: None,
                waiters: Vec::new(),
            })),
        }
    }

    /// Builds a latch that starts out already triggered, e.g. a disk that
    /// is alive from the moment its node is constructed. No `Ctx` is needed
    /// since construction can never race a double-trigger.
    pub fn new_triggered(cause: Cause) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                triggered: true,
                cause: Some(cause),
                waiters: Vec::new(),
            })),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.borrow().triggered
    }

    pub fn cause(&self) -> Option<Cause> {
        self.inner.borrow().cause.clone()
    }

    /// Triggers the latch and wakes everyone currently waiting. Calling
    /// this on an already-triggered latch (without [`Latch::replace`]
    /// first) is a double-trigger and raises `InvariantViolation`.
    pub fn succeed(&self, ctx: &Ctx, cause: Cause) {
        let mut inner = self.inner.borrow_mut();
        if inner.triggered {
            drop(inner);
            ctx.raise_invariant("double-trigger of latched event");
            return;
        }
        inner.triggered = true;
        inner.cause = Some(cause);
        let waiters = std::mem::take(&mut inner.waiters);
        drop(inner);
        for w in waiters {
            w.wake();
        }
    }

    /// Swaps in a fresh, untriggered latch. Existing clones of `self` made
    /// before this call are unaffected.
    pub fn replace(&mut self) {
        self.inner = Rc::new(RefCell::new(Inner {
            triggered: false,
            cause: None,
            waiters: Vec::new(),
        }));
    }

    pub fn wait<'a>(&'a self, ctx: &'a Ctx) -> Wait<'a> {
        Wait {
            latch: self,
            ctx,
            registered: false,
        }
    }
}

pub struct Wait<'a> {
    latch: &'a Latch,
    ctx: &'a Ctx,
    registered: bool,
}

impl<'a> Future for Wait<'a> {
    type Output = Result<(), Interrupted>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(cause) = this.ctx.take_interrupt() {
            return Poll::Ready(Err(Interrupted(cause)));
        }
        if this.latch.is_triggered() {
            return Poll::Ready(Ok(()));
        }
        if !this.registered {
            this.registered = true;
            this.latch.inner.borrow_mut().waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CauseReason, Scheduler, Until};

    #[test]
    fn waiters_resume_once_triggered() {
        let sched = Scheduler::new(1);
        let latch = Latch::new();
        let woke = Rc::new(RefCell::new(false));

        let l1 = latch.clone();
        let w1 = woke.clone();
        sched.spawn(move |ctx| async move {
            l1.wait(&ctx).await.unwrap();
            *w1.borrow_mut() = true;
        });

        let l2 = latch.clone();
        sched.spawn(move |ctx| async move {
            ctx.timeout(4.0).await.unwrap();
            l2.succeed(&ctx, Cause::new(CauseReason::Broken, ctx.now()));
        });

        let end = sched.run(Until::Forever).unwrap();
        assert!(*woke.borrow());
        assert_eq!(end, 4.0);
    }

    #[test]
    fn double_trigger_without_replace_is_fatal() {
        let sched = Scheduler::new(1);
        let latch = Latch::new();
        let l = latch.clone();
        sched.spawn(move |ctx| async move {
            l.succeed(&ctx, Cause::new(CauseReason::Broken, ctx.now()));
            l.succeed(&ctx, Cause::new(CauseReason::Broken, ctx.now()));
        });
        let err = sched.run(Until::Forever).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn replace_gives_a_fresh_untriggered_latch() {
        let mut latch = Latch::new();
        let sched = Scheduler::new(1);
        let l = latch.clone();
        sched.spawn(move |ctx| async move {
            l.succeed(&ctx, Cause::new(CauseReason::Broken, ctx.now()));
        });
        sched.run(Until::Forever).unwrap();
        assert!(latch.is_triggered());
        latch.replace();
        assert!(!latch.is_triggered());
    }
}

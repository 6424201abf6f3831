//! A capacity-1 FIFO resource. Released on every exit path from the
//! holding scope, including an interrupt, via [`Guard`]'s `Drop`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::sim::{Ctx, Interrupted};

struct WaiterState {
    granted: bool,
    waker: Option<Waker>,
}

struct Inner {
    locked: bool,
    waiters: VecDeque<Rc<RefCell<WaiterState>>>,
}

#[derive(Clone)]
pub struct Mutex {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.borrow().locked
    }

    pub fn acquire<'a>(&'a self, ctx: &'a Ctx) -> Acquire<'a> {
        Acquire {
            mutex: self,
            ctx,
            state: None,
        }
    }

    /// Hands the lock to the next FIFO waiter, or unlocks if none remain.
    fn release(&self) {
        let mut inner = self.inner.borrow_mut();
        loop {
            let Some(front) = inner.waiters.pop_front() else {
                inner.locked = false;
                return;
            };
            let waker = {
                let mut w = front.borrow_mut();
                w.granted = true;
                w.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
                return;
            }
            // No waker means the waiter already abandoned its wait between
            // registering and this release; try the next one.
        }
    }
}

pub struct Acquire<'a> {
    mutex: &'a Mutex,
    ctx: &'a Ctx,
    state: Option<Rc<RefCell<WaiterState>>>,
}

impl<'a> Future for Acquire<'a> {
    type Output = Result<Guard<'a>, Interrupted>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(cause) = this.ctx.take_interrupt() {
            this.deregister();
            return Poll::Ready(Err(Interrupted(cause)));
        }
        if this.state.is_none() {
            let mut inner = this.mutex.inner.borrow_mut();
            if !inner.locked {
                inner.locked = true;
                return Poll::Ready(Ok(Guard { mutex: this.mutex }));
            }
            let state = Rc::new(RefCell::new(WaiterState {
                granted: false,
                waker: Some(cx.waker().clone()),
            }));
            inner.waiters.push_back(state.clone());
            drop(inner);
            this.state = Some(state);
            return Poll::Pending;
        }
        let state = this.state.as_ref().unwrap().clone();
        if state.borrow().granted {
            this.state = None;
            Poll::Ready(Ok(Guard { mutex: this.mutex }))
        } else {
            state.borrow_mut().waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<'a> Acquire<'a> {
    fn deregister(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        if state.borrow().granted {
            // Ownership passed to us while we were abandoning: pass it
            // straight on so the next FIFO waiter isn't starved forever.
            self.mutex.release();
        } else {
            self.mutex
                .inner
                .borrow_mut()
                .waiters
                .retain(|w| !Rc::ptr_eq(w, &state));
        }
    }
}

impl<'a> Drop for Acquire<'a> {
    fn drop(&mut self) {
        self.deregister();
    }
}

/// Held while the mutex is locked; releases on drop, including when the
/// holding scope unwinds from an interrupt.
pub struct Guard<'a> {
    mutex: &'a Mutex,
}

impl<'a> Drop for Guard<'a> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

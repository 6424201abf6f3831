//! The virtual-time executor: a binary heap of `(time, sequence)` wake-ups
//! driving a set of cooperatively-scheduled processes.
//!
//! Each process is an ordinary `async fn`, compiled by rustc into a
//! `Future`. There is no OS-thread parallelism and no real-time reactor —
//! polling a task's `Future` is the only way it makes progress, and the only
//! thing that decides when a task gets polled is this heap. Suspension
//! futures (`Timeout`, and the resource futures in [`crate::resources`])
//! either push a heap entry keyed by a deadline directly, or stash a
//! [`Waker`] that a resource invokes when it becomes ready; both paths
//! bottom out in [`Reactor::wake_task`].

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use ordered_float::OrderedFloat;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::SimError;
use crate::sim::interrupt::Cause;

/// Identifies a spawned process. Stable for the scheduler's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    time: OrderedFloat<f64>,
    seq: u64,
    task: TaskId,
}

struct TaskSlot {
    future: Pin<Box<dyn Future<Output = ()>>>,
    interrupts: VecDeque<Cause>,
    done: bool,
    join_waiters: Vec<Waker>,
}

struct Reactor {
    now: f64,
    seq: u64,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    tasks: HashMap<TaskId, TaskSlot>,
    next_task_id: u64,
    rng: SmallRng,
    fatal: Option<SimError>,
}

impl Reactor {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn raise_invariant(&mut self, message: impl Into<String>) {
        if self.fatal.is_none() {
            self.fatal = Some(SimError::invariant(message));
        }
    }

    fn wake_task(&mut self, task: TaskId) {
        if !self.tasks.contains_key(&task) {
            // The task may have legitimately finished already; only a
            // reference to a task that never existed is a bug.
            return;
        }
        let seq = self.next_seq();
        let time = self.now;
        self.heap.push(Reverse(HeapEntry {
            time: OrderedFloat(time),
            seq,
            task,
        }));
    }
}

// --- waking without a real thread-safe Waker -------------------------------
//
// `std::task::Wake` requires `Send + Sync` because it's built for the common
// multi-threaded executor. Ours is single-threaded, so we build the
// `RawWaker` by hand over a `Weak<RefCell<Reactor>>`: `wake` upgrades it and
// pushes a heap entry for the owning task. Never send this `Waker` across a
// thread boundary — nothing here is `Send`.

struct WakerPayload {
    reactor: Weak<RefCell<Reactor>>,
    task: TaskId,
}

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    let rc = unsafe { Rc::from_raw(ptr as *const WakerPayload) };
    let cloned = Rc::clone(&rc);
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn wake_raw(ptr: *const ()) {
    let rc = unsafe { Rc::from_raw(ptr as *const WakerPayload) };
    if let Some(reactor) = rc.reactor.upgrade() {
        reactor.borrow_mut().wake_task(rc.task);
    }
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    let rc = unsafe { Rc::from_raw(ptr as *const WakerPayload) };
    if let Some(reactor) = rc.reactor.upgrade() {
        reactor.borrow_mut().wake_task(rc.task);
    }
    std::mem::forget(rc);
}

unsafe fn drop_raw(ptr: *const ()) {
    drop(unsafe { Rc::from_raw(ptr as *const WakerPayload) });
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

fn make_waker(reactor: Weak<RefCell<Reactor>>, task: TaskId) -> Waker {
    let payload = Rc::new(WakerPayload { reactor, task });
    let raw = RawWaker::new(Rc::into_raw(payload) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}

/// Owns the scheduler state: the heap, the task table, and the RNG.
#[derive(Clone)]
pub struct Scheduler(Rc<RefCell<Reactor>>);

/// The handle threaded through every simulation process, analogous to
/// `simpy`'s `env`. All suspension methods — `timeout`, and the resource
/// primitives in [`crate::resources`] — are reached through this type.
#[derive(Clone)]
pub struct Ctx {
    reactor: Rc<RefCell<Reactor>>,
    task: TaskId,
}

/// Governs when [`Scheduler::run`] stops popping events.
#[derive(Clone, Copy, Debug)]
pub enum Until {
    /// Stop once the next event's time is strictly greater than this.
    Time(f64),
    /// Stop once the named process has completed.
    Sentinel(TaskId),
    /// Run until the event queue drains.
    Forever,
}

impl Scheduler {
    pub fn new(seed: u64) -> Self {
        Scheduler(Rc::new(RefCell::new(Reactor {
            now: 0.0,
            seq: 0,
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            next_task_id: 0,
            rng: SmallRng::seed_from_u64(seed),
            fatal: None,
        })))
    }

    pub fn now(&self) -> f64 {
        self.0.borrow().now
    }

    /// Registers a new cooperative process, immediately executing it until
    /// its first suspension.
    pub fn spawn<F, Fut>(&self, make: F) -> ProcessHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let task = {
            let mut r = self.0.borrow_mut();
            r.next_task_id += 1;
            TaskId(r.next_task_id)
        };
        let ctx = Ctx {
            reactor: self.0.clone(),
            task,
        };
        let fut = make(ctx);
        {
            let mut r = self.0.borrow_mut();
            r.tasks.insert(
                task,
                TaskSlot {
                    future: Box::pin(fut),
                    interrupts: VecDeque::new(),
                    done: false,
                    join_waiters: Vec::new(),
                },
            );
        }
        self.poll_task(task);
        ProcessHandle {
            reactor: self.0.clone(),
            task,
        }
    }

    fn poll_task(&self, task: TaskId) {
        let taken = {
            let mut r = self.0.borrow_mut();
            match r.tasks.get_mut(&task) {
                Some(slot) if !slot.done => Some(std::mem::replace(
                    &mut slot.future,
                    Box::pin(std::future::pending()),
                )),
                _ => None,
            }
        };
        let Some(mut fut) = taken else { return };
        let waker = make_waker(Rc::downgrade(&self.0), task);
        let mut cx = Context::from_waker(&waker);
        let poll = fut.as_mut().poll(&mut cx);
        let mut r = self.0.borrow_mut();
        match poll {
            Poll::Ready(()) => {
                let waiters = {
                    let slot = r.tasks.get_mut(&task).expect("task present");
                    slot.done = true;
                    slot.future = Box::pin(std::future::ready(()));
                    std::mem::take(&mut slot.join_waiters)
                };
                drop(r);
                for w in waiters {
                    w.wake();
                }
            }
            Poll::Pending => {
                if let Some(slot) = r.tasks.get_mut(&task) {
                    slot.future = fut;
                }
            }
        }
    }

    /// Drains the event queue according to `until`. Returns the final
    /// virtual time, or the first `InvariantViolation` raised along the way.
    pub fn run(&self, until: Until) -> crate::error::Result<f64> {
        loop {
            if let Some(err) = self.0.borrow().fatal.clone() {
                return Err(err);
            }
            let next = {
                let r = self.0.borrow();
                r.heap.peek().map(|Reverse(e)| (e.time.0, e.task))
            };
            let Some((time, task)) = next else { break };
            if let Until::Time(t) = until {
                if time > t {
                    break;
                }
            }
            {
                let mut r = self.0.borrow_mut();
                r.heap.pop();
                r.now = time;
            }
            self.poll_task(task);
            if let Until::Sentinel(sentinel) = until {
                let done = self
                    .0
                    .borrow()
                    .tasks
                    .get(&sentinel)
                    .map(|s| s.done)
                    .unwrap_or(true);
                if done {
                    break;
                }
            }
        }
        if let Some(err) = self.0.borrow().fatal.clone() {
            return Err(err);
        }
        Ok(self.0.borrow().now)
    }
}

impl Ctx {
    pub fn now(&self) -> f64 {
        self.reactor.borrow().now
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Spawns a child process sharing this simulation's clock and RNG.
    pub fn spawn<F, Fut>(&self, make: F) -> ProcessHandle
    where
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        Scheduler(self.reactor.clone()).spawn(make)
    }

    /// Pops the next queued interrupt for this process, if any. Suspension
    /// futures call this as the very first thing on every poll.
    pub fn take_interrupt(&self) -> Option<Cause> {
        self.reactor
            .borrow_mut()
            .tasks
            .get_mut(&self.task)
            .and_then(|s| s.interrupts.pop_front())
    }

    /// Interrupts `target` with `cause`. Multiple interrupts delivered
    /// before the target resumes are queued and delivered one per
    /// resumption, in arrival order. A no-op against a process that has
    /// already finished.
    pub fn interrupt(&self, target: TaskId, cause: Cause) {
        let mut r = self.reactor.borrow_mut();
        let now = r.now;
        match r.tasks.get_mut(&target) {
            None => r.raise_invariant(format!("interrupt of unknown process {target:?}")),
            Some(slot) if slot.done => {}
            Some(slot) => {
                slot.interrupts.push_back(cause);
                let seq = r.next_seq();
                r.heap.push(Reverse(HeapEntry {
                    time: OrderedFloat(now),
                    seq,
                    task: target,
                }));
            }
        }
    }

    /// Suspends for `delay` virtual seconds. A negative delay is an
    /// invariant violation that aborts the run.
    pub fn timeout(&self, delay: f64) -> Timeout {
        if delay < 0.0 {
            self.reactor
                .borrow_mut()
                .raise_invariant(format!("negative-time delay: {delay}"));
        }
        Timeout {
            ctx: self.clone(),
            deadline: self.now() + delay.max(0.0),
            registered: false,
        }
    }

    /// A uniform draw in `[0, 1)` from the simulation's seeded RNG.
    pub fn uniform01(&self) -> f64 {
        self.reactor.borrow_mut().rng.random::<f64>()
    }

    pub fn raise_invariant(&self, message: impl Into<String>) {
        self.reactor.borrow_mut().raise_invariant(message);
    }
}

/// A suspension that resolves after a fixed amount of virtual time, or
/// early with [`crate::sim::Interrupted`].
pub struct Timeout {
    ctx: Ctx,
    deadline: f64,
    registered: bool,
}

impl Future for Timeout {
    type Output = Result<(), crate::sim::Interrupted>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(cause) = this.ctx.take_interrupt() {
            return Poll::Ready(Err(crate::sim::Interrupted(cause)));
        }
        if this.ctx.now() >= this.deadline {
            return Poll::Ready(Ok(()));
        }
        if !this.registered {
            this.registered = true;
            let mut r = this.ctx.reactor.borrow_mut();
            let seq = r.next_seq();
            let time = this.deadline;
            r.heap.push(Reverse(HeapEntry {
                time: OrderedFloat(time),
                seq,
                task: this.ctx.task,
            }));
        }
        Poll::Pending
    }
}

/// A handle to a spawned process: awaitable from another process via
/// [`ProcessHandle::join`], or passed to [`Ctx::interrupt`].
#[derive(Clone)]
pub struct ProcessHandle {
    reactor: Rc<RefCell<Reactor>>,
    task: TaskId,
}

impl ProcessHandle {
    pub fn id(&self) -> TaskId {
        self.task
    }

    pub fn is_done(&self) -> bool {
        self.reactor
            .borrow()
            .tasks
            .get(&self.task)
            .map(|s| s.done)
            .unwrap_or(true)
    }

    /// Awaits this process's completion from another process. `ctx` is
    /// accepted (and unused) so call sites read the same as every other
    /// suspension primitive in this module.
    pub fn join<'a>(&'a self, _ctx: &'a Ctx) -> Join<'a> {
        Join {
            handle: self,
            registered: false,
        }
    }
}

pub struct Join<'a> {
    handle: &'a ProcessHandle,
    registered: bool,
}

impl<'a> Future for Join<'a> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.handle.is_done() {
            return Poll::Ready(());
        }
        if !this.registered {
            this.registered = true;
            let waker = cx.waker().clone();
            let mut r = this.handle.reactor.borrow_mut();
            if let Some(slot) = r.tasks.get_mut(&this.handle.task) {
                slot.join_waiters.push(waker);
            }
        }
        Poll::Pending
    }
}

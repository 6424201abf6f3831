//! A single cluster node: its disk (driven through the fair-share arbiter),
//! its write-back buffer, its NIC counter, and the memory-controller mutex
//! that serializes buffer ingestion. Grounded in `node.py`'s `Node` class,
//! generalized from a demo with one hard-coded disk into the full arbiter
//! protocol of spec.md §4.3 and the buffered write path of §4.4.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexSet;
use tracing::{debug, trace, warn};

use crate::resources::{BoundedCounter, Latch, Mutex};
use crate::sim::{any_of2, Cause, CauseReason, Ctx, Either, ProcessHandle, TaskId};

/// The short deadline a disk writer waits on an ideal-rate `get` before
/// abandoning the attempt and restarting at step 1. Tuned, not derived
/// (spec.md §9 Open Questions).
pub const ARBITER_GET_DEADLINE: f64 = 0.01;

/// A large constant standing in for the node's memory bandwidth: the rate
/// at which bytes move from the client packet into the write-back buffer.
/// Chosen far above any configured disk or NIC rate so the buffer never
/// meaningfully throttles ingestion itself.
pub const MEMORY_SPEED_BYTES_PER_SEC: f64 = 10.0 * 1024.0 * 1024.0 * 1024.0;

/// The flush loop's wake period. Not part of the §6 configuration table;
/// kept as an internal tuning constant (see DESIGN.md).
pub const FLUSH_INTERVAL_SECONDS: f64 = 5.0;

/// A writer's key in a node's arbiter state. Distinct from a disk-write
/// descriptor's local event-id: the writer id identifies the *process*
/// competing for disk, the event-id identifies the *request*.
pub type WriterId = TaskId;

/// Stable node identifier. Cheaply clonable (string data is reference
/// counted), used as a hash-map key throughout the switch, namenode, and
/// per-node arbiter bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Rc<str>);

impl NodeId {
    pub fn new(s: impl Into<Rc<str>>) -> Self {
        NodeId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId::new(s)
    }
}

/// A single in-flight disk-write request. `written_bytes` is
/// non-decreasing and terminates at exactly `total_bytes` (spec.md §3
/// invariant 4).
#[derive(Debug, Clone)]
pub struct DiskWriteDescriptor {
    pub event_id: u64,
    pub total_bytes: u64,
    pub written_bytes: u64,
    pub speed: u64,
    pub writer: WriterId,
}

struct ArbiterState {
    next_event_id: u64,
    active_writers: IndexSet<WriterId>,
    descriptors: HashMap<u64, DiskWriteDescriptor>,
}

struct NodeInner {
    id: NodeId,
    disk_capacity_bytes: u64,
    disk_rate: BoundedCounter,
    buffer: BoundedCounter,
    nic: BoundedCounter,
    mem_ctrl: Mutex,
    disk_alive: RefCell<Latch>,
    buffer_full: RefCell<Latch>,
    flush_interval: f64,
    arbiter: RefCell<ArbiterState>,
}

/// One cluster node: a disk (peak rate + buffer), a NIC, and the
/// memory-controller mutex. Cheap to clone (reference-counted); every
/// process that touches a node's resources holds its own clone.
#[derive(Clone)]
pub struct Node(Rc<NodeInner>);

impl Node {
    pub fn new(
        id: NodeId,
        disk_capacity_bytes: u64,
        disk_peak_rate: u64,
        default_bandwidth: u64,
        disk_buffer_capacity: u64,
    ) -> Self {
        Self::with_flush_interval(
            id,
            disk_capacity_bytes,
            disk_peak_rate,
            default_bandwidth,
            disk_buffer_capacity,
            FLUSH_INTERVAL_SECONDS,
        )
    }

    pub fn with_flush_interval(
        id: NodeId,
        disk_capacity_bytes: u64,
        disk_peak_rate: u64,
        default_bandwidth: u64,
        disk_buffer_capacity: u64,
        flush_interval: f64,
    ) -> Self {
        Node(Rc::new(NodeInner {
            id,
            disk_capacity_bytes,
            disk_rate: BoundedCounter::new(disk_peak_rate, disk_peak_rate),
            buffer: BoundedCounter::new(disk_buffer_capacity, disk_buffer_capacity),
            nic: BoundedCounter::new(default_bandwidth, default_bandwidth),
            mem_ctrl: Mutex::new(),
            disk_alive: RefCell::new(Latch::new_triggered(Cause::new(
                CauseReason::UserDefined("initially alive".into()),
                0.0,
            ))),
            buffer_full: RefCell::new(Latch::new()),
            flush_interval,
            arbiter: RefCell::new(ArbiterState {
                next_event_id: 0,
                active_writers: IndexSet::new(),
                descriptors: HashMap::new(),
            }),
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.0.id
    }

    pub fn disk_capacity_bytes(&self) -> u64 {
        self.0.disk_capacity_bytes
    }

    pub fn nic(&self) -> BoundedCounter {
        self.0.nic.clone()
    }

    pub fn disk_rate(&self) -> BoundedCounter {
        self.0.disk_rate.clone()
    }

    fn disk_alive(&self) -> Latch {
        self.0.disk_alive.borrow().clone()
    }

    fn buffer_full(&self) -> Latch {
        self.0.buffer_full.borrow().clone()
    }

    /// Current descriptor state for a given request. Descriptors are
    /// retained past completion (see [`Node::retire`]), so this stays
    /// answerable after the writer has finished and is useful to tests
    /// asserting on `written_bytes`/`total_bytes` at completion (spec.md §3
    /// invariant 4).
    pub fn descriptor(&self, event_id: u64) -> Option<DiskWriteDescriptor> {
        self.0.arbiter.borrow().descriptors.get(&event_id).cloned()
    }

    /// Looks up a completed (or in-flight) descriptor by the writer that
    /// issued it rather than its event-id, for callers that only kept a
    /// [`crate::sim::ProcessHandle`]/[`WriterId`] around.
    pub fn descriptor_for_writer(&self, writer: WriterId) -> Option<DiskWriteDescriptor> {
        self.0
            .arbiter
            .borrow()
            .descriptors
            .values()
            .find(|d| d.writer == writer)
            .cloned()
    }

    pub fn active_writer_count(&self) -> usize {
        self.0.arbiter.borrow().active_writers.len()
    }

    fn next_event_id(&self) -> u64 {
        let mut state = self.0.arbiter.borrow_mut();
        state.next_event_id += 1;
        state.next_event_id
    }

    fn mark_active(&self, writer: WriterId, event_id: u64, total_bytes: u64) {
        let mut state = self.0.arbiter.borrow_mut();
        state.active_writers.insert(writer);
        state.descriptors.insert(
            event_id,
            DiskWriteDescriptor {
                event_id,
                total_bytes,
                written_bytes: 0,
                speed: 0,
                writer,
            },
        );
    }

    fn set_progress(&self, event_id: u64, written_bytes: u64, speed: u64) {
        if let Some(d) = self.0.arbiter.borrow_mut().descriptors.get_mut(&event_id) {
            d.written_bytes = written_bytes;
            d.speed = speed;
        }
    }

    /// Drops `writer` from the active set so it stops counting toward
    /// `active_count()`. Deliberately leaves its descriptor in place: the
    /// completed `written_bytes`/`total_bytes` state is the only
    /// observable record that the arbiter honored the request in full
    /// (spec.md §3 invariant 4), and callers use [`Node::descriptor`]/
    /// [`Node::descriptor_for_writer`] to check it after the writer
    /// finishes.
    fn retire(&self, writer: WriterId, _event_id: u64) {
        let mut state = self.0.arbiter.borrow_mut();
        state.active_writers.shift_remove(&writer);
    }

    fn active_writers_except(&self, writer: WriterId) -> Vec<WriterId> {
        self.0
            .arbiter
            .borrow()
            .active_writers
            .iter()
            .copied()
            .filter(|w| *w != writer)
            .collect()
    }

    fn active_count(&self) -> u64 {
        self.0.arbiter.borrow().active_writers.len().max(1) as u64
    }

    fn interrupt_other_writers(&self, ctx: &Ctx, writer: WriterId, reason: CauseReason) {
        for peer in self.active_writers_except(writer) {
            ctx.interrupt(peer, Cause::new(reason.clone(), ctx.now()));
        }
    }

    /// Un-latches `disk_alive` after `delay`, then interrupts every active
    /// writer with cause `Broken`. Writers loop back to waiting on the
    /// (now fresh, untriggered) latch.
    pub fn break_disk(&self, ctx: &Ctx, delay: f64) -> ProcessHandle {
        let node = self.clone();
        ctx.spawn(move |ctx| async move {
            if ctx.timeout(delay).await.is_err() {
                return;
            }
            node.0.disk_alive.borrow_mut().replace();
            warn!(node = %node.id(), "disk broken");
            let writers: Vec<WriterId> =
                node.0.arbiter.borrow().active_writers.iter().copied().collect();
            for w in writers {
                ctx.interrupt(w, Cause::new(CauseReason::Broken, ctx.now()));
            }
        })
    }

    /// Re-triggers the current `disk_alive` latch after `delay`, resuming
    /// every writer blocked on it with their already-written bytes intact.
    pub fn repair_disk(&self, ctx: &Ctx, delay: f64) -> ProcessHandle {
        let node = self.clone();
        ctx.spawn(move |ctx| async move {
            if ctx.timeout(delay).await.is_err() {
                return;
            }
            let latch = node.disk_alive();
            latch.succeed(&ctx, Cause::new(CauseReason::Release, ctx.now()));
            debug!(node = %node.id(), "disk repaired");
        })
    }

    /// Spawns the direct (unbuffered) disk-write protocol of spec.md §4.3
    /// for `total_bytes`. Returns once every byte has been written.
    pub fn spawn_disk_write(&self, parent: &Ctx, total_bytes: u64) -> ProcessHandle {
        let node = self.clone();
        parent.spawn(move |ctx| async move {
            node.disk_write(ctx, total_bytes).await;
        })
    }

    async fn disk_write(&self, ctx: Ctx, total_bytes: u64) {
        let writer: WriterId = ctx.task_id();
        let event_id = self.next_event_id();
        self.mark_active(writer, event_id, total_bytes);

        let disk_rate = self.0.disk_rate.clone();
        let mut written: u64 = 0;
        let mut current_speed: u64 = 0;

        'retry: loop {
            // Step 1: wait for the disk to be alive.
            loop {
                let latch = self.disk_alive();
                if latch.wait(&ctx).await.is_ok() {
                    break;
                }
            }

            // Step 2: release whatever we're holding if there's idle room.
            if current_speed > 0 {
                let idle = disk_rate.level();
                if idle > 0 {
                    let give_back = current_speed.min(idle);
                    disk_rate.put(give_back);
                    current_speed -= give_back;
                    self.set_progress(event_id, written, current_speed);
                }
            }

            // Step 3: recompute the equal share.
            let ideal = disk_rate.capacity() / self.active_count();
            let idle = disk_rate.level();

            if ideal <= idle {
                // Step 4: enough idle rate exists; race the grant against a
                // short deadline so a losing writer doesn't deadlock.
                let outcome = any_of2(disk_rate.get(&ctx, ideal), ctx.timeout(ARBITER_GET_DEADLINE)).await;
                match outcome {
                    Either::Left(Err(_interrupted)) => continue 'retry,
                    Either::Right(_) => continue 'retry,
                    Either::Left(Ok(())) => {
                        current_speed = ideal;
                        self.set_progress(event_id, written, current_speed);
                        let eta = (total_bytes - written) as f64 / current_speed as f64;
                        let start = ctx.now();
                        trace!(node = %self.id(), event_id, ideal, eta, "disk grant");
                        match ctx.timeout(eta).await {
                            Ok(()) => {
                                written = total_bytes;
                                self.set_progress(event_id, written, current_speed);
                                break 'retry;
                            }
                            Err(crate::sim::Interrupted(cause)) => {
                                let elapsed = (cause.time - start).max(0.0);
                                written = (written + (current_speed as f64 * elapsed) as u64).min(total_bytes);
                                self.set_progress(event_id, written, current_speed);
                                continue 'retry;
                            }
                        }
                    }
                }
            } else {
                // Step 5: not enough idle rate. Back off, then force
                // incumbents to reconsider their share.
                let backoff = ctx.uniform01();
                let _ = ctx.timeout(backoff).await;
                self.interrupt_other_writers(&ctx, writer, CauseReason::NeedsDisk);
                continue 'retry;
            }
        }

        // Step 6: cleanup.
        self.retire(writer, event_id);
        if current_speed > 0 {
            disk_rate.put(current_speed);
        }
        self.interrupt_other_writers(&ctx, writer, CauseReason::Release);
        debug!(node = %self.id(), event_id, total_bytes, "disk write complete");
    }

    /// Spawns the write-back buffered path of spec.md §4.4: bytes land in
    /// the node's memory buffer at `MEMORY_SPEED_BYTES_PER_SEC` and the
    /// request completes once buffered, independent of when the background
    /// flush loop later drains them to disk.
    pub fn spawn_buffered_write(&self, parent: &Ctx, total_bytes: u64) -> ProcessHandle {
        let node = self.clone();
        parent.spawn(move |ctx| async move {
            node.buffered_write(ctx, total_bytes).await;
        })
    }

    async fn buffered_write(&self, ctx: Ctx, total_bytes: u64) {
        let mem_ctrl = self.0.mem_ctrl.clone();
        let buffer = self.0.buffer.clone();
        let mut written: u64 = 0;

        while written < total_bytes {
            let guard = match mem_ctrl.acquire(&ctx).await {
                Ok(guard) => guard,
                Err(_interrupted) => continue,
            };

            let level = buffer.level();
            if level == 0 {
                drop(guard);
                let _ = ctx.timeout(ctx.uniform01()).await;
                continue;
            }

            let w = (total_bytes - written).min(level);
            if buffer.get(&ctx, w).await.is_err() {
                drop(guard);
                continue;
            }

            match ctx.timeout(w as f64 / MEMORY_SPEED_BYTES_PER_SEC).await {
                Ok(()) => {
                    written += w;
                    if buffer.level() == 0 {
                        let latch = self.buffer_full();
                        // Another concurrent writer may have already tripped
                        // this same latch before the flush loop replaced it.
                        if !latch.is_triggered() {
                            latch.succeed(
                                &ctx,
                                Cause::new(CauseReason::UserDefined("buffer full".into()), ctx.now()),
                            );
                        }
                    }
                }
                Err(_interrupted) => {
                    // The chunk never reached the buffer; give the space back.
                    buffer.put(w);
                }
            }
            drop(guard);
        }
        trace!(node = %self.id(), total_bytes, "buffered write complete");
    }

    /// The background drain: wakes on buffer-full or on `flush_interval`,
    /// whichever comes first, and returns the buffered bytes to free space
    /// after an exclusive-flush delay. A known simplification (spec.md §9):
    /// it does not arbitrate against concurrent direct writers on the same
    /// disk.
    pub fn spawn_flush_loop(&self, parent: &Ctx) -> ProcessHandle {
        let node = self.clone();
        parent.spawn(move |ctx| async move {
            node.flush_loop(ctx).await;
        })
    }

    async fn flush_loop(&self, ctx: Ctx) {
        let buffer = self.0.buffer.clone();
        let disk_rate = self.0.disk_rate.clone();
        loop {
            let latch = self.buffer_full();
            let _ = any_of2(latch.wait(&ctx), ctx.timeout(self.0.flush_interval)).await;

            let used = buffer.capacity() - buffer.level();
            if used > 0 {
                let wait_secs = used as f64 / disk_rate.capacity() as f64;
                let _ = ctx.timeout(wait_secs).await;
                buffer.put(used);
                trace!(node = %self.id(), used, "flushed buffer to disk");
            }
            self.0.buffer_full.borrow_mut().replace();
        }
    }
}

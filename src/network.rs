//! The switch: a per-hop network transfer contended through two NIC
//! counters, plus the periodic heartbeat/block-report ping loops built on
//! top of it. Grounded in `node.py`'s `Switch` class (`process_ping`,
//! `heartbeat_ping`), generalized to a registry of independently
//! start/stoppable heartbeat jobs (spec.md §4.5).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use crate::error::{Result, SimError};
use crate::node::{Node, NodeId};
use crate::sim::Ctx;

/// Fixed per-hop latency paid at the start and end of every transfer, not
/// modeled as contended (spec.md §3).
pub const DEFAULT_LATENCY_SECONDS: f64 = 0.01;

struct HeartbeatJob {
    active: Rc<Cell<bool>>,
    #[allow(dead_code)]
    interval: f64,
}

struct SwitchInner {
    latency: f64,
    nodes: RefCell<HashMap<NodeId, Node>>,
    heartbeats: RefCell<HashMap<(NodeId, NodeId), HeartbeatJob>>,
}

/// Map from node id to node, plus the fixed per-hop latency and the
/// heartbeat registry. Cheap to clone (reference-counted).
#[derive(Clone)]
pub struct Switch(Rc<SwitchInner>);

impl Switch {
    pub fn new(latency: f64) -> Self {
        Switch(Rc::new(SwitchInner {
            latency,
            nodes: RefCell::new(HashMap::new()),
            heartbeats: RefCell::new(HashMap::new()),
        }))
    }

    pub fn latency(&self) -> f64 {
        self.0.latency
    }

    pub fn add_node(&self, node: Node) {
        self.0.nodes.borrow_mut().insert(node.id().clone(), node);
    }

    pub fn node(&self, id: &NodeId) -> Result<Node> {
        self.0
            .nodes
            .borrow()
            .get(id)
            .cloned()
            .ok_or_else(|| SimError::configuration(format!("unknown node id: {id}")))
    }

    /// Transfers `size` bytes from `src` to `dst`, contending for both
    /// endpoints' NIC counters. `throttle`, if given, caps the rate below
    /// whatever the two NICs would otherwise agree on (used for
    /// regeneration traffic). TCP slow-start is not modeled: once a rate is
    /// granted, the whole remaining size is sent at that rate.
    pub async fn process_ping(&self, ctx: &Ctx, src: NodeId, dst: NodeId, size: u64, throttle: Option<u64>) -> Result<()> {
        let src_node = self.node(&src)?;
        let dst_node = self.node(&dst)?;
        let src_nic = src_node.nic();
        let dst_nic = dst_node.nic();

        let mut sent: u64 = 0;
        while sent < size {
            let mut rate = src_nic.level().min(dst_nic.level());
            if let Some(t) = throttle {
                rate = rate.min(t);
            }
            if rate == 0 {
                let _ = ctx.timeout(ctx.uniform01()).await;
                continue;
            }

            // No other process can run between this check and the paired
            // decrement (single-threaded cooperative scheduling), so the
            // pair either both succeed here or neither does.
            if !src_nic.try_get(rate) {
                continue;
            }
            if !dst_nic.try_get(rate) {
                src_nic.put(rate);
                continue;
            }

            let _ = ctx.timeout(self.0.latency).await;
            let remaining = size - sent;
            let start = ctx.now();
            match ctx.timeout(remaining as f64 / rate as f64).await {
                Ok(()) => sent += remaining,
                Err(crate::sim::Interrupted(cause)) => {
                    let elapsed = (cause.time - start).max(0.0);
                    sent = (sent + (rate as f64 * elapsed) as u64).min(size);
                }
            }
            let _ = ctx.timeout(self.0.latency).await;
            src_nic.put(rate);
            dst_nic.put(rate);
            trace!(%src, %dst, rate, sent, size, "ping progress");
        }
        Ok(())
    }

    /// Spawns a process that loops: one ping, one timeout of `interval`,
    /// until [`Switch::stop_heartbeat`] removes its registry entry.
    /// `ConfigurationError` if either endpoint is unknown.
    pub fn start_heartbeat(&self, ctx: &Ctx, src: NodeId, dst: NodeId, size: u64, interval: f64) -> Result<()> {
        self.node(&src)?;
        self.node(&dst)?;

        let active = Rc::new(Cell::new(true));
        self.0
            .heartbeats
            .borrow_mut()
            .insert((src.clone(), dst.clone()), HeartbeatJob { active: active.clone(), interval });

        let switch = self.clone();
        ctx.spawn(move |ctx| async move {
            while active.get() {
                let _ = switch.process_ping(&ctx, src.clone(), dst.clone(), size, None).await;
                if !active.get() {
                    break;
                }
                let _ = ctx.timeout(interval).await;
            }
        });
        Ok(())
    }

    pub fn stop_heartbeat(&self, src: &NodeId, dst: &NodeId) {
        if let Some(job) = self.0.heartbeats.borrow_mut().remove(&(src.clone(), dst.clone())) {
            job.active.set(false);
        }
    }

    pub fn heartbeat_count(&self) -> usize {
        self.0.heartbeats.borrow().len()
    }
}

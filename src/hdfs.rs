//! The NameNode/DataNode glue and the `Cluster` façade that drives the
//! replicated-write pipeline and block regeneration. Grounded in
//! `hdfs.py`'s `HDFS` class and `create_hdfs` factory (recovered per
//! SPEC_FULL.md §4.7), restructured around the scheduler/resource types in
//! [`crate::sim`] and [`crate::node`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Result, SimError};
use crate::network::{Switch, DEFAULT_LATENCY_SECONDS};
use crate::node::{Node, NodeId};
use crate::sim::{all_of, Ctx, ProcessHandle, Scheduler, Until};

/// A node's total on-disk storage capacity, bytes. Not part of the §6
/// configuration table; kept as an internal constant (`node.py`'s default).
const DEFAULT_DISK_CAPACITY_BYTES: u64 = 320 * 1024 * 1024 * 1024;

/// Payload size of a block-report ping, piggy-backed on the heartbeat
/// mechanism with its own interval (SPEC_FULL.md §4.7).
const BLOCK_REPORT_SIZE_BYTES: u64 = 16 * 1024;

const CLIENT_ID: &str = "client";
const NAMENODE_ID: &str = "namenode";

/// Picks `k` distinct elements from `items` uniformly at random, without
/// replacement, using the scheduler's seeded RNG via `ctx.uniform01()`.
/// A partial Fisher-Yates shuffle, so it stays deterministic under replay.
fn sample_without_replacement(ctx: &Ctx, items: &[NodeId], k: usize) -> Vec<NodeId> {
    let mut pool: Vec<NodeId> = items.to_vec();
    let n = pool.len();
    let k = k.min(n);
    for i in 0..k {
        let remaining = n - i;
        let offset = ((ctx.uniform01() * remaining as f64) as usize).min(remaining - 1);
        pool.swap(i, i + offset);
    }
    pool.truncate(k);
    pool
}

/// A thin wrapper around [`Node`] marking it as a datanode, distinguishing
/// it from the client and namenode identities in the switch's node table
/// (mirrors `hdfs.py`'s `DataNode` subclass of `Node`).
#[derive(Clone)]
pub struct DataNode(Node);

impl DataNode {
    pub fn new(node: Node) -> Self {
        DataNode(node)
    }

    pub fn id(&self) -> &NodeId {
        self.0.id()
    }

    pub fn node(&self) -> &Node {
        &self.0
    }
}

struct NameNodeInner {
    id: NodeId,
    node: Node,
    datanodes: Rc<RefCell<IndexMap<NodeId, DataNode>>>,
    files: RefCell<HashMap<String, Vec<NodeId>>>,
}

/// Maps file names to the datanode sequence holding their replicas, and
/// picks placement for new files. Grounded in `hdfs.py`'s `NameNode`
/// (recovered, not present in the distilled spec.md beyond being named as
/// an external collaborator).
#[derive(Clone)]
pub struct NameNode(Rc<NameNodeInner>);

impl NameNode {
    fn new(id: NodeId, node: Node, datanodes: Rc<RefCell<IndexMap<NodeId, DataNode>>>) -> Self {
        NameNode(Rc::new(NameNodeInner {
            id,
            node,
            datanodes,
            files: RefCell::new(HashMap::new()),
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.0.id
    }

    pub fn node(&self) -> &Node {
        &self.0.node
    }

    pub fn datanode_ids(&self) -> Vec<NodeId> {
        self.0.datanodes.borrow().keys().cloned().collect()
    }

    /// Picks `replica_number` distinct datanodes to host a new file. Does
    /// not consult existing block placement (spec.md §9 Open Questions:
    /// preserved as-is from the original's random policy stand-in).
    pub fn find_datanodes_for_new_file(&self, ctx: &Ctx, replica_number: usize) -> Vec<NodeId> {
        let ids = self.datanode_ids();
        sample_without_replacement(ctx, &ids, replica_number)
    }

    /// A file appears in metadata only once every replica packet that
    /// composes it has been acknowledged (spec.md §3 invariant 5) — callers
    /// only reach this after joining every packet-pipeline process.
    pub fn register_file(&self, file_name: &str, replicas: Vec<NodeId>) {
        self.0.files.borrow_mut().insert(file_name.to_string(), replicas);
    }

    pub fn file_replicas(&self, file_name: &str) -> Option<Vec<NodeId>> {
        self.0.files.borrow().get(file_name).cloned()
    }

    pub fn file_count(&self) -> usize {
        self.0.files.borrow().len()
    }
}

struct ClusterInner {
    config: Config,
    scheduler: Scheduler,
    switch: Switch,
    client_id: NodeId,
    namenode: NameNode,
    datanodes: Rc<RefCell<IndexMap<NodeId, DataNode>>>,
    services_started: RefCell<bool>,
}

/// The cluster façade: `put_files`, `regenerate_blocks`, `run_until`,
/// `run_forever`. Named for clarity over the original's bare `HDFS` class
/// (SPEC_FULL.md §6). Cheap to clone (reference-counted); every spawned
/// process holds its own clone.
#[derive(Clone)]
pub struct Cluster(Rc<ClusterInner>);

impl Cluster {
    pub fn new(config: Config) -> Self {
        let scheduler = Scheduler::new(config.seed);
        let switch = Switch::new(DEFAULT_LATENCY_SECONDS);

        let client_id = NodeId::new(CLIENT_ID);
        let client_node = Node::new(client_id.clone(), 0, config.default_disk_speed, config.default_bandwidth, 0);
        switch.add_node(client_node);

        let namenode_id = NodeId::new(NAMENODE_ID);
        let namenode_node = Node::new(
            namenode_id.clone(),
            DEFAULT_DISK_CAPACITY_BYTES,
            config.default_disk_speed,
            config.default_bandwidth,
            0,
        );
        switch.add_node(namenode_node.clone());

        let datanodes = Rc::new(RefCell::new(IndexMap::new()));
        let namenode = NameNode::new(namenode_id, namenode_node, datanodes.clone());

        let cluster = Cluster(Rc::new(ClusterInner {
            config: config.clone(),
            scheduler,
            switch,
            client_id,
            namenode,
            datanodes,
            services_started: RefCell::new(false),
        }));

        for i in 0..config.number_of_datanodes {
            cluster.add_datanode(NodeId::new(format!("datanode{i}")));
        }
        cluster
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    pub fn switch(&self) -> &Switch {
        &self.0.switch
    }

    pub fn namenode(&self) -> &NameNode {
        &self.0.namenode
    }

    pub fn client_id(&self) -> NodeId {
        self.0.client_id.clone()
    }

    pub fn datanode(&self, id: &NodeId) -> Option<DataNode> {
        self.0.datanodes.borrow().get(id).cloned()
    }

    pub fn datanode_ids(&self) -> Vec<NodeId> {
        self.0.datanodes.borrow().keys().cloned().collect()
    }

    pub fn now(&self) -> f64 {
        self.0.scheduler.now()
    }

    /// Registers a new datanode with the switch and namenode, and starts
    /// its background write-back flush loop if the datanode cache is
    /// enabled (SPEC_FULL.md §4.4).
    pub fn add_datanode(&self, id: NodeId) -> DataNode {
        let node = Node::new(
            id.clone(),
            DEFAULT_DISK_CAPACITY_BYTES,
            self.0.config.default_disk_speed,
            self.0.config.default_bandwidth,
            self.0.config.disk_buffer,
        );
        self.0.switch.add_node(node.clone());
        let datanode = DataNode::new(node.clone());
        self.0.datanodes.borrow_mut().insert(id, datanode.clone());
        if self.0.config.enable_datanode_cache {
            self.0.scheduler.spawn(move |ctx| async move {
                node.spawn_flush_loop(&ctx);
            });
        }
        datanode
    }

    /// Starts heartbeats and block reports, each independently gated by its
    /// configuration flag, skipping (and logging) a service that has no
    /// datanodes to serve rather than failing the whole run (spec.md §7).
    /// Idempotent: a second call is a no-op so `run_until`/`run_forever`
    /// can be called repeatedly without spawning duplicate loops.
    pub fn start_services(&self, ctx: &Ctx) {
        if *self.0.services_started.borrow() {
            return;
        }
        *self.0.services_started.borrow_mut() = true;

        if self.0.config.enable_heartbeats {
            self.start_heartbeats(ctx);
        }
        if self.0.config.enable_block_report {
            self.start_block_reports(ctx);
        }
    }

    fn start_heartbeats(&self, ctx: &Ctx) {
        let datanode_ids = self.datanode_ids();
        if datanode_ids.is_empty() {
            error!("fail to start HDFS heartbeat: no datanode exists");
            return;
        }
        for id in datanode_ids {
            if let Err(err) = self.0.switch.start_heartbeat(
                ctx,
                id.clone(),
                self.0.namenode.id().clone(),
                self.0.config.heartbeat_size,
                self.0.config.heartbeat_interval,
            ) {
                warn!(datanode = %id, %err, "could not start heartbeat");
            }
        }
        info!("started HDFS heartbeat");
    }

    fn start_block_reports(&self, ctx: &Ctx) {
        let datanode_ids = self.datanode_ids();
        if datanode_ids.is_empty() {
            error!("fail to start block report: no datanode exists");
            return;
        }
        for id in datanode_ids {
            if let Err(err) = self.0.switch.start_heartbeat(
                ctx,
                id.clone(),
                self.0.namenode.id().clone(),
                BLOCK_REPORT_SIZE_BYTES,
                self.0.config.block_report_interval,
            ) {
                warn!(datanode = %id, %err, "could not start block report");
            }
        }
        info!("started HDFS block report");
    }

    /// Drives `count` file writes of `size` bytes through the full
    /// replicated pipeline and returns the virtual completion time.
    pub fn put_files(&self, count: u64, size: u64) -> Result<f64> {
        let cluster = self.clone();
        let handles: Rc<RefCell<Vec<ProcessHandle>>> = Rc::new(RefCell::new(Vec::new()));
        let handles2 = handles.clone();
        let sentinel = self.0.scheduler.spawn(move |ctx| async move {
            cluster.start_services(&ctx);
            let mut hs = Vec::with_capacity(count as usize);
            for i in 0..count {
                let file_name = format!("hello.txt.{i}");
                hs.push(cluster.spawn_put_file(&ctx, file_name, size));
            }
            *handles2.borrow_mut() = hs.clone();
            all_of(&ctx, &hs).await;
        });
        self.0.scheduler.run(Until::Sentinel(sentinel.id()))
    }

    fn spawn_put_file(&self, parent: &Ctx, file_name: String, size: u64) -> ProcessHandle {
        let cluster = self.clone();
        parent.spawn(move |ctx| async move {
            cluster.put_file(ctx, file_name, size).await;
        })
    }

    async fn put_file(&self, ctx: Ctx, file_name: String, size: u64) {
        if ctx.timeout(self.0.switch.latency()).await.is_err() {
            return;
        }
        let replicas = self
            .0
            .namenode
            .find_datanodes_for_new_file(&ctx, self.0.config.replica_number);
        let mut sequence = vec![self.0.client_id.clone()];
        sequence.extend(replicas.iter().cloned());
        info!(file = %file_name, ?sequence, "placement chosen");

        let packet_size = self.0.config.client_write_packet_size;
        let mut sent = 0u64;
        let mut packets = Vec::new();
        while sent < size {
            let chunk = packet_size.min(size - sent);
            packets.push(self.spawn_packet_pipeline(&ctx, sequence.clone(), chunk, None));
            sent += chunk;
        }
        all_of(&ctx, &packets).await;

        self.0.namenode.register_file(&file_name, replicas);
        info!(file = %file_name, "all ACKs collected, put_file finished");
    }

    /// Walks `sequence` hop by hop: a network transfer followed by a disk
    /// write (buffered or direct per config) at the receiving datanode.
    /// Each hop completes before the next begins (spec.md §4.6 step 2).
    fn spawn_packet_pipeline(&self, parent: &Ctx, sequence: Vec<NodeId>, packet_size: u64, throttle: Option<u64>) -> ProcessHandle {
        let cluster = self.clone();
        parent.spawn(move |ctx| async move {
            for pair in sequence.windows(2) {
                let (from, to) = (pair[0].clone(), pair[1].clone());
                if let Err(err) = cluster.0.switch.process_ping(&ctx, from.clone(), to.clone(), packet_size, throttle).await {
                    warn!(%from, %to, %err, "hop transfer failed");
                    return;
                }
                let Some(datanode) = cluster.datanode(&to) else {
                    // The client/namenode identities never receive a write.
                    continue;
                };
                let handle = if cluster.0.config.enable_datanode_cache {
                    datanode.node().spawn_buffered_write(&ctx, packet_size)
                } else {
                    datanode.node().spawn_disk_write(&ctx, packet_size)
                };
                handle.join(&ctx).await;
            }
        })
    }

    /// Picks `count` pairs of distinct datanodes uniformly at random
    /// (without respecting actual block placement, spec.md §9 Open
    /// Questions) and replicates one block-sized transfer per pair, capped
    /// at `balance_bandwidth`.
    pub fn regenerate_blocks(&self, count: u64) -> Result<f64> {
        let cluster = self.clone();
        let sentinel = self.0.scheduler.spawn(move |ctx| async move {
            cluster.start_services(&ctx);
            let ids = cluster.datanode_ids();
            if ids.len() < 2 {
                error!("fail to regenerate blocks: fewer than two datanodes exist");
                return;
            }
            let mut handles = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let pair = sample_without_replacement(&ctx, &ids, 2);
                let sequence = vec![pair[0].clone(), pair[1].clone()];
                handles.push(cluster.spawn_packet_pipeline(
                    &ctx,
                    sequence,
                    cluster.0.config.block_size,
                    Some(cluster.0.config.balance_bandwidth),
                ));
            }
            all_of(&ctx, &handles).await;
        });
        self.0.scheduler.run(Until::Sentinel(sentinel.id()))
    }

    /// Starts services and advances the clock to exactly `until`.
    pub fn run_until(&self, until: f64) -> Result<f64> {
        let cluster = self.clone();
        self.0.scheduler.spawn(move |ctx| async move {
            cluster.start_services(&ctx);
        });
        self.0.scheduler.run(Until::Time(until))
    }

    /// Starts services and drains the event queue until nothing is left
    /// scheduled (only terminates if no perpetual process, such as a
    /// heartbeat or the flush loop, keeps re-arming itself).
    pub fn run_forever(&self) -> Result<f64> {
        let cluster = self.clone();
        self.0.scheduler.spawn(move |ctx| async move {
            cluster.start_services(&ctx);
        });
        self.0.scheduler.run(Until::Forever)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(number_of_datanodes: usize) -> Config {
        Config {
            number_of_datanodes,
            ..Config::default()
        }
    }

    #[test]
    fn put_one_file_registers_exactly_one_entry_of_replica_length() {
        let cluster = Cluster::new(config(11));
        cluster.put_files(1, 100 * 1024 * 1024).unwrap();
        assert_eq!(cluster.namenode().file_count(), 1);
        let replicas = cluster.namenode().file_replicas("hello.txt.0").unwrap();
        assert_eq!(replicas.len(), cluster.config().replica_number);
    }

    #[test]
    fn thirty_files_take_longer_than_one() {
        let single = Cluster::new(config(40)).put_files(1, 64 * 1024 * 1024).unwrap();
        let many = Cluster::new(config(40)).put_files(30, 64 * 1024 * 1024).unwrap();
        assert!(many > single);
    }

    #[test]
    fn throttled_disks_amplify_finish_time() {
        let mut fast = config(11);
        fast.default_disk_speed = 80 * 1024 * 1024;
        let fast_time = Cluster::new(fast).put_files(30, 64 * 1024 * 1024).unwrap();

        let mut slow = config(11);
        slow.default_disk_speed = 2 * 1024 * 1024;
        let slow_time = Cluster::new(slow).put_files(30, 64 * 1024 * 1024).unwrap();

        assert!(slow_time > fast_time);
    }

    #[test]
    fn cache_toggle_does_not_change_registered_metadata() {
        let mut cached = config(11);
        cached.enable_datanode_cache = true;
        let c1 = Cluster::new(cached);
        c1.put_files(5, 4 * 1024 * 1024).unwrap();

        let mut direct = config(11);
        direct.enable_datanode_cache = false;
        let c2 = Cluster::new(direct);
        c2.put_files(5, 4 * 1024 * 1024).unwrap();

        for i in 0..5 {
            let name = format!("hello.txt.{i}");
            // Compare the recorded node sequence itself, not just its
            // length: the cache toggle must change finish times only, not
            // which datanodes the placement policy picked.
            assert_eq!(
                c1.namenode().file_replicas(&name),
                c2.namenode().file_replicas(&name),
            );
        }
    }

    #[test]
    fn heartbeats_do_not_speed_up_regeneration() {
        let mut no_services = config(20);
        no_services.enable_heartbeats = false;
        no_services.enable_block_report = false;
        let quiet_time = Cluster::new(no_services).regenerate_blocks(30).unwrap();

        let with_services = config(20);
        let loud_time = Cluster::new(with_services).regenerate_blocks(30).unwrap();

        assert!(quiet_time <= loud_time);
    }
}

//! `blocksim` is a discrete-event simulator of an HDFS-like replicated block
//! store, built to study how a single limp-mode node (a degraded disk or a
//! choked network link) propagates into cluster-wide latency.
//!
//! The simulator never moves real bytes. It models time: a virtual-time
//! scheduler drives cooperative processes that contend for bounded
//! counters, mutexes, and latched events, and a fair-share disk arbiter
//! re-partitions each disk's throughput across its concurrently active
//! writers as writers come and go.

pub mod config;
pub mod error;
pub mod hdfs;
pub mod network;
pub mod node;
pub mod resources;
pub mod sim;

pub use config::Config;
pub use error::SimError;
pub use hdfs::{Cluster, DataNode, NameNode};
pub use network::Switch;
pub use node::{Node, NodeId};

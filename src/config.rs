//! Every option in spec.md §6's configuration table, plus the seed that
//! drives the scheduler's RNG (SPEC_FULL.md §6 Seeding). Loadable from an
//! optional TOML scenario file and overridable by CLI flags, mirroring how
//! the teacher layers file-based configuration under flag overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// `R` in the replicated-write pipeline (spec.md §4.6).
const DEFAULT_REPLICA_NUMBER: usize = 3;
/// The packet-sequence total for block regeneration.
const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;
/// `P` in spec.md §4.6, matching `hdfs.py`'s `pipeline_packet_size`.
const DEFAULT_CLIENT_WRITE_PACKET_SIZE: u64 = 1024 * 1024;
const DEFAULT_HEARTBEAT_SIZE: u64 = 16 * 1024;
const DEFAULT_HEARTBEAT_INTERVAL: f64 = 3.0;
const DEFAULT_BLOCK_REPORT_INTERVAL: f64 = 30.0;
/// Throttle applied to regeneration traffic; `hdfs_test.py`/`report_test.py`
/// exercise this around 1 MiB/s.
const DEFAULT_BALANCE_BANDWIDTH: u64 = 1024 * 1024;
/// `node.py`'s default NIC bandwidth (100 Mbit/s expressed in bytes/sec).
const DEFAULT_BANDWIDTH: u64 = 100 * 1024 * 1024 / 8;
/// `hdfs_test.py`'s default disk peak rate (80 MiB/s).
const DEFAULT_DISK_SPEED: u64 = 80 * 1024 * 1024;
const DEFAULT_DISK_BUFFER: u64 = 64 * 1024 * 1024;
const DEFAULT_NUMBER_OF_DATANODES: usize = 3;
const DEFAULT_SEED: u64 = 0xB10C_51E5;

/// Every tunable in spec.md §6, loaded from TOML and/or CLI flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `R` in the replicated-write pipeline.
    pub replica_number: usize,
    /// Packet-sequence total for block regeneration.
    pub block_size: u64,
    /// `P`: the client write partition unit.
    pub client_write_packet_size: u64,
    /// Buffered (write-back) vs. direct disk write at each receiving hop.
    pub enable_datanode_cache: bool,
    /// Spawn datanode→namenode ping loops.
    pub enable_heartbeats: bool,
    /// Spawn datanode→namenode block-report loops.
    pub enable_block_report: bool,
    /// Heartbeat ping payload, bytes.
    pub heartbeat_size: u64,
    /// Heartbeat ping period, virtual seconds.
    pub heartbeat_interval: f64,
    /// Block-report ping period, virtual seconds.
    pub block_report_interval: f64,
    /// Rate cap applied to regeneration traffic.
    pub balance_bandwidth: u64,
    /// Initial NIC counter capacity for every node.
    pub default_bandwidth: u64,
    /// Disk peak-rate counter capacity for every datanode.
    pub default_disk_speed: u64,
    /// Write-back buffer counter capacity for every datanode.
    pub disk_buffer: u64,
    /// How many DataNode peers to instantiate.
    pub number_of_datanodes: usize,
    /// Seeds the scheduler's RNG (arbiter back-off, ping/buffer retry
    /// jitter, `regenerate_blocks` pair selection).
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            replica_number: DEFAULT_REPLICA_NUMBER,
            block_size: DEFAULT_BLOCK_SIZE,
            client_write_packet_size: DEFAULT_CLIENT_WRITE_PACKET_SIZE,
            enable_datanode_cache: true,
            enable_heartbeats: true,
            enable_block_report: true,
            heartbeat_size: DEFAULT_HEARTBEAT_SIZE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            block_report_interval: DEFAULT_BLOCK_REPORT_INTERVAL,
            balance_bandwidth: DEFAULT_BALANCE_BANDWIDTH,
            default_bandwidth: DEFAULT_BANDWIDTH,
            default_disk_speed: DEFAULT_DISK_SPEED,
            disk_buffer: DEFAULT_DISK_BUFFER,
            number_of_datanodes: DEFAULT_NUMBER_OF_DATANODES,
            seed: DEFAULT_SEED,
        }
    }
}

impl Config {
    /// Loads a scenario file. Fields absent from the file fall back to
    /// `Config::default()`'s values (every field carries `#[serde(default)]`
    /// via the struct-level attribute).
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SimError::configuration(format!("could not read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&text).map_err(|e| {
            SimError::configuration(format!("could not parse config file {}: {e}", path.display()))
        })
    }
}

//! The `blocksim` CLI: builds a cluster from a [`blocksim::Config`], runs
//! one of the built-in scenarios, and prints the finishing virtual time.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use blocksim::{Cluster, Config, SimError};

#[derive(Parser)]
#[command(name = "blocksim", version, about = "Discrete-event simulator of limp-mode propagation in a replicated block store")]
struct Cli {
    /// Optional TOML scenario file; CLI flags below override its fields.
    #[arg(long, env = "BLOCKSIM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    replica_number: Option<usize>,
    #[arg(long)]
    number_of_datanodes: Option<usize>,
    #[arg(long)]
    default_disk_speed: Option<u64>,
    #[arg(long)]
    default_bandwidth: Option<u64>,
    #[arg(long)]
    disk_buffer: Option<u64>,
    #[arg(long)]
    balance_bandwidth: Option<u64>,
    #[arg(long)]
    block_size: Option<u64>,
    #[arg(long)]
    client_write_packet_size: Option<u64>,
    #[arg(long)]
    heartbeat_size: Option<u64>,
    #[arg(long)]
    heartbeat_interval: Option<f64>,
    #[arg(long)]
    block_report_interval: Option<f64>,
    #[arg(long)]
    enable_datanode_cache: Option<bool>,
    #[arg(long)]
    enable_heartbeats: Option<bool>,
    #[arg(long)]
    enable_block_report: Option<bool>,

    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// Drive `count` file writes of `size` bytes through the replicated pipeline.
    Put {
        #[arg(long, default_value_t = 1)]
        count: u64,
        #[arg(long, default_value_t = 64 * 1024 * 1024)]
        size: u64,
    },
    /// Regenerate `count` under-replicated blocks between random datanode pairs.
    Regenerate {
        #[arg(long, default_value_t = 30)]
        count: u64,
    },
    /// Start services and run until `until`, or forever if unset.
    Forever {
        #[arg(long)]
        until: Option<f64>,
    },
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = self.$field {
                    config.$field = v;
                }
            };
        }
        apply!(seed);
        apply!(replica_number);
        apply!(number_of_datanodes);
        apply!(default_disk_speed);
        apply!(default_bandwidth);
        apply!(disk_buffer);
        apply!(balance_bandwidth);
        apply!(block_size);
        apply!(client_write_packet_size);
        apply!(heartbeat_size);
        apply!(heartbeat_interval);
        apply!(block_report_interval);
        apply!(enable_datanode_cache);
        apply!(enable_heartbeats);
        apply!(enable_block_report);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let mut config = match &cli.config {
        Some(path) => match Config::from_toml_file(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(%err, "could not load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    cli.apply(&mut config);

    let cluster = Cluster::new(config);
    let result = match cli.scenario {
        Scenario::Put { count, size } => cluster.put_files(count, size),
        Scenario::Regenerate { count } => cluster.regenerate_blocks(count),
        Scenario::Forever { until } => match until {
            Some(t) => cluster.run_until(t),
            None => cluster.run_forever(),
        },
    };

    match result {
        Ok(finish_time) => {
            println!("{finish_time}");
            ExitCode::SUCCESS
        }
        Err(err @ SimError::InvariantViolation { .. }) => {
            tracing::error!(%err, "simulation aborted");
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!(%err, "simulation configuration error");
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use keystone::{
    CoordinatorConfig,
    config::{AllocatorConfig, BusConfig, QueueConfig, SchedulerConfig},
};
use std::net::SocketAddr;

/// Largest timestamp batch: the whole logical counter of one millisecond.
const MAX_TIMESTAMP_BATCH: u32 = 1 << 18;

/// Runtime configuration for the `keystone-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is honoured), with defaults suitable for a single node.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "keystone-server",
    version,
    about = "Gateway node: batched ID/timestamp allocation and ordered task scheduling"
)]
pub struct CliArgs {
    /// Address the HTTP endpoint listens on.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("0.0.0.0:19530"))]
    pub listen_addr: String,

    /// Where identifiers, timestamps, segments and schemas come from: `local`
    /// for an in-process authority, otherwise the URI of a remote authority
    /// (e.g. `http://authority:53100`).
    ///
    /// Environment variable: `AUTHORITY`
    #[arg(long, env = "AUTHORITY", default_value_t = String::from("local"))]
    pub authority: String,

    /// Message bus: `memory` for an in-process bus, otherwise the URI of a
    /// remote bus.
    ///
    /// Environment variable: `BUS`
    #[arg(long, env = "BUS", default_value_t = String::from("memory"))]
    pub bus: String,

    /// Timeout for the initial dial to the authority and the bus.
    ///
    /// Environment variable: `DIAL_TIMEOUT_MS`
    #[arg(long, env = "DIAL_TIMEOUT_MS", default_value_t = 10_000)]
    pub dial_timeout_ms: u64,

    /// Deadline of a single remote call.
    ///
    /// Environment variable: `RPC_TIMEOUT_MS`
    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = 3_000)]
    pub rpc_timeout_ms: u64,

    /// Batch size allocators start with.
    ///
    /// Environment variable: `INITIAL_BATCH`
    #[arg(long, env = "INITIAL_BATCH", default_value_t = 256)]
    pub initial_batch: u32,

    /// Smallest batch an idle allocator shrinks to.
    ///
    /// Environment variable: `MIN_BATCH`
    #[arg(long, env = "MIN_BATCH", default_value_t = 16)]
    pub min_batch: u32,

    /// Largest batch a busy allocator grows to. Timestamp batches are further
    /// capped at 2^18.
    ///
    /// Environment variable: `MAX_BATCH`
    #[arg(long, env = "MAX_BATCH", default_value_t = 65_536)]
    pub max_batch: u32,

    /// Concurrently executing DDL tasks.
    ///
    /// Environment variable: `DDL_CONCURRENCY`
    #[arg(long, env = "DDL_CONCURRENCY", default_value_t = 1)]
    pub ddl_concurrency: usize,

    /// Concurrently executing insert/delete tasks.
    ///
    /// Environment variable: `MANIPULATION_CONCURRENCY`
    #[arg(long, env = "MANIPULATION_CONCURRENCY", default_value_t = 8)]
    pub manipulation_concurrency: usize,

    /// Concurrently executing query tasks.
    ///
    /// Environment variable: `QUERY_CONCURRENCY`
    #[arg(long, env = "QUERY_CONCURRENCY", default_value_t = 8)]
    pub query_concurrency: usize,

    /// How long a task waits for its collection before it is requeued.
    ///
    /// Environment variable: `EXCLUSION_WAIT_MS`
    #[arg(long, env = "EXCLUSION_WAIT_MS", default_value_t = 3_000)]
    pub exclusion_wait_ms: u64,

    /// Requeues before a task fails with an exclusion timeout.
    ///
    /// Environment variable: `MAX_REQUEUES`
    #[arg(long, env = "MAX_REQUEUES", default_value_t = 5)]
    pub max_requeues: u32,

    /// Attempts at `Execute` when it fails transiently.
    ///
    /// Environment variable: `EXECUTE_ATTEMPTS`
    #[arg(long, env = "EXECUTE_ATTEMPTS", default_value_t = 3)]
    pub execute_attempts: u32,

    /// Default deadline for a request, overridable per request with the
    /// `x-request-timeout-ms` header.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Time in-flight tasks get to finish on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_MS`
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// Interval between time ticks.
    ///
    /// Environment variable: `TIME_TICK_INTERVAL_MS`
    #[arg(long, env = "TIME_TICK_INTERVAL_MS", default_value_t = 200)]
    pub time_tick_interval_ms: u64,

    /// Number of manipulation channels collections are spread over.
    ///
    /// Environment variable: `MANIPULATION_CHANNELS`
    #[arg(long, env = "MANIPULATION_CHANNELS", default_value_t = 1)]
    pub manipulation_channels: u32,
}

/// Where a remote dependency lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    InProcess,
    Remote(String),
}

impl Backend {
    fn parse(value: &str, in_process: &str) -> Self {
        if value.eq_ignore_ascii_case(in_process) {
            Self::InProcess
        } else {
            Self::Remote(value.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub authority: Backend,
    pub bus: Backend,
    pub dial_timeout: Duration,
    pub rpc_timeout: Duration,
    pub coordinator: CoordinatorConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = match args.listen_addr.parse() {
            Ok(addr) => addr,
            Err(e) => bail!("LISTEN_ADDR ({}) is not a socket address: {e}", args.listen_addr),
        };

        if args.min_batch == 0 {
            bail!("MIN_BATCH must be greater than 0");
        }
        if args.min_batch > args.initial_batch || args.initial_batch > args.max_batch {
            bail!(
                "batch bounds must satisfy MIN_BATCH ({}) <= INITIAL_BATCH ({}) <= MAX_BATCH ({})",
                args.min_batch,
                args.initial_batch,
                args.max_batch
            );
        }
        if args.min_batch > MAX_TIMESTAMP_BATCH {
            bail!("MIN_BATCH ({}) exceeds the timestamp batch limit ({MAX_TIMESTAMP_BATCH})", args.min_batch);
        }
        for (name, value) in [
            ("DDL_CONCURRENCY", args.ddl_concurrency),
            ("MANIPULATION_CONCURRENCY", args.manipulation_concurrency),
            ("QUERY_CONCURRENCY", args.query_concurrency),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }
        if args.execute_attempts == 0 {
            bail!("EXECUTE_ATTEMPTS must be greater than 0");
        }
        if args.manipulation_channels == 0 {
            bail!("MANIPULATION_CHANNELS must be greater than 0");
        }
        if args.time_tick_interval_ms == 0 {
            bail!("TIME_TICK_INTERVAL_MS must be greater than 0");
        }

        let rpc_timeout = Duration::from_millis(args.rpc_timeout_ms);
        let defaults = CoordinatorConfig::default();
        let mut id_allocator = AllocatorConfig {
            initial_batch: args.initial_batch,
            min_batch: args.min_batch,
            max_batch: args.max_batch,
            ..defaults.id_allocator
        };
        id_allocator.retry.rpc_timeout = rpc_timeout;
        let timestamp_allocator = AllocatorConfig {
            initial_batch: args.initial_batch.min(MAX_TIMESTAMP_BATCH),
            max_batch: args.max_batch.min(MAX_TIMESTAMP_BATCH),
            ..id_allocator.clone()
        };
        let mut segment = defaults.segment;
        segment.retry.rpc_timeout = rpc_timeout;

        let coordinator = CoordinatorConfig {
            id_allocator,
            timestamp_allocator,
            segment,
            scheduler: SchedulerConfig {
                ddl: QueueConfig {
                    max_active: args.ddl_concurrency,
                },
                manipulation: QueueConfig {
                    max_active: args.manipulation_concurrency,
                },
                query: QueueConfig {
                    max_active: args.query_concurrency,
                },
                exclusion_wait: Duration::from_millis(args.exclusion_wait_ms),
                max_requeues: args.max_requeues,
                execute_attempts: args.execute_attempts,
                ..defaults.scheduler
            },
            bus: BusConfig {
                manipulation_channels: args.manipulation_channels,
            },
            time_tick_interval: Duration::from_millis(args.time_tick_interval_ms),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
            request_timeout: Duration::from_millis(args.request_timeout_ms),
        };

        Ok(Self {
            listen_addr,
            authority: Backend::parse(&args.authority, "local"),
            bus: Backend::parse(&args.bus, "memory"),
            dial_timeout: Duration::from_millis(args.dial_timeout_ms),
            rpc_timeout,
            coordinator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = core::iter::once("keystone-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_run_everything_in_process() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.authority, Backend::InProcess);
        assert_eq!(config.bus, Backend::InProcess);
        assert_eq!(config.coordinator.scheduler.ddl.max_active, 1);
        assert_eq!(config.coordinator.timestamp_allocator.max_batch, 65_536);
    }

    #[test]
    fn timestamp_batches_are_capped() {
        let config = parse(&["--max-batch", "1000000"]).unwrap();
        assert_eq!(config.coordinator.id_allocator.max_batch, 1_000_000);
        assert_eq!(config.coordinator.timestamp_allocator.max_batch, MAX_TIMESTAMP_BATCH);
    }

    #[test]
    fn remote_backends_keep_their_address() {
        let config = parse(&["--authority", "http://authority:53100", "--bus", "http://bus:6650"]).unwrap();
        assert_eq!(config.authority, Backend::Remote("http://authority:53100".into()));
        assert_eq!(config.bus, Backend::Remote("http://bus:6650".into()));
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        assert!(parse(&["--min-batch", "512"]).is_err());
        assert!(parse(&["--query-concurrency", "0"]).is_err());
        assert!(parse(&["--manipulation-channels", "0"]).is_err());
        assert!(parse(&["--listen-addr", "nowhere"]).is_err());
    }
}

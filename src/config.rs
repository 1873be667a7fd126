use std::{
    net::{Ipv4Addr, SocketAddr},
    ops::Range,
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// Probe a range of ports on one host.
    Port,
    /// List the service's Endpoints through the Kubernetes API.
    Kubernetes,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "demory",
    about = "Replicated map and cache store",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start a node (default).
    Run,

    /// Send a single request to a running node.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// gRPC address of the node to talk to.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:8000")]
    pub target: String,

    #[command(subcommand)]
    pub op: ClientOp,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ClientOp {
    MapPut { name: String, key: String, value: String },
    MapGet { name: String, key: String },
    MapPutIfAbsent { name: String, key: String, value: String },
    MapRemove { name: String, key: String },
    MapClear { name: String },
    CachePut { name: String, key: String, value: String },
    CacheGet { name: String, key: String },
    CacheRemove { name: String, key: String },
    CacheClear { name: String },
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Stable member id; in Kubernetes this must be the pod name.
    #[arg(
        long,
        global = true,
        env = "DEMORY_NODE_ID",
        value_name = "ID",
        default_value = "node-1"
    )]
    pub node_id: String,

    /// Raft address advertised to peers.
    #[arg(
        long,
        global = true,
        env = "DEMORY_NODE_ADDRESS",
        value_name = "HOST:PORT",
        default_value = "127.0.0.1:7001"
    )]
    pub node_address: String,

    #[arg(
        long,
        global = true,
        env = "DEMORY_RAFT_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:7001"
    )]
    pub raft_bind: SocketAddr,

    /// gRPC listen port.
    #[arg(
        long,
        global = true,
        env = "DEMORY_PORT",
        value_name = "PORT",
        default_value_t = 8000
    )]
    pub port: u16,

    #[arg(
        long,
        global = true,
        env = "DEMORY_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Form a single-node cluster when no membership exists yet. Enable on exactly one node;
    /// the others join it through discovery.
    #[arg(
        long,
        global = true,
        env = "DEMORY_BOOTSTRAP",
        value_name = "BOOL",
        default_value_t = false,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub bootstrap: bool,

    #[arg(
        long = "discovery-strategy",
        global = true,
        env = "DEMORY_DISCOVERY_STRATEGY",
        value_name = "STRATEGY",
        default_value = "port",
        value_enum
    )]
    pub discovery_strategy: DiscoveryKind,

    #[arg(
        long = "probe-host",
        global = true,
        env = "DEMORY_PROBE_HOST",
        value_name = "HOST",
        default_value = "localhost"
    )]
    pub probe_host: String,

    /// First port probed (inclusive).
    #[arg(
        long = "min-port",
        global = true,
        env = "DEMORY_MIN_PORT",
        value_name = "PORT",
        default_value_t = 8000
    )]
    pub min_port: u16,

    /// End of the probed range (exclusive).
    #[arg(
        long = "max-port",
        global = true,
        env = "DEMORY_MAX_PORT",
        value_name = "PORT",
        default_value_t = 8100
    )]
    pub max_port: u16,

    #[arg(
        long = "kubernetes-namespace",
        global = true,
        env = "DEMORY_KUBERNETES_NAMESPACE",
        value_name = "NAMESPACE",
        default_value = "default"
    )]
    pub kubernetes_namespace: String,

    /// Endpoints are selected with `app=<service>`.
    #[arg(
        long = "kubernetes-service",
        global = true,
        env = "DEMORY_KUBERNETES_SERVICE",
        value_name = "NAME",
        default_value = "demory"
    )]
    pub kubernetes_service: String,

    /// Named endpoint port to use; the first port when unset.
    #[arg(
        long = "kubernetes-port-name",
        global = true,
        env = "DEMORY_KUBERNETES_PORT_NAME",
        value_name = "NAME"
    )]
    pub kubernetes_port_name: Option<String>,

    #[arg(
        long = "discovery-interval-secs",
        global = true,
        env = "DEMORY_DISCOVERY_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub discovery_interval_secs: u64,

    #[arg(
        long = "membership-timeout-ms",
        global = true,
        env = "DEMORY_MEMBERSHIP_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub membership_timeout_ms: u64,

    #[arg(
        long = "write-timeout-ms",
        global = true,
        env = "DEMORY_WRITE_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub write_timeout_ms: u64,

    /// Entries per cache namespace before LRU eviction. Only applies to a fresh store: once a
    /// snapshot is installed, its recorded capacity is kept so replicas evict identically.
    #[arg(
        long = "cache-capacity",
        global = true,
        env = "DEMORY_CACHE_CAPACITY",
        value_name = "N",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub cache_capacity: u64,

    #[arg(
        long = "snapshot-logs",
        global = true,
        env = "DEMORY_SNAPSHOT_LOGS",
        value_name = "N",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub snapshot_logs: u64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_port >= self.max_port {
            anyhow::bail!(
                "--min-port ({}) must be below --max-port ({})",
                self.min_port,
                self.max_port
            );
        }
        if self.node_id.trim().is_empty() {
            anyhow::bail!("--node-id must not be empty");
        }
        Ok(())
    }

    pub fn grpc_bind(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn probe_ports(&self) -> Range<u16> {
        self.min_port..self.max_port
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn membership_timeout(&self) -> Duration {
        Duration::from_millis(self.membership_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn cache_capacity(&self) -> usize {
        usize::try_from(self.cache_capacity).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["demory"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.node_id, "node-1");
        assert_eq!(cli.config.node_address, "127.0.0.1:7001");
        assert_eq!(cli.config.port, 8000);
        assert!(!cli.config.bootstrap);
        assert_eq!(cli.config.discovery_strategy, DiscoveryKind::Port);
        assert_eq!(cli.config.probe_host, "localhost");
        assert_eq!(cli.config.probe_ports(), 8000..8100);
        assert_eq!(cli.config.kubernetes_namespace, "default");
        assert_eq!(cli.config.kubernetes_service, "demory");
        assert_eq!(cli.config.kubernetes_port_name, None);
        assert_eq!(cli.config.discovery_interval(), Duration::from_secs(5));
        assert_eq!(cli.config.membership_timeout(), Duration::from_secs(1));
        assert_eq!(cli.config.write_timeout(), Duration::from_secs(1));
        assert_eq!(cli.config.cache_capacity(), 1000);
        assert_eq!(cli.config.snapshot_logs, 5000);
        cli.config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_cache_capacity() {
        let err = Cli::try_parse_from(["demory", "--cache-capacity", "0"]).unwrap_err();
        assert!(err.to_string().contains("--cache-capacity"));
    }

    #[test]
    fn rejects_invalid_discovery_interval_secs() {
        let err = Cli::try_parse_from(["demory", "--discovery-interval-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--discovery-interval-secs"));
        assert!(msg.contains("1..=300"));
    }

    #[test]
    fn validate_rejects_empty_port_range() {
        let cli =
            Cli::try_parse_from(["demory", "--min-port", "9000", "--max-port", "9000"]).unwrap();
        let err = cli.config.validate().unwrap_err();
        assert!(err.to_string().contains("--min-port"));
    }

    #[test]
    fn parses_bootstrap_as_bool_value() {
        let cli = Cli::try_parse_from(["demory", "--bootstrap", "true"]).unwrap();
        assert!(cli.config.bootstrap);
        let cli = Cli::try_parse_from(["demory", "--bootstrap", "false"]).unwrap();
        assert!(!cli.config.bootstrap);
    }

    #[test]
    fn help_explains_bootstrap_and_cache_capacity() {
        use clap::CommandFactory;

        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("Enable on exactly one node"));
        assert!(help.contains("its recorded capacity is kept"));
    }

    #[test]
    fn parses_kubernetes_strategy() {
        let cli = Cli::try_parse_from([
            "demory",
            "--discovery-strategy",
            "kubernetes",
            "--kubernetes-port-name",
            "raft",
        ])
        .unwrap();
        assert_eq!(cli.config.discovery_strategy, DiscoveryKind::Kubernetes);
        assert_eq!(cli.config.kubernetes_port_name.as_deref(), Some("raft"));
    }

    #[test]
    fn parses_client_subcommand_with_global_flags() {
        let cli = Cli::try_parse_from([
            "demory",
            "client",
            "--target",
            "10.0.0.2:8001",
            "map-put",
            "users",
            "alice",
            "1",
        ])
        .unwrap();
        let Some(Command::Client(args)) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.target, "10.0.0.2:8001");
        assert!(matches!(
            args.op,
            ClientOp::MapPut { ref name, ref key, ref value }
                if name == "users" && key == "alice" && value == "1"
        ));
    }
}

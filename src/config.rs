//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::proxy::{DEFAULT_MAX_BODY_BYTES, MAX_REPLAY_BYTES};
use crate::shard::BackendDefaults;

/// Weaver - a sharding reverse proxy with routes hot-loaded from etcd
#[derive(Parser, Debug)]
#[command(name = "weaver")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOGGER_LEVEL", default_value = "error", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy server
    Server(ServerArgs),

    /// Manage the ACLs stored in etcd
    Acls {
        #[command(subcommand)]
        command: AclCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AclCommand {
    /// List the id and criterion of every stored ACL
    List,
    /// Print one ACL as JSON
    Show {
        #[arg(long)]
        id: String,
    },
    /// Validate and store an ACL read from a JSON file
    Put {
        #[arg(long)]
        file: PathBuf,
    },
    /// Remove an ACL
    Delete {
        #[arg(long)]
        id: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// etcd endpoints, comma separated
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379",
        global = true
    )]
    pub etcd_endpoints: Vec<String>,

    /// Namespace the ACLs are stored under
    #[arg(long, env = "ETCD_KEY_PREFIX", default_value = "weaver", global = true)]
    pub etcd_key_prefix: String,

    /// etcd connect timeout in seconds
    #[arg(long, env = "ETCD_DIAL_TIMEOUT", default_value_t = 5, global = true)]
    pub etcd_dial_timeout: u64,
}

impl StoreArgs {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.etcd_dial_timeout)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    #[arg(long, env = "PROXY_HOST", default_value = "0.0.0.0")]
    pub proxy_host: String,

    #[arg(long, env = "PROXY_PORT", default_value_t = 8081)]
    pub proxy_port: u16,

    /// Port of the admin listener (/healthz, /readyz, /routes)
    #[arg(long, env = "ADMIN_PORT", default_value_t = 8080)]
    pub admin_port: u16,

    /// Upstream connect timeout in milliseconds
    #[arg(long, env = "PROXY_DIALER_TIMEOUT_IN_MS", default_value_t = 1000)]
    pub dialer_timeout_ms: u64,

    /// Idle timeout of pooled upstream connections in milliseconds
    #[arg(long, env = "PROXY_IDLE_CONN_TIMEOUT_IN_MS", default_value_t = 90_000)]
    pub idle_conn_timeout_ms: u64,

    #[arg(
        long,
        env = "PROXY_KEEP_ALIVE_ENABLED",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub keep_alive_enabled: bool,

    /// Largest request body buffered for body matchers, at most 65536
    #[arg(
        long,
        env = "PROXY_MAX_BODY_BYTES",
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        value_parser = parse_body_limit
    )]
    pub max_body_bytes: usize,
}

fn parse_body_limit(raw: &str) -> Result<usize, String> {
    let limit: usize = raw
        .parse()
        .map_err(|e| format!("`{}` is not a byte count: {}", raw, e))?;
    if limit > MAX_REPLAY_BYTES {
        return Err(format!(
            "{} exceeds the {} bytes a buffered body can be replayed upstream",
            limit, MAX_REPLAY_BYTES
        ));
    }
    Ok(limit)
}

impl ServerArgs {
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy_host, self.proxy_port)
    }

    pub fn admin_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.proxy_host, self.admin_port).parse()
    }

    pub fn backend_defaults(&self) -> BackendDefaults {
        BackendDefaults {
            dial_timeout: Duration::from_millis(self.dialer_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_conn_timeout_ms),
            keep_alive: self.keep_alive_enabled,
        }
    }
}

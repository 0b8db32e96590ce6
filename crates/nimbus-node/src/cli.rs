//! Command-line parsing for the `nimbusd` binary: turns argv into a
//! [`FlagOverrides`] that feeds the config layering in `config.rs`, plus
//! the process exit-code contract.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::config::FlagOverrides;

#[derive(Parser, Debug)]
#[command(name = "nimbusd", version, about = "Nimbus cluster node")]
pub struct Cli {
    /// Path to a TOML config file layered beneath environment and flags.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Overrides `node.data_dir`.
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Overrides `node.id`.
    #[arg(long, value_name = "ID")]
    pub node_id: Option<String>,

    /// Overrides `http.bind`.
    #[arg(long, value_name = "ADDR")]
    pub http_bind: Option<SocketAddr>,

    /// Overrides `rpc.bind`.
    #[arg(long, value_name = "ADDR")]
    pub rpc_bind: Option<SocketAddr>,

    /// Bootstraps a brand new single-node cluster instead of joining one.
    #[arg(long)]
    pub bootstrap: bool,

    /// Address of an existing cluster member to join through.
    #[arg(long, value_name = "ADDR")]
    pub join: Option<SocketAddr>,

    /// Overrides `node.failure_zone`.
    #[arg(long, value_name = "ZONE")]
    pub failure_zone: Option<String>,

    /// Disables the authentication requirement. Development use only.
    #[arg(long)]
    pub allow_insecure: bool,
}

impl Cli {
    pub fn into_overrides(self) -> FlagOverrides {
        FlagOverrides {
            data_dir: self.data_dir,
            node_id: self.node_id,
            http_bind: self.http_bind,
            rpc_bind: self.rpc_bind,
            bootstrap: self.bootstrap,
            join: self.join,
            failure_zone: self.failure_zone,
            allow_insecure: self.allow_insecure,
            config_file: self.config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bootstrap_and_bind_flags() {
        let cli = Cli::parse_from(["nimbusd", "--bootstrap", "--http-bind", "127.0.0.1:8080"]);
        assert!(cli.bootstrap);
        assert_eq!(cli.http_bind, Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn join_and_bootstrap_are_both_parseable_together_and_left_to_host_to_reject() {
        let cli = Cli::parse_from(["nimbusd", "--bootstrap", "--join", "10.0.0.1:9000"]);
        assert!(cli.bootstrap);
        assert!(cli.join.is_some());
    }

    #[test]
    fn overrides_carry_every_flag_through() {
        let cli = Cli::parse_from(["nimbusd", "--node-id", "n1", "--failure-zone", "us-east-1a", "--allow-insecure"]);
        let overrides = cli.into_overrides();
        assert_eq!(overrides.node_id.as_deref(), Some("n1"));
        assert_eq!(overrides.failure_zone.as_deref(), Some("us-east-1a"));
        assert!(overrides.allow_insecure);
    }
}

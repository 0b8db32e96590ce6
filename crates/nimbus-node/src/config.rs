//! Assembles the node's [`LayeredConfiguration`] from compiled-in
//! defaults, an optional TOML file, the process environment (`NIMBUS_*`),
//! and CLI flags, in that precedence order, then projects the resolved
//! keys into a typed [`NodeConfig`] the rest of the binary consumes.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use nimbus_core::configuration::{value::parse_loosely, ConfigLayer, LayeredConfiguration};

use crate::error::NodeError;

const ENV_PREFIX: &str = "NIMBUS_";

/// Keys recognized from the environment and file layers, with their
/// compiled-in default. Kept as one table so `defaults` and `env var name
/// derivation` can't drift apart.
const DEFAULTS: &[(&str, &str)] = &[
    ("node.id", ""),
    ("node.data_dir", "./data"),
    ("node.failure_zone", "default"),
    ("http.bind", "127.0.0.1:8080"),
    ("rpc.bind", "127.0.0.1:7443"),
    ("cluster.bootstrap", "false"),
    ("cluster.join", ""),
    ("security.oidc_issuer", ""),
    ("security.jwt_audience", "nimbus-api"),
    ("security.allow_insecure", "false"),
    ("scheduler.local_zone", "default"),
    ("registry.replication_factor", "3"),
    ("registry.require_zone_diversity", "true"),
    ("fabric.low_water", "4"),
    ("fabric.high_water", "64"),
];

fn defaults_layer() -> ConfigLayer {
    let mut layer = ConfigLayer::new("defaults");
    for (key, value) in DEFAULTS {
        layer = layer.set(*key, parse_loosely(value));
    }
    layer
}

fn file_layer(path: &Path) -> Result<ConfigLayer, NodeError> {
    let mut layer = ConfigLayer::new("file");
    if !path.exists() {
        return Ok(layer);
    }
    let raw = std::fs::read_to_string(path).map_err(|e| NodeError::Configuration(format!("reading {}: {e}", path.display())))?;
    let parsed: toml::Value = toml::from_str(&raw).map_err(|e| NodeError::Configuration(format!("parsing {}: {e}", path.display())))?;
    let mut flat = Vec::new();
    flatten_toml("", &parsed, &mut flat);
    for (key, value) in flat {
        layer = layer.set(key, value);
    }
    Ok(layer)
}

fn flatten_toml(prefix: &str, value: &toml::Value, out: &mut Vec<(String, nimbus_core::configuration::ConfigValue)>) {
    use nimbus_core::configuration::ConfigValue;
    match value {
        toml::Value::Table(table) => {
            for (key, inner) in table {
                let full_key = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten_toml(&full_key, inner, out);
            }
        }
        toml::Value::Boolean(b) => out.push((prefix.to_string(), ConfigValue::Bool(*b))),
        toml::Value::Integer(i) => out.push((prefix.to_string(), ConfigValue::Int(*i))),
        toml::Value::Float(f) => out.push((prefix.to_string(), ConfigValue::Float(*f))),
        toml::Value::String(s) => out.push((prefix.to_string(), ConfigValue::String(s.clone()))),
        toml::Value::Datetime(dt) => out.push((prefix.to_string(), ConfigValue::String(dt.to_string()))),
        toml::Value::Array(_) => {}
    }
}

fn environment_layer() -> ConfigLayer {
    let mut layer = ConfigLayer::new("environment");
    for (raw_key, _) in DEFAULTS {
        let env_name = format!("{ENV_PREFIX}{}", raw_key.to_uppercase().replace('.', "_"));
        if let Ok(value) = std::env::var(&env_name) {
            layer = layer.set(*raw_key, parse_loosely(&value));
        }
    }
    layer
}

/// CLI-flag overrides, collected by [`crate::cli`] and handed in here so
/// this module stays the single place that knows the key namespace.
#[derive(Default, Clone)]
pub struct FlagOverrides {
    pub data_dir: Option<PathBuf>,
    pub node_id: Option<String>,
    pub http_bind: Option<SocketAddr>,
    pub rpc_bind: Option<SocketAddr>,
    pub bootstrap: bool,
    pub join: Option<SocketAddr>,
    pub failure_zone: Option<String>,
    pub allow_insecure: bool,
    pub config_file: Option<PathBuf>,
}

fn flags_layer(overrides: &FlagOverrides) -> ConfigLayer {
    let mut layer = ConfigLayer::new("flags");
    if let Some(dir) = &overrides.data_dir {
        layer = layer.set("node.data_dir", dir.display().to_string());
    }
    if let Some(id) = &overrides.node_id {
        layer = layer.set("node.id", id.clone());
    }
    if let Some(addr) = overrides.http_bind {
        layer = layer.set("http.bind", addr.to_string());
    }
    if let Some(addr) = overrides.rpc_bind {
        layer = layer.set("rpc.bind", addr.to_string());
    }
    if overrides.bootstrap {
        layer = layer.set("cluster.bootstrap", true);
    }
    if let Some(join) = overrides.join {
        layer = layer.set("cluster.join", join.to_string());
    }
    if let Some(zone) = &overrides.failure_zone {
        layer = layer.set("node.failure_zone", zone.clone());
    }
    if overrides.allow_insecure {
        layer = layer.set("security.allow_insecure", true);
    }
    layer
}

/// The typed view of the resolved configuration that every component
/// constructor actually wants, rather than threading a [`LayeredConfiguration`]
/// and string keys through every call site.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    pub failure_zone: String,
    pub http_bind: SocketAddr,
    pub rpc_bind: SocketAddr,
    pub bootstrap: bool,
    pub join: Option<SocketAddr>,
    pub oidc_issuer: Option<String>,
    pub jwt_audience: String,
    pub allow_insecure: bool,
    pub scheduler_local_zone: String,
    pub replication_factor: usize,
    pub require_zone_diversity: bool,
    pub fabric_low_water: usize,
    pub fabric_high_water: usize,
    pub resolved: LayeredConfiguration,
}

impl NodeConfig {
    pub fn load(overrides: FlagOverrides) -> Result<Self, NodeError> {
        let file_path = overrides.config_file.clone().unwrap_or_else(|| PathBuf::from("nimbus.toml"));
        let resolved = LayeredConfiguration::builder()
            .push_layer(defaults_layer())
            .push_layer(file_layer(&file_path)?)
            .push_layer(environment_layer())
            .push_layer(flags_layer(&overrides))
            .build();

        let data_dir = PathBuf::from(resolved.get_str("node.data_dir", "./data"));
        let node_id = {
            let configured = resolved.get_str("node.id", "");
            if configured.is_empty() { String::new() } else { configured }
        };
        let http_bind = resolved
            .get_str("http.bind", "127.0.0.1:8080")
            .parse()
            .map_err(|e| NodeError::Configuration(format!("invalid http.bind: {e}")))?;
        let rpc_bind = resolved
            .get_str("rpc.bind", "127.0.0.1:7443")
            .parse()
            .map_err(|e| NodeError::Configuration(format!("invalid rpc.bind: {e}")))?;
        let join_raw = resolved.get_str("cluster.join", "");
        let join = if join_raw.is_empty() { None } else { Some(join_raw.parse().map_err(|e| NodeError::Configuration(format!("invalid cluster.join: {e}")))?) };
        let oidc_issuer_raw = resolved.get_str("security.oidc_issuer", "");
        let oidc_issuer = if oidc_issuer_raw.is_empty() { None } else { Some(oidc_issuer_raw) };

        Ok(Self {
            node_id,
            data_dir,
            failure_zone: resolved.get_str("node.failure_zone", "default"),
            http_bind,
            rpc_bind,
            bootstrap: resolved.get_bool("cluster.bootstrap", false),
            join,
            oidc_issuer,
            jwt_audience: resolved.get_str("security.jwt_audience", "nimbus-api"),
            allow_insecure: resolved.get_bool("security.allow_insecure", false),
            scheduler_local_zone: resolved.get_str("scheduler.local_zone", "default"),
            replication_factor: resolved.get_i64("registry.replication_factor", 3).max(1) as usize,
            require_zone_diversity: resolved.get_bool("registry.require_zone_diversity", true),
            fabric_low_water: resolved.get_i64("fabric.low_water", 4).max(0) as usize,
            fabric_high_water: resolved.get_i64("fabric.high_water", 64).max(1) as usize,
            resolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_take_precedence_over_defaults() {
        let overrides = FlagOverrides { http_bind: Some("0.0.0.0:9999".parse().unwrap()), ..Default::default() };
        let config = NodeConfig::load(overrides).unwrap();
        assert_eq!(config.http_bind.port(), 9999);
        assert_eq!(config.resolved.provenance("http.bind"), Some("flags"));
    }

    #[test]
    fn missing_file_layer_does_not_error() {
        let overrides = FlagOverrides { config_file: Some(PathBuf::from("/nonexistent/nimbus.toml")), ..Default::default() };
        assert!(NodeConfig::load(overrides).is_ok());
    }
}

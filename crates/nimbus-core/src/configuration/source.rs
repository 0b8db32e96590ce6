//! The layered configuration resolver: `defaults < file < environment <
//! flags`, matching the precedence fixed in the external interfaces
//! design. Later layers shadow earlier ones key-by-key; a layer that
//! doesn't mention a key leaves whatever the layer below it set.

use std::collections::BTreeMap;

use crate::configuration::value::ConfigValue;
use crate::error::NimbusError;

/// One layer's worth of key/value overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigLayer {
    name: &'static str,
    entries: BTreeMap<String, ConfigValue>,
}

impl ConfigLayer {
    pub fn new(name: &'static str) -> Self {
        Self { name, entries: BTreeMap::new() }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Something that can be turned into a [`ConfigLayer`]: a parsed TOML
/// file, the process environment, or a parsed CLI flag set.
pub trait ConfigurationSource {
    fn into_layer(self) -> Result<ConfigLayer, NimbusError>;
}

/// The resolved configuration: layers applied in construction order, last
/// write wins.
#[derive(Clone, Debug, Default)]
pub struct LayeredConfiguration {
    layers: Vec<ConfigLayer>,
}

impl LayeredConfiguration {
    pub fn builder() -> LayeredConfigurationBuilder {
        LayeredConfigurationBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.layers.iter().rev().find_map(|layer| layer.entries.get(key))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(ConfigValue::as_bool).unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(ConfigValue::as_i64).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(ConfigValue::as_f64).unwrap_or(default)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).and_then(ConfigValue::as_str).map(str::to_string).unwrap_or_else(|| default.to_string())
    }

    /// Which layer last set `key`, useful when a config value looks wrong
    /// and the operator wants to know whether it came from a flag or an
    /// env var.
    pub fn provenance(&self, key: &str) -> Option<&'static str> {
        self.layers.iter().rev().find(|layer| layer.entries.contains_key(key)).map(ConfigLayer::name)
    }
}

#[derive(Default)]
pub struct LayeredConfigurationBuilder {
    layers: Vec<ConfigLayer>,
}

impl LayeredConfigurationBuilder {
    /// Layers must be pushed in ascending precedence: `defaults`, then
    /// `file`, then `environment`, then `flags`.
    pub fn push_layer(mut self, layer: ConfigLayer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn build(self) -> LayeredConfiguration {
        LayeredConfiguration { layers: self.layers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_layers_shadow_earlier_ones() {
        let config = LayeredConfiguration::builder()
            .push_layer(ConfigLayer::new("defaults").set("scheduler.max_inflight", 100i64))
            .push_layer(ConfigLayer::new("flags").set("scheduler.max_inflight", 50i64))
            .build();
        assert_eq!(config.get_i64("scheduler.max_inflight", 0), 50);
        assert_eq!(config.provenance("scheduler.max_inflight"), Some("flags"));
    }

    #[test]
    fn missing_key_falls_back_to_default() {
        let config = LayeredConfiguration::builder().build();
        assert_eq!(config.get_i64("nonexistent", 7), 7);
    }
}

//! Layered configuration: compiled-in defaults, overridden by a config
//! file, overridden by environment variables, overridden by CLI flags.
//! Each layer only needs to supply the keys it wants to override.

pub mod source;
pub mod value;

pub use source::{ConfigLayer, ConfigurationSource, LayeredConfiguration};
pub use value::ConfigValue;

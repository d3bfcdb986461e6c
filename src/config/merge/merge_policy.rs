//! Merge rules: defaults first, later sources override earlier ones key by key.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Create a Config builder with the defaults that must exist before any file
/// is layered on top.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("logging.level", "info")?
        .set_default("logging.output", "stderr")?
        .set_default("rate_limit.scope", "credential")
}

//! Entry points for loading a [`SimConfig`].

use crate::config::{merge, sources, SimConfig};
use config::{ConfigError, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load with full layering for a workspace.
    ///
    /// Precedence (lowest to highest): defaults, global file, `config/config.toml`,
    /// `config/{CRMSIM_ENV}.toml`, `CRMSIM_*` environment variables.
    pub fn load(workspace_root: &Path) -> Result<SimConfig, ConfigError> {
        let builder = merge::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let config: SimConfig = builder.add_source(environment()).build()?.try_deserialize()?;
        debug!(workspace = %workspace_root.display(), "Configuration loaded");
        Ok(config)
    }

    /// Load one explicit TOML file, still honoring environment overrides.
    pub fn load_from_file(path: &Path) -> Result<SimConfig, ConfigError> {
        merge::builder_with_defaults()?
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .add_source(environment())
            .build()?
            .try_deserialize()
    }

    pub fn global_config_path() -> Option<PathBuf> {
        sources::global_file::global_config_path()
    }
}

/// `CRMSIM_RATE_LIMIT__CEILING=50` sets `rate_limit.ceiling`.
fn environment() -> Environment {
    Environment::with_prefix("CRMSIM")
        .prefix_separator("_")
        .separator("__")
}

use std::path::Path;

use config::{Config as ConfigLoader, Environment, File, FileFormat};
use faultline_core::{ConfigError, PropertyValue};
use tracing::debug;

use crate::key::PropertyKey;

/// Layered configuration values: files first, then the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    config: ConfigLoader,
}

impl ConfigSource {
    /// Environment prefix used by [`load_default`](Self::load_default).
    pub const ENV_PREFIX: &'static str = "FAULTLINE";

    /// Loads `paths` in order (missing files are skipped) and then the
    /// environment variables starting with `env_prefix`, if given.
    ///
    /// Environment keys use `__` between segments, so
    /// `FAULTLINE__FAULT_TOLERANCE__TIMEOUT__VALUE` sets
    /// `fault-tolerance.timeout.value`.
    pub fn load<P: AsRef<Path>>(paths: &[P], env_prefix: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigLoader::builder();
        for path in paths {
            debug!(path = %path.as_ref().display(), "Adding configuration file");
            builder = builder.add_source(File::from(path.as_ref()).required(false));
        }
        if let Some(prefix) = env_prefix {
            builder = builder.add_source(Environment::with_prefix(prefix).separator("__"));
        }

        let config = builder.build().map_err(source_error)?;
        Ok(Self { config })
    }

    /// `config/default`, `config/local` and the `FAULTLINE` environment.
    pub fn load_default() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix(Self::ENV_PREFIX).separator("__"))
            .build()
            .map_err(source_error)?;
        Ok(Self { config })
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()
            .map_err(source_error)?;
        Ok(Self { config })
    }

    /// Raw string at `path`. The underscored spelling that environment
    /// variables produce is consulted first, so the environment wins over
    /// files.
    pub fn get_raw(&self, path: &str) -> Result<Option<String>, ConfigError> {
        if path.contains('-') {
            if let Some(value) = self.lookup(&path.replace('-', "_"))? {
                return Ok(Some(value));
            }
        }
        self.lookup(path)
    }

    /// Typed value stored under `key`.
    pub fn get(&self, key: &PropertyKey) -> Result<Option<PropertyValue>, ConfigError> {
        self.get_raw(&key.to_string())?
            .map(|raw| PropertyValue::parse(key.kind, &raw))
            .transpose()
    }

    pub fn contains(&self, key: &PropertyKey) -> Result<bool, ConfigError> {
        Ok(self.get_raw(&key.to_string())?.is_some())
    }

    fn lookup(&self, path: &str) -> Result<Option<String>, ConfigError> {
        match self.config.get_string(path) {
            Ok(value) => Ok(Some(value)),
            Err(config::ConfigError::NotFound(_)) => Ok(None),
            Err(e) => Err(source_error(e)),
        }
    }
}

fn source_error(error: config::ConfigError) -> ConfigError {
    ConfigError::Source(error.to_string())
}

//! Layered loading of the process configuration.
//!
//! A configuration is merged from three layers, later ones winning:
//!
//! 1. `base.(yaml|yml|json)` in the configuration directory.
//! 2. `{environment}.(yaml|yml|json)` for the environment selected by `APP_ENVIRONMENT`.
//! 3. `APP_`-prefixed variables, with `__` between nested keys, such as
//!    `APP_INPUT__WORKER_THREADS=4`.
//!
//! Keys are matched without regard to case or underscores, so `workerThreads` in a file and
//! `WORKER_THREADS` in a variable name the same setting.

use std::fmt;
use std::io;
use std::path::PathBuf;

use rust_cli_config::builder::{ConfigBuilder, DefaultState};
use rust_cli_config::ConfigError;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;
use crate::shared::{ProcessConfig, ValidationError};

/// Directory holding the configuration files, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP_";

/// Separates nested keys in a variable name.
const ENV_KEY_SEPARATOR: &str = "__";

/// Selects the environment layer. Not a configuration key itself.
const ENVIRONMENT_VAR: &str = "APP_ENVIRONMENT";

/// A configuration that can check itself once all layers are merged.
pub trait Config {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// One file layer of a configuration.
#[derive(Debug, Clone, Copy)]
enum Layer {
    Base,
    Environment(Environment),
}

impl Layer {
    fn stem(&self) -> &'static str {
        match self {
            Layer::Base => "base",
            Layer::Environment(environment) => environment.as_str(),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Base => f.write_str("base configuration"),
            Layer::Environment(environment) => write!(f, "{environment} configuration"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("configuration directory `{}` does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("no {layer} file in `{}`", .directory.display())]
    MissingLayer { layer: String, directory: PathBuf },

    #[error("failed to parse `{}`: {source}", .path.display())]
    Parse { path: PathBuf, source: ConfigError },

    #[error("invalid override `{name}`: {source}")]
    Override { name: String, source: ConfigError },

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationError),
}

/// Merges the configuration layers of one directory.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    directory: PathBuf,
    environment: Environment,
    /// Replaces the process environment as the source of overrides when set.
    env_vars: Option<Vec<(String, String)>>,
}

impl ConfigLoader {
    pub fn new(directory: impl Into<PathBuf>, environment: Environment) -> Self {
        Self {
            directory: directory.into(),
            environment,
            env_vars: None,
        }
    }

    /// Loader for `./configuration`, in the environment named by `APP_ENVIRONMENT`.
    pub fn from_current_dir() -> Result<Self, LoadConfigError> {
        let directory = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
        let environment = Environment::load().map_err(LoadConfigError::Environment)?;

        Ok(Self::new(directory.join(CONFIGURATION_DIR), environment))
    }

    /// Reads overrides from `vars` instead of the process environment.
    pub fn with_env_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(
            vars.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        );
        self
    }

    pub fn load<T>(&self) -> Result<T, LoadConfigError>
    where
        T: Config + DeserializeOwned,
    {
        if !self.directory.is_dir() {
            return Err(LoadConfigError::MissingDirectory(self.directory.clone()));
        }

        let mut builder = rust_cli_config::Config::builder();
        for layer in [Layer::Base, Layer::Environment(self.environment)] {
            builder = builder.add_source(self.parse_layer(layer)?);
        }
        builder = self.apply_overrides(builder)?;

        let merged = builder.build().map_err(LoadConfigError::Deserialization)?;
        let config: T = merged
            .try_deserialize()
            .map_err(LoadConfigError::Deserialization)?;
        config.validate()?;

        Ok(config)
    }

    fn parse_layer(&self, layer: Layer) -> Result<rust_cli_config::Config, LoadConfigError> {
        let path = self.find_layer_file(layer)?;

        rust_cli_config::Config::builder()
            .add_source(rust_cli_config::File::from(path.clone()))
            .build()
            .map_err(|source| LoadConfigError::Parse { path, source })
    }

    fn find_layer_file(&self, layer: Layer) -> Result<PathBuf, LoadConfigError> {
        CONFIG_FILE_EXTENSIONS
            .iter()
            .map(|extension| self.directory.join(format!("{}.{extension}", layer.stem())))
            .find(|path| path.is_file())
            .ok_or_else(|| LoadConfigError::MissingLayer {
                layer: layer.to_string(),
                directory: self.directory.clone(),
            })
    }

    fn apply_overrides(
        &self,
        mut builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
        let vars = match &self.env_vars {
            Some(vars) => vars.clone(),
            // Variables that are not valid unicode cannot name a key.
            None => std::env::vars_os()
                .filter_map(|(name, value)| {
                    Some((name.into_string().ok()?, value.into_string().ok()?))
                })
                .collect(),
        };

        for (name, value) in vars {
            let Some(key) = override_key(&name) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }

            builder = builder
                .set_override(&key, value)
                .map_err(|source| LoadConfigError::Override { name, source })?;
        }

        Ok(builder)
    }
}

/// Maps `APP_INPUT__WORKER_THREADS` to `input.workerthreads`, the form keys take once merged.
fn override_key(name: &str) -> Option<String> {
    if name == ENVIRONMENT_VAR {
        return None;
    }
    let rest = name.strip_prefix(ENV_PREFIX)?;
    if rest.is_empty() {
        return None;
    }

    let key = rest
        .split(ENV_KEY_SEPARATOR)
        .map(|segment| segment.to_lowercase().replace('_', ""))
        .collect::<Vec<_>>()
        .join(".");

    Some(key)
}

/// Loads the [`ProcessConfig`] of this process from `./configuration`.
pub fn load_process_config() -> Result<ProcessConfig, LoadConfigError> {
    ConfigLoader::from_current_dir()?.load()
}

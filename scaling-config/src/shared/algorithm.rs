use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// A named algorithm plus a free-form property bag.
///
/// Rate limiters and stream channels are selected this way. The name is resolved to a concrete
/// implementation when the process context is built, so an unknown name fails before any stage
/// starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// Algorithm type name, matched case-insensitively.
    #[serde(rename = "type")]
    pub algorithm_type: String,
    /// Algorithm properties.
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

impl AlgorithmConfig {
    /// Creates a config with the given type and no properties.
    pub fn new(algorithm_type: impl Into<String>) -> Self {
        Self {
            algorithm_type: algorithm_type.into(),
            props: BTreeMap::new(),
        }
    }

    /// Adds a property, returning the modified config.
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Returns the raw value of a property.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    /// Parses a property, falling back to `default` when it is absent.
    pub fn parse_prop_or<T>(&self, key: &str, default: T) -> Result<T, ValidationError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.prop(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|err: T::Err| ValidationError::InvalidAlgorithmProperty {
                    algorithm: self.algorithm_type.clone(),
                    key: key.to_string(),
                    reason: err.to_string(),
                }),
        }
    }
}

//! Store Properties
//!
//! String-keyed custom properties read by the expiry daemons, with
//! hard-coded fallbacks when a value is missing or unparsable.

use hashbrown::HashMap;
use std::str::FromStr;

use crate::error::{ExpiryError, Result};

/// Sweep interval of the expiry daemon, in milliseconds
pub const EXPIRY_INTERVAL: &str = "expiryInterval";
/// Interval between cache loader cycles, in seconds
pub const CACHE_LOADER_INTERVAL: &str = "cacheLoaderInterval";
/// Number of streams the cache loader reloads per cycle
pub const MAX_STREAMS_PER_CYCLE: &str = "maxStreamsPerCycle";

pub const DEFAULT_EXPIRY_INTERVAL_MS: i64 = 1000;
pub const DEFAULT_CACHE_LOADER_INTERVAL_SECS: i64 = 60;
pub const DEFAULT_MAX_STREAMS_PER_CYCLE: usize = 10;

const ENV_PREFIX: &str = "LAPSE_";

/// Custom properties of a message store
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    /// Create empty properties
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the known properties from `LAPSE_*` environment variables,
    /// e.g. `LAPSE_EXPIRY_INTERVAL=250`.
    pub fn from_env() -> Self {
        let mut props = Self::new();
        for key in [EXPIRY_INTERVAL, CACHE_LOADER_INTERVAL, MAX_STREAMS_PER_CYCLE] {
            if let Ok(value) = std::env::var(env_name(key)) {
                props.set(key, value);
            }
        }
        props
    }

    /// Builder-style setter
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a property, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Get the raw value of a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse a property. `Ok(None)` when it is not set.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ExpiryError::Config {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    /// Parse a property, falling back to `default` when it is missing or
    /// invalid. The parse error, if any, is handed back for diagnostics.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> (T, Option<ExpiryError>) {
        match self.parse(key) {
            Ok(Some(value)) => (value, None),
            Ok(None) => (default, None),
            Err(err) => (default, Some(err)),
        }
    }
}

/// `expiryInterval` -> `LAPSE_EXPIRY_INTERVAL`
fn env_name(key: &str) -> String {
    let mut name = String::from(ENV_PREFIX);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            name.push('_');
        }
        name.push(c.to_ascii_uppercase());
    }
    name
}

//! Facilities for reading runtime configuration values
use crate::stash::{FileStash, HybridStash, MemoryStash, StashManager};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

/// The default limit for the preamble and for each header block
const DEFAULT_SECTION_MAX_SIZE: u64 = 32 * 1024;

#[derive(Error, Debug)]
/// Configuration errors
pub enum ConfigError {
    /// Configuration parameter value is out of bounds.
    #[error("config parameter `{parameter}` value is out of bounds: {message}")]
    ConfigParameterValue {
        /// The offending parameter
        parameter: &'static str,
        /// What is wrong with it
        message: String,
    },

    /// Wrapper for [`Figment::Error`](https://docs.rs/figment/latest/figment/struct.Error.html)
    #[error("config deserialization: {0:?}")]
    ConfigDeserialization(#[from] figment::Error),

    /// Wrapper for [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html)
    #[error("IO error: {0:?}")]
    IO(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Message body processing configuration
pub struct Config {
    /// Maximum number of preamble bytes before the first boundary
    pub preamble_max_size: u64,
    /// Maximum size of a single part header block
    pub headers_max_size: u64,
    /// Maximum number of source bytes to read into the first part (0 means unlimited)
    pub first_part_max_bytes: u64,
    /// Accept a `start` parameter matching the first Content-ID with angle brackets stripped
    pub allow_lax_start_param_match: bool,
    /// Treat a multipart body without parts as a single empty part
    pub allow_lax_empty_multipart: bool,
    /// Bytes kept in memory by the hybrid stash before spilling to disk
    pub stash_limit: u64,
    /// Scratch directory for file backed stashes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stash_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preamble_max_size: DEFAULT_SECTION_MAX_SIZE,
            headers_max_size: DEFAULT_SECTION_MAX_SIZE,
            first_part_max_bytes: 0,
            allow_lax_start_param_match: false,
            allow_lax_empty_multipart: false,
            stash_limit: 0,
            stash_dir: None,
        }
    }
}

impl Config {
    /// Loads the configuration from a `toml` file and environment
    ///
    /// Unset values fall back to [`Config::default`]
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Self::default()))
                .merge(Toml::file("mimebody.toml"))
                .merge(Env::prefixed("MIMEBODY__").split("__")),
        )
    }

    /// Extracts and validates the configuration from the provided figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|err| {
            error!("Failed to validate configuration: {}", err);
            err
        })?;

        macro_rules! disallow_value_above {
            ($parent:ident.$var:ident, $limit:expr) => {
                if $parent.$var > $limit as _ {
                    Err(ConfigError::ConfigParameterValue {
                        parameter: stringify!($var),
                        message: format!("parameter value should be equal or less than {}", $limit),
                    })?
                }
            };
        }
        disallow_value_above!(config.preamble_max_size, i64::MAX);
        disallow_value_above!(config.headers_max_size, i64::MAX);
        disallow_value_above!(config.first_part_max_bytes, i64::MAX);
        disallow_value_above!(config.stash_limit, i64::MAX);
        if config.headers_max_size == 0 {
            Err(ConfigError::ConfigParameterValue {
                parameter: "headers_max_size",
                message: "parameter value should be positive".to_string(),
            })?
        }

        trace!("final config: {config:#?}");
        Ok(config)
    }

    /// Creates the stash backend selected by `stash_dir` and `stash_limit`
    ///
    /// * no directory: [`MemoryStash`]
    /// * a directory and a zero limit: [`FileStash`]
    /// * a directory and a positive limit: [`HybridStash`]
    pub fn new_stash_manager(&self) -> Result<Box<dyn StashManager>, ConfigError> {
        Ok(match &self.stash_dir {
            None => Box::new(MemoryStash::new()),
            Some(dir) if self.stash_limit == 0 => Box::new(FileStash::new(dir)?),
            Some(dir) => Box::new(HybridStash::new(self.stash_limit, dir)?),
        })
    }
}

//! Mutex configuration
//!
//! Loaded from any `config::Config` source (the `mutex` table) or straight from
//! `OBJSYNC__`-prefixed environment variables, e.g.
//! `OBJSYNC__MUTEX__INIT_POLICY=require_existing` or
//! `OBJSYNC__MUTEX__BACKOFF__MAX_DELAY_MS=2000`.

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::LockError;

/// Configuration key of the mutex table
pub const MUTEX_CONFIG_KEY: &str = "mutex";

/// Environment variable prefix used by [`MutexConfig::load`]
pub const ENV_PREFIX: &str = "OBJSYNC";

/// How a missing lock object is handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    /// A missing object is an unheld record; the first acquisition creates it
    #[default]
    CreateOnAcquire,
    /// A missing object is an error; seed it with `Mutex::initialize` first
    RequireExisting,
}

/// Configuration for a [`Mutex`](crate::Mutex)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MutexConfig {
    #[serde(default)]
    pub init_policy: InitPolicy,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl MutexConfig {
    /// Read the `mutex` table of an already built configuration.
    /// A missing table yields the defaults.
    pub fn from_config(config: &Config) -> Result<Self, LockError> {
        let parsed = match config.get::<MutexConfig>(MUTEX_CONFIG_KEY) {
            Ok(parsed) => parsed,
            Err(ConfigError::NotFound(_)) => MutexConfig::default(),
            Err(e) => return Err(e.into()),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Build the configuration from `OBJSYNC__*` environment variables
    pub fn load() -> Result<Self, LockError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(&config)
    }

    pub fn with_init_policy(mut self, init_policy: InitPolicy) -> Self {
        self.init_policy = init_policy;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), LockError> {
        self.backoff.validate().map_err(LockError::InvalidConfig)
    }
}

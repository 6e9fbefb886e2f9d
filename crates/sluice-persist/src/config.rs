//! Service configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// Store connection configuration, supplied at boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Address of the backing document store.
    pub address: String,

    /// Database holding the service's collections.
    pub database: String,

    /// Seconds to wait for the initial store connection.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl StoreConfig {
    /// Creates a configuration with the default connect timeout.
    #[must_use]
    pub fn new(address: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            database: database.into(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// The connect timeout as a [`Duration`].
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

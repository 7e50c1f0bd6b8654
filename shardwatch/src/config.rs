//! Configuration for the availability client.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Default path whose children are the monitored resource groups.
pub const DEFAULT_BASE_PATH: &str = "/shardwatch/groups";

/// Default time allowed for the first "connected" event of a session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnection timing.
///
/// Every reconnect cycle draws one interval of
/// `base_interval + s * jitter_step + p` where `s` is uniform in
/// `[0, jitter_steps)` and `p` is uniform in `[0, jitter_spread)`. Many
/// clients typically lose their sessions together; the jitter keeps them from
/// reconnecting in lockstep.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    /// Fixed part of the retry interval.
    #[serde(rename = "baseIntervalMs", deserialize_with = "millis")]
    pub base_interval: Duration,

    /// Number of coarse jitter steps.
    pub jitter_steps: u32,

    /// Size of one coarse jitter step.
    #[serde(rename = "jitterStepMs", deserialize_with = "millis")]
    pub jitter_step: Duration,

    /// Upper bound (exclusive) of the fine jitter term.
    #[serde(rename = "jitterSpreadMs", deserialize_with = "millis")]
    pub jitter_spread: Duration,

    /// Delay before retrying a watch that could not be re-armed while the
    /// session stayed up.
    #[serde(rename = "rearmIntervalMs", deserialize_with = "millis")]
    pub rearm_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(3000),
            jitter_steps: 50,
            jitter_step: Duration::from_millis(100),
            jitter_spread: Duration::from_millis(100),
            rearm_interval: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    /// A short, jitter-free policy for tests.
    pub fn for_testing() -> Self {
        Self {
            base_interval: Duration::from_millis(200),
            jitter_steps: 0,
            jitter_step: Duration::ZERO,
            jitter_spread: Duration::ZERO,
            rearm_interval: Duration::from_millis(50),
        }
    }

    /// Draw the retry interval for one reconnect cycle.
    pub fn next_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let steps = if self.jitter_steps == 0 {
            0
        } else {
            rng.random_range(0..self.jitter_steps)
        };
        let spread_ms = whole_millis(self.jitter_spread);
        let fine = if spread_ms == 0 {
            0
        } else {
            rng.random_range(0..spread_ms)
        };

        self.base_interval + self.jitter_step * steps + Duration::from_millis(fine)
    }

    /// Largest interval [`next_interval`](Self::next_interval) can return.
    pub fn max_interval(&self) -> Duration {
        let steps = self.jitter_steps.saturating_sub(1);
        let fine = whole_millis(self.jitter_spread).saturating_sub(1);
        self.base_interval + self.jitter_step * steps + Duration::from_millis(fine)
    }
}

/// Options recognized by the [`AvailabilityClient`](crate::AvailabilityClient).
///
/// Keys follow the camelCase layout used by cluster configuration files:
///
/// ```json
/// {
///   "servers": "10.0.0.1:2181,10.0.0.2:2181",
///   "chroot": "/cache",
///   "username": "ha",
///   "password": "secret",
///   "connectTimeoutMs": 5000,
///   "basePath": "/shardwatch/groups"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HaConfig {
    /// Comma separated `host:port` list of coordination servers.
    pub servers: String,

    /// Optional chroot suffix appended to the server list.
    pub chroot: String,

    /// Digest username; authentication is skipped when absent.
    pub username: Option<String>,

    /// Digest password.
    pub password: Option<String>,

    /// How long a connect attempt may wait for its "connected" event.
    #[serde(rename = "connectTimeoutMs", deserialize_with = "millis")]
    pub connect_timeout: Duration,

    /// Path whose children are the resource-group names.
    pub base_path: String,

    /// Reconnection timing.
    pub reconnect: ReconnectPolicy,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            servers: String::new(),
            chroot: String::new(),
            username: None,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            base_path: DEFAULT_BASE_PATH.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl HaConfig {
    /// Create a configuration for the given server list with defaults elsewhere.
    pub fn new(servers: impl Into<String>) -> Self {
        Self {
            servers: servers.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the chroot.
    pub fn with_chroot(mut self, chroot: impl Into<String>) -> Self {
        self.chroot = chroot.into();
        self
    }

    /// Set digest credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the base path.
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Check the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.trim().is_empty() {
            return Err(ConfigError::MissingServers);
        }
        if !is_absolute_path(&self.base_path) {
            return Err(ConfigError::InvalidPath {
                field: "basePath",
                path: self.base_path.clone(),
            });
        }
        if !self.chroot.is_empty() && !is_absolute_path(&self.chroot) {
            return Err(ConfigError::InvalidPath {
                field: "chroot",
                path: self.chroot.clone(),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        if self.reconnect.base_interval.is_zero() {
            return Err(ConfigError::ZeroReconnectInterval);
        }
        Ok(())
    }

    /// Connection string handed to the connector: servers followed by chroot.
    pub fn connect_string(&self) -> String {
        format!("{}{}", self.servers, self.chroot)
    }

    /// Digest credentials as `username:password` bytes, if a username is set.
    pub fn credentials(&self) -> Option<Vec<u8>> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        Some(format!("{username}:{password}").into_bytes())
    }
}

fn is_absolute_path(path: &str) -> bool {
    path == "/" || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"))
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

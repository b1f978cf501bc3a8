//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`ClientOptions::connection_timeout`], in
/// milliseconds.
pub const ENV_CONNECTION_TIMEOUT: &str = "FBP_CLIENT_CONNECTION_TIMEOUT_MS";
/// Environment variable overriding [`ClientOptions::command_timeout`], in
/// milliseconds.
pub const ENV_COMMAND_TIMEOUT: &str = "FBP_CLIENT_COMMAND_TIMEOUT_MS";
pub const ENV_SKIP_VALIDATION: &str = "FBP_CLIENT_SKIP_VALIDATION";
pub const ENV_SKIP_PERMISSIONS: &str = "FBP_CLIENT_SKIP_PERMISSIONS";

/// Tunables of an [`FbpClient`](crate::client::FbpClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// How long connecting and the handshake may take.
    #[serde(with = "millis")]
    pub connection_timeout: Duration,
    /// How long a command waits for its answer. Component commands are
    /// exempt.
    #[serde(with = "millis")]
    pub command_timeout: Duration,
    /// Do not validate messages against the command vocabulary.
    pub skip_validation: bool,
    /// Do not check messages against the granted capabilities.
    pub skip_permissions: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(1000),
            command_timeout: Duration::from_millis(10_000),
            skip_validation: false,
            skip_permissions: false,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the `FBP_CLIENT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`. Values that do not parse
    /// are ignored.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = lookup(ENV_CONNECTION_TIMEOUT).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = lookup(ENV_COMMAND_TIMEOUT).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.command_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = lookup(ENV_SKIP_VALIDATION).and_then(|v| parse_flag(&v)) {
            self.skip_validation = flag;
        }
        if let Some(flag) = lookup(ENV_SKIP_PERMISSIONS).and_then(|v| parse_flag(&v)) {
            self.skip_permissions = flag;
        }
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    pub fn with_skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Durations as integer milliseconds, the unit runtime definitions use.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

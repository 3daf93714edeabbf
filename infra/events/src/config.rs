use crate::error::{EventHubErrorExt, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Prefix for environment overrides, e.g. `DHUB__MATCH_POLICY=owner_and_method`.
pub const ENV_PREFIX: &str = "DHUB";

/// How two handlers are judged to be "the same" subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Compare the bound function only. Two owners registering the same
    /// method share one subscription, and unregistering through either owner
    /// removes it.
    #[default]
    Method,
    /// Compare the bound function and the owning instance.
    OwnerAndMethod,
}

/// Event hub settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub match_policy: MatchPolicy,
    /// Emit a `warn!` record for every absorbed handler failure.
    pub log_failures: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { match_policy: MatchPolicy::Method, log_failures: true }
    }
}

impl HubConfig {
    /// Loads settings from a file, overlaid with `DHUB__*` environment variables.
    ///
    /// Nested keys use double underscores (`DHUB__LOG_FAILURES=false`). The file
    /// format is inferred from its extension.
    ///
    /// # Errors
    /// Returns [`EventHubError::Config`](crate::EventHubError::Config) if the file
    /// is missing or its content does not match [`HubConfig`].
    ///
    /// # Example
    /// ```rust
    /// use dhub_events::HubConfig;
    ///
    /// let cfg = HubConfig::load("config/hub.toml").unwrap_or_default();
    /// assert!(cfg.log_failures);
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let builder = Config::builder().add_source(File::from(path).required(true)).add_source(
            Environment::with_prefix(ENV_PREFIX).separator("__").convert_case(config::Case::Snake),
        );

        info!("Loading event hub config from {}", path.display());

        builder
            .build()
            .context("Failed to build hub config")?
            .try_deserialize::<Self>()
            .context("Failed to deserialize hub config")
    }

    #[must_use]
    pub const fn with_match_policy(mut self, policy: MatchPolicy) -> Self {
        self.match_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_log_failures(mut self, enabled: bool) -> Self {
        self.log_failures = enabled;
        self
    }
}

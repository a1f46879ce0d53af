use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::common::error::configuration_error;

/// Default time budget of the status cache.
pub const DEFAULT_STATUS_CACHE_TTL: Duration = Duration::from_secs(30);

/// Status queries are restricted to the tracked job identifiers while there are at most this many
/// of them, otherwise a query for all jobs (of the filtered user) is issued.
pub const DEFAULT_MAX_SCOPED_QUERY_IDS: usize = 100;

/// What should happen with a job when the backend reports a state that cannot be recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownSubmittedPolicy {
    /// Fail the job on the first such report.
    #[default]
    Fail,
    /// Tolerate the given number of successive reports before failing the job.
    GracePolls(u32),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobManagerOptions {
    /// Overrides the hold-on-submit default of the backend.
    pub hold_jobs: Option<bool>,
    /// Only keep status of jobs that were submitted by this manager.
    pub track_only_started_jobs: bool,
    /// Restrict unscoped status queries to jobs of this user.
    pub user_filter: Option<String>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub status_cache_ttl: Duration,
    #[serde(deserialize_with = "deserialize_opt_duration")]
    pub polling_interval: Option<Duration>,
    pub max_scoped_query_ids: usize,
    pub unknown_submitted_policy: UnknownSubmittedPolicy,
}

impl Default for JobManagerOptions {
    fn default() -> Self {
        Self {
            hold_jobs: None,
            track_only_started_jobs: true,
            user_filter: None,
            status_cache_ttl: DEFAULT_STATUS_CACHE_TTL,
            polling_interval: None,
            max_scoped_query_ids: DEFAULT_MAX_SCOPED_QUERY_IDS,
            unknown_submitted_policy: UnknownSubmittedPolicy::default(),
        }
    }
}

impl JobManagerOptions {
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let options: JobManagerOptions = toml::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Applies overrides from environment variables.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ttl) = get_duration_from_env("CLUSTERQ_STATUS_CACHE_TTL_MS") {
            self.status_cache_ttl = ttl;
        }
        if let Some(interval) = get_duration_from_env("CLUSTERQ_POLLING_INTERVAL_MS") {
            self.polling_interval = Some(interval);
        }
        self
    }

    fn validate(&self) -> crate::Result<()> {
        if self.polling_interval == Some(Duration::ZERO) {
            return configuration_error("Polling interval must be larger than zero");
        }
        Ok(())
    }
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let value = String::deserialize(deserializer)?;
    humantime::parse_duration(&value).map_err(serde::de::Error::custom)
}

fn deserialize_opt_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    value
        .map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
        .transpose()
}

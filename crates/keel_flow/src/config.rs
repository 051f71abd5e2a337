//! Office configuration.

use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime settings for an [`Office`](crate::office::Office).
///
/// Every field has a default, so a configuration file only needs to name
/// what it changes.
///
/// # Example
///
/// ```
/// use core::time::Duration;
/// use keel_flow::config::OfficeConfig;
///
/// let config = OfficeConfig::default()
///     .with_latch_timeout(Duration::from_secs(5))
///     .with_default_team("workers");
/// assert_eq!(config.default_team.as_deref(), Some("workers"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficeConfig {
    /// How long a continuation may wait on a latch before it is failed with a
    /// timeout.
    pub latch_timeout: Duration,
    /// How often the timeout monitor checks for stale waiters.
    pub timeout_check_interval: Duration,
    /// Total steps a single process may run before it is failed.
    pub max_process_steps: usize,
    /// Steps run back to back on one worker before yielding to the team.
    pub max_inline_steps: usize,
    /// Team for work that does not name one. `None` runs such work on the
    /// calling thread.
    pub default_team: Option<String>,
}

impl Default for OfficeConfig {
    fn default() -> Self {
        Self {
            latch_timeout: Duration::from_secs(30),
            timeout_check_interval: Duration::from_secs(1),
            max_process_steps: 100_000,
            max_inline_steps: 64,
            default_team: None,
        }
    }
}

impl OfficeConfig {
    /// Sets the latch timeout.
    #[must_use]
    pub fn with_latch_timeout(mut self, timeout: Duration) -> Self {
        self.latch_timeout = timeout;
        self
    }

    /// Sets the timeout check interval.
    #[must_use]
    pub fn with_timeout_check_interval(mut self, interval: Duration) -> Self {
        self.timeout_check_interval = interval;
        self
    }

    /// Sets the per-process step limit.
    #[must_use]
    pub fn with_max_process_steps(mut self, limit: usize) -> Self {
        self.max_process_steps = limit;
        self
    }

    /// Sets how many steps run inline before yielding.
    #[must_use]
    pub fn with_max_inline_steps(mut self, limit: usize) -> Self {
        self.max_inline_steps = limit.max(1);
        self
    }

    /// Names the default team.
    #[must_use]
    pub fn with_default_team(mut self, team: impl Into<String>) -> Self {
        self.default_team = Some(team.into());
        self
    }
}

//! Tracing subscriber setup for Keel.
//!
//! Every Keel crate logs through [`tracing`]. This crate installs the
//! subscriber that turns those events into output: [`TracingSetup`] picks the
//! level, filter and format, and [`TracingConfig`] carries the same settings
//! in a serializable form for configuration files.
//!
//! # Filter precedence
//!
//! 1. an explicit filter ([`TracingSetup::with_env_filter`])
//! 2. the `KEEL_LOG` environment variable
//! 3. the maximum level ([`TracingSetup::with_level`])
//!
//! # Example
//!
//! ```
//! use keel_telemetry::{TracingFormat, TracingSetup};
//! use tracing::Level;
//!
//! TracingSetup::new()
//!     .with_level(Level::DEBUG)
//!     .with_format(TracingFormat::Compact)
//!     .with_env_filter("keel_flow=debug,keel_system=info")
//!     .init();
//! tracing::info!("ready");
//! ```

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable consulted when no explicit filter is set.
pub const ENV_VAR: &str = "KEEL_LOG";

/// Errors installing a subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The level name is not one of `trace`, `debug`, `info`, `warn`, `error`.
    #[error("invalid level: {0}")]
    InvalidLevel(String),
    /// The filter directive could not be parsed.
    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter {
        /// The directive as given.
        filter: String,
        /// The parser's complaint.
        reason: String,
    },
    /// A global subscriber is already installed.
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingFormat
// ─────────────────────────────────────────────────────────────────────────────

/// Tracing output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingFormat {
    /// Human-readable multi-line output (default).
    #[default]
    Pretty,
    /// Compact single-line output.
    Compact,
    /// JSON structured output for log aggregation.
    Json,
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Serializable tracing settings.
///
/// # Example
///
/// ```
/// use keel_telemetry::{TracingConfig, TracingFormat, TracingSetup};
///
/// let config = TracingConfig {
///     level: "warn".into(),
///     format: TracingFormat::Json,
///     ..TracingConfig::default()
/// };
/// let setup = TracingSetup::from_config(&config).unwrap();
/// assert_eq!(setup.level(), tracing::Level::WARN);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Maximum level, by name.
    pub level: String,
    /// Output format.
    pub format: TracingFormat,
    /// Target-specific directives, e.g. `keel_flow=debug`.
    pub filter: Option<String>,
    /// Whether span enter/exit events are printed.
    pub span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: TracingFormat::default(),
            filter: None,
            span_events: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingSetup
// ─────────────────────────────────────────────────────────────────────────────

/// Builds and installs the global tracing subscriber.
#[derive(Debug, Clone)]
pub struct TracingSetup {
    level: Level,
    format: TracingFormat,
    env_filter: Option<String>,
    span_events: bool,
}

impl Default for TracingSetup {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: TracingFormat::Pretty,
            env_filter: None,
            span_events: false,
        }
    }
}

impl TracingSetup {
    /// Creates a setup with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a setup from serialized settings.
    ///
    /// # Errors
    ///
    /// [`TelemetryError::InvalidLevel`] if the level name is unknown.
    pub fn from_config(config: &TracingConfig) -> Result<Self, TelemetryError> {
        let level = Level::from_str(&config.level).map_err(|_| TelemetryError::InvalidLevel(config.level.clone()))?;
        Ok(Self {
            level,
            format: config.format,
            env_filter: config.filter.clone(),
            span_events: config.span_events,
        })
    }

    /// Sets the maximum log level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets target-specific directives: `target=level,target=level,...`.
    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Enables span enter/exit events in output.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Returns the maximum level.
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    /// Returns the output format.
    #[must_use]
    pub fn format(&self) -> TracingFormat {
        self.format
    }

    /// Builds the filter, following the documented precedence.
    ///
    /// # Errors
    ///
    /// [`TelemetryError::InvalidFilter`] if the explicit filter does not parse.
    pub fn filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Some(filter) = &self.env_filter {
            return EnvFilter::try_new(filter).map_err(|error| TelemetryError::InvalidFilter {
                filter: filter.clone(),
                reason: error.to_string(),
            });
        }
        Ok(EnvFilter::try_from_env(ENV_VAR).unwrap_or_else(|_| EnvFilter::new(self.level.as_str())))
    }

    /// Installs the subscriber.
    ///
    /// # Errors
    ///
    /// An invalid filter, or [`TelemetryError::AlreadyInitialized`].
    pub fn try_init(&self) -> Result<(), TelemetryError> {
        let filter = self.filter()?;
        let span_events = if self.span_events {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        };

        let installed = match self.format {
            TracingFormat::Pretty => tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().pretty().with_span_events(span_events))
                .try_init(),
            TracingFormat::Compact => tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact().with_span_events(span_events))
                .try_init(),
            TracingFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_span_events(span_events))
                .try_init(),
        };
        installed.map_err(|_| TelemetryError::AlreadyInitialized)?;

        tracing::info!(level = %self.level, format = ?self.format, "tracing initialized");
        Ok(())
    }

    /// Installs the subscriber, keeping any one already installed.
    ///
    /// An invalid filter falls back to the maximum level.
    pub fn init(&self) {
        match self.try_init() {
            Ok(()) | Err(TelemetryError::AlreadyInitialized) => {}
            Err(_) => {
                let fallback = Self {
                    env_filter: Some(self.level.as_str().to_owned()),
                    ..self.clone()
                };
                fallback.try_init().ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let setup = TracingSetup::default();
        assert_eq!(setup.level(), Level::INFO);
        assert_eq!(setup.format(), TracingFormat::Pretty);
        assert!(!setup.span_events);
    }

    #[test]
    fn builders() {
        let setup = TracingSetup::new()
            .with_level(Level::DEBUG)
            .with_format(TracingFormat::Json)
            .with_env_filter("keel_flow=trace")
            .with_span_events(true);
        assert_eq!(setup.level(), Level::DEBUG);
        assert_eq!(setup.format(), TracingFormat::Json);
        assert_eq!(setup.env_filter.as_deref(), Some("keel_flow=trace"));
        assert!(setup.span_events);
    }

    #[test]
    fn invalid_filter_is_reported() {
        let setup = TracingSetup::new().with_env_filter("keel_flow=loud");
        assert!(matches!(
            setup.filter(),
            Err(TelemetryError::InvalidFilter { filter, .. }) if filter == "keel_flow=loud"
        ));
    }

    #[test]
    fn config_parses_levels() {
        let config: TracingConfig = serde_json::from_str(r#"{ "level": "debug", "format": "compact" }"#).unwrap();
        let setup = TracingSetup::from_config(&config).unwrap();
        assert_eq!(setup.level(), Level::DEBUG);
        assert_eq!(setup.format(), TracingFormat::Compact);

        let config = TracingConfig {
            level: "chatty".into(),
            ..TracingConfig::default()
        };
        assert!(matches!(
            TracingSetup::from_config(&config),
            Err(TelemetryError::InvalidLevel(level)) if level == "chatty"
        ));
    }

    #[test]
    fn second_install_is_refused() {
        let setup = TracingSetup::new().with_format(TracingFormat::Compact);
        setup.init();
        assert!(matches!(setup.try_init(), Err(TelemetryError::AlreadyInitialized)));
    }
}

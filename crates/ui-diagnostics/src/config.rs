// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration: which subsystems run and the thresholds they use.

use crate::error::DiagnosticsError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_REDRAW_THRESHOLD_PER_SECOND: u32 = 60;
pub const DEFAULT_LAYOUT_LOOP_THRESHOLD: u32 = 20;
pub const DEFAULT_LEAK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_LONG_RUNNING_TASK_THRESHOLD: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_STORED_EVENTS: usize = 10_000;

/// Lowest capacity the metrics store accepts.
pub const MIN_STORED_EVENTS: usize = 100;

const ENV_PREFIX: &str = "UI_DIAGNOSTICS_";

/// Configuration for the diagnostics engine.
///
/// Values are immutable once handed to [`crate::Diagnostics::start`]; a new
/// configuration only takes effect after a stop/start cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
    /// Count render invocations and report rate breaches.
    pub enable_redraw_tracking: bool,
    /// Count layout passes and detect oscillation.
    pub enable_layout_tracking: bool,
    /// Track registered objects for suspected leaks.
    pub enable_memory_tracking: bool,
    /// Track state mutations and off-main-context writes.
    pub enable_state_tracking: bool,
    /// Track background work lifecycle.
    pub enable_concurrency_tracking: bool,
    /// Run the periodic performance sampler.
    pub enable_performance_tracking: bool,
    /// Redraws per second at or above which a breach is reported.
    pub redraw_threshold_per_second: u32,
    /// Layout passes at or above which a loop is suspected.
    pub layout_loop_threshold: u32,
    /// Grace period after registration before a live object is a suspected leak.
    pub leak_timeout: Duration,
    /// Elapsed time after which unfinished work is reported as long-running.
    pub long_running_task_threshold: Duration,
    /// Capacity of the metrics store, clamped to [`MIN_STORED_EVENTS`].
    pub max_stored_events: usize,
    /// Run instrumentation in release builds as well.
    pub use_in_release: bool,
    /// Forward every stored event to the log output.
    pub log_to_console: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            enable_redraw_tracking: true,
            enable_layout_tracking: true,
            enable_memory_tracking: true,
            enable_state_tracking: true,
            enable_concurrency_tracking: true,
            enable_performance_tracking: true,
            redraw_threshold_per_second: DEFAULT_REDRAW_THRESHOLD_PER_SECOND,
            layout_loop_threshold: DEFAULT_LAYOUT_LOOP_THRESHOLD,
            leak_timeout: DEFAULT_LEAK_TIMEOUT,
            long_running_task_threshold: DEFAULT_LONG_RUNNING_TASK_THRESHOLD,
            max_stored_events: DEFAULT_MAX_STORED_EVENTS,
            use_in_release: false,
            log_to_console: true,
        }
    }
}

impl Configuration {
    /// All tracking switched off, console logging off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enable_redraw_tracking: false,
            enable_layout_tracking: false,
            enable_memory_tracking: false,
            enable_state_tracking: false,
            enable_concurrency_tracking: false,
            enable_performance_tracking: false,
            log_to_console: false,
            ..Self::default()
        }
    }

    /// Capacity the metrics store will actually use.
    #[must_use]
    pub fn effective_max_stored_events(&self) -> usize {
        self.max_stored_events.max(MIN_STORED_EVENTS)
    }

    /// Whether instrumentation should run in the current build profile.
    #[must_use]
    pub fn allowed_in_current_build(&self) -> bool {
        cfg!(debug_assertions) || self.use_in_release
    }

    /// Create configuration from `UI_DIAGNOSTICS_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, DiagnosticsError> {
        let defaults = Self::default();

        let config = Self {
            enable_redraw_tracking: env_flag("ENABLE_REDRAW", defaults.enable_redraw_tracking),
            enable_layout_tracking: env_flag("ENABLE_LAYOUT", defaults.enable_layout_tracking),
            enable_memory_tracking: env_flag("ENABLE_MEMORY", defaults.enable_memory_tracking),
            enable_state_tracking: env_flag("ENABLE_STATE", defaults.enable_state_tracking),
            enable_concurrency_tracking: env_flag(
                "ENABLE_CONCURRENCY",
                defaults.enable_concurrency_tracking,
            ),
            enable_performance_tracking: env_flag(
                "ENABLE_PERFORMANCE",
                defaults.enable_performance_tracking,
            ),
            redraw_threshold_per_second: env_number(
                "REDRAW_THRESHOLD",
                defaults.redraw_threshold_per_second,
            )?,
            layout_loop_threshold: env_number(
                "LAYOUT_LOOP_THRESHOLD",
                defaults.layout_loop_threshold,
            )?,
            leak_timeout: Duration::from_secs(env_number(
                "LEAK_TIMEOUT_SECS",
                defaults.leak_timeout.as_secs(),
            )?),
            long_running_task_threshold: Duration::from_secs(env_number(
                "LONG_RUNNING_TASK_SECS",
                defaults.long_running_task_threshold.as_secs(),
            )?),
            max_stored_events: env_number("MAX_STORED_EVENTS", defaults.max_stored_events)?,
            use_in_release: env_flag("USE_IN_RELEASE", defaults.use_in_release),
            log_to_console: env_flag("LOG_TO_CONSOLE", defaults.log_to_console),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), DiagnosticsError> {
        if self.redraw_threshold_per_second == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "redraw threshold must be greater than 0".to_string(),
            ));
        }

        if self.layout_loop_threshold == 0 {
            return Err(DiagnosticsError::InvalidConfig(
                "layout loop threshold must be greater than 0".to_string(),
            ));
        }

        if self.leak_timeout.is_zero() {
            return Err(DiagnosticsError::InvalidConfig(
                "leak timeout must be greater than 0".to_string(),
            ));
        }

        if self.long_running_task_threshold.is_zero() {
            return Err(DiagnosticsError::InvalidConfig(
                "long-running task threshold must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(format!("{ENV_PREFIX}{name}"))
        .map(|val| !matches!(val.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
        .unwrap_or(default)
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T, DiagnosticsError> {
    match env::var(format!("{ENV_PREFIX}{name}")) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            DiagnosticsError::InvalidConfig(format!("{ENV_PREFIX}{name} is not a valid number: '{raw}'"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        let config = Configuration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.redraw_threshold_per_second, 60);
        assert_eq!(config.layout_loop_threshold, 20);
        assert_eq!(config.leak_timeout, Duration::from_secs(10));
        assert_eq!(config.long_running_task_threshold, Duration::from_secs(5));
        assert_eq!(config.max_stored_events, 10_000);
        assert!(!config.use_in_release);
        assert!(config.log_to_console);
    }

    #[test]
    fn test_disabled_turns_everything_off() {
        let config = Configuration::disabled();
        assert!(!config.enable_redraw_tracking);
        assert!(!config.enable_layout_tracking);
        assert!(!config.enable_memory_tracking);
        assert!(!config.enable_state_tracking);
        assert!(!config.enable_concurrency_tracking);
        assert!(!config.enable_performance_tracking);
        assert!(!config.log_to_console);
        assert_eq!(config.redraw_threshold_per_second, 60);
    }

    #[test]
    fn test_effective_capacity_has_floor() {
        let config = Configuration {
            max_stored_events: 5,
            ..Default::default()
        };
        assert_eq!(config.effective_max_stored_events(), 100);

        let config = Configuration {
            max_stored_events: 250,
            ..Default::default()
        };
        assert_eq!(config.effective_max_stored_events(), 250);
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let config = Configuration {
            redraw_threshold_per_second: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Configuration {
            layout_loop_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Configuration {
            leak_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Configuration {
            long_running_task_threshold: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serializes_with_camel_case_keys() {
        let value = serde_json::to_value(Configuration::default()).unwrap();
        assert_eq!(value["redrawThresholdPerSecond"], 60);
        assert_eq!(value["maxStoredEvents"], 10_000);
        assert_eq!(value["logToConsole"], true);
    }

    #[test]
    fn test_deserialize_fills_missing_fields_with_defaults() {
        let config: Configuration =
            serde_json::from_str(r#"{"layoutLoopThreshold": 7, "enableStateTracking": false}"#)
                .unwrap();
        assert_eq!(config.layout_loop_threshold, 7);
        assert!(!config.enable_state_tracking);
        assert!(config.enable_redraw_tracking);
        assert_eq!(config.max_stored_events, 10_000);
    }

    #[test]
    fn test_env_flag_parsing() {
        assert!(env_flag("SURELY_UNSET_FLAG", true));
        assert!(!env_flag("SURELY_UNSET_FLAG", false));
    }

    #[test]
    fn test_env_number_defaults_when_unset() {
        let value: u32 = env_number("SURELY_UNSET_NUMBER", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        env::set_var("UI_DIAGNOSTICS_LAYOUT_LOOP_THRESHOLD", "7");
        env::set_var("UI_DIAGNOSTICS_ENABLE_STATE", "false");
        env::set_var("UI_DIAGNOSTICS_LEAK_TIMEOUT_SECS", "30");

        let config = Configuration::from_env();

        env::remove_var("UI_DIAGNOSTICS_LAYOUT_LOOP_THRESHOLD");
        env::remove_var("UI_DIAGNOSTICS_ENABLE_STATE");
        env::remove_var("UI_DIAGNOSTICS_LEAK_TIMEOUT_SECS");

        let config = config.expect("config should parse");
        assert_eq!(config.layout_loop_threshold, 7);
        assert!(!config.enable_state_tracking);
        assert_eq!(config.leak_timeout, Duration::from_secs(30));
        assert!(config.enable_redraw_tracking);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_invalid_values() {
        env::set_var("UI_DIAGNOSTICS_REDRAW_THRESHOLD", "lots");
        let result = Configuration::from_env();
        env::remove_var("UI_DIAGNOSTICS_REDRAW_THRESHOLD");
        assert!(matches!(result, Err(DiagnosticsError::InvalidConfig(_))));

        env::set_var("UI_DIAGNOSTICS_REDRAW_THRESHOLD", "0");
        let result = Configuration::from_env();
        env::remove_var("UI_DIAGNOSTICS_REDRAW_THRESHOLD");
        assert!(matches!(result, Err(DiagnosticsError::InvalidConfig(_))));
    }
}

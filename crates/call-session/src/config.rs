use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::ConnectMode;

pub const DEFAULT_CALL_TIMEOUT_SECS: f32 = 5.0;
pub const MIN_CALL_TIMEOUT_SECS: f32 = 2.0;
pub const MAX_CALL_TIMEOUT_SECS: f32 = 150.0;

/// Channel opened when no default channels are configured.
pub const FALLBACK_CHANNEL_LABEL: &str = "defaultChannel";

const ENV_TIMEOUT: &str = "CALL_TIMEOUT_SECONDS";
const ENV_IGNORE_NON_FATAL: &str = "CALL_IGNORE_NON_FATAL_CONNECT_ERRORS";
const ENV_RELIABLE: &str = "CALL_RELIABLE_CHANNELS";
const ENV_UNRELIABLE: &str = "CALL_UNRELIABLE_CHANNELS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid call config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Call settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Seconds to wait for the transport to report a connection before the
    /// attempt is failed. Clamped to `[2, 150]`.
    pub call_timeout_seconds: f32,
    /// Suppress non-fatal errors raised while starting the connection.
    pub ignore_non_fatal_connect_errors: bool,
    /// Ordered, reliable channels opened before connecting.
    pub default_reliable_channel_labels: Vec<String>,
    /// Unordered, unreliable channels opened before connecting.
    pub default_unreliable_channel_labels: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            call_timeout_seconds: DEFAULT_CALL_TIMEOUT_SECS,
            ignore_non_fatal_connect_errors: true,
            default_reliable_channel_labels: Vec::new(),
            default_unreliable_channel_labels: Vec::new(),
        }
    }
}

/// A channel the controller opens when a call starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub label: String,
    pub ordered: bool,
    pub reliable: bool,
}

impl ChannelSpec {
    pub fn reliable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ordered: true,
            reliable: true,
        }
    }

    pub fn unreliable(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ordered: false,
            reliable: false,
        }
    }
}

impl CallConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(secs) = env::var(ENV_TIMEOUT).ok().and_then(|v| v.trim().parse().ok()) {
            self.call_timeout_seconds = secs;
        }
        if let Some(flag) = env_flag(ENV_IGNORE_NON_FATAL) {
            self.ignore_non_fatal_connect_errors = flag;
        }
        if let Some(labels) = env_list(ENV_RELIABLE) {
            self.default_reliable_channel_labels = labels;
        }
        if let Some(labels) = env_list(ENV_UNRELIABLE) {
            self.default_unreliable_channel_labels = labels;
        }
        self
    }

    pub fn call_timeout(&self) -> Duration {
        let secs = if self.call_timeout_seconds.is_finite() {
            self.call_timeout_seconds
                .clamp(MIN_CALL_TIMEOUT_SECS, MAX_CALL_TIMEOUT_SECS)
        } else {
            DEFAULT_CALL_TIMEOUT_SECS
        };
        Duration::from_secs_f32(secs)
    }

    pub fn connect_mode(&self) -> ConnectMode {
        if self.ignore_non_fatal_connect_errors {
            ConnectMode::IgnoreNonFatal
        } else {
            ConnectMode::Strict
        }
    }

    /// Channels to allocate on call start: reliable labels first, then
    /// unreliable ones, or the single fallback channel when both are empty.
    pub fn default_channels(&self) -> Vec<ChannelSpec> {
        if self.default_reliable_channel_labels.is_empty()
            && self.default_unreliable_channel_labels.is_empty()
        {
            return vec![ChannelSpec::reliable(FALLBACK_CHANNEL_LABEL)];
        }
        self.default_reliable_channel_labels
            .iter()
            .map(ChannelSpec::reliable)
            .chain(
                self.default_unreliable_channel_labels
                    .iter()
                    .map(ChannelSpec::unreliable),
            )
            .collect()
    }
}

pub(crate) fn env_flag(var: &str) -> Option<bool> {
    let value = env::var(var).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_list(var: &str) -> Option<Vec<String>> {
    let value = env::var(var).ok()?;
    Some(
        value
            .split(',')
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear_env() {
        unsafe {
            for var in [ENV_TIMEOUT, ENV_IGNORE_NON_FATAL, ENV_RELIABLE, ENV_UNRELIABLE] {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = CallConfig::default();
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        assert_eq!(config.connect_mode(), ConnectMode::IgnoreNonFatal);
        assert_eq!(
            config.default_channels(),
            vec![ChannelSpec::reliable(FALLBACK_CHANNEL_LABEL)]
        );
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut config = CallConfig::default();
        config.call_timeout_seconds = 0.5;
        assert_eq!(config.call_timeout(), Duration::from_secs(2));
        config.call_timeout_seconds = 900.0;
        assert_eq!(config.call_timeout(), Duration::from_secs(150));
        config.call_timeout_seconds = f32::NAN;
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        config.call_timeout_seconds = 2.5;
        assert_eq!(config.call_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_default_channels_keep_list_order() {
        let config = CallConfig {
            default_reliable_channel_labels: vec!["clickedVideo".into(), "shapeModifiers".into()],
            default_unreliable_channel_labels: vec!["axisGizmo".into()],
            ..CallConfig::default()
        };
        assert_eq!(
            config.default_channels(),
            vec![
                ChannelSpec::reliable("clickedVideo"),
                ChannelSpec::reliable("shapeModifiers"),
                ChannelSpec::unreliable("axisGizmo"),
            ]
        );
    }

    #[test]
    fn test_config_from_toml() {
        let config = CallConfig::from_toml_str(
            r#"
            call_timeout_seconds = 12.5
            ignore_non_fatal_connect_errors = false
            default_unreliable_channel_labels = ["axisGizmo"]
            "#,
        )
        .expect("parse");
        assert_eq!(config.call_timeout(), Duration::from_millis(12_500));
        assert_eq!(config.connect_mode(), ConnectMode::Strict);
        assert!(config.default_reliable_channel_labels.is_empty());
        assert_eq!(config.default_channels(), vec![ChannelSpec::unreliable("axisGizmo")]);

        assert!(CallConfig::from_toml_str("call_timeout_seconds = \"soon\"").is_err());
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let err = CallConfig::load("/nonexistent/call.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { ref path, .. } if path.ends_with("call.toml")));
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(CallConfig::from_env(), CallConfig::default());
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(ENV_TIMEOUT, "30");
            env::set_var(ENV_IGNORE_NON_FATAL, "off");
            env::set_var(ENV_RELIABLE, "clickedVideo, shapeModifiers,");
            env::set_var(ENV_UNRELIABLE, "axisGizmo");
        }
        let config = CallConfig::from_env();
        clear_env();

        assert_eq!(config.call_timeout(), Duration::from_secs(30));
        assert!(!config.ignore_non_fatal_connect_errors);
        assert_eq!(
            config.default_reliable_channel_labels,
            vec!["clickedVideo".to_string(), "shapeModifiers".to_string()]
        );
        assert_eq!(config.default_unreliable_channel_labels, vec!["axisGizmo".to_string()]);
    }
}

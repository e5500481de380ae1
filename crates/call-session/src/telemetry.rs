//! Logging setup shared by the call binaries and payload helpers used when
//! tracing message traffic.

/// Printable preview of a message payload, cut at `max` bytes.
pub fn payload_preview(payload: &[u8], max: usize) -> String {
    let shown = &payload[..payload.len().min(max)];
    let mut out: String = match std::str::from_utf8(shown) {
        Ok(text) => text
            .chars()
            .map(|ch| if ch.is_control() { '.' } else { ch })
            .collect(),
        Err(_) => shown.iter().map(|byte| format!("{byte:02x}")).collect(),
    };
    if payload.len() > max {
        out.push_str(&format!("... (+{} bytes)", payload.len() - max));
    }
    out
}

pub mod logging {
    use std::fs::{self, OpenOptions};
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    use crate::config::env_flag;

    pub const FILTER_ENV: &str = "CALL_LOG_FILTER";
    pub const TRACE_DEPS_ENV: &str = "CALL_TRACE_DEPS";

    /// Targets raised to the requested level at debug and trace.
    const CALL_TARGETS: &[&str] = &["call", "call_session", "transport_webrtc", "call_loopback"];

    /// webrtc-rs internals; held at info under trace unless asked for.
    const WEBRTC_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_mdns",
        "webrtc_data",
        "turn",
        "stun",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Append to this file instead of writing to stderr. Missing parent
        /// directories are created.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to install subscriber: {0}")]
        Configure(String),
    }

    /// Directive string handed to [`EnvFilter`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct FilterPlan {
        pub directives: String,
        pub webrtc_throttled: bool,
    }

    impl FilterPlan {
        pub(crate) fn for_level(level: LogLevel, webrtc_traces: bool) -> Self {
            let mut directives = match level {
                LogLevel::Debug | LogLevel::Trace => {
                    let name = if level == LogLevel::Trace { "trace" } else { "debug" };
                    let mut parts = vec!["info".to_owned()];
                    parts.extend(CALL_TARGETS.iter().map(|target| format!("{target}={name}")));
                    parts.join(",")
                }
                LogLevel::Info => "info".to_owned(),
                LogLevel::Warn => "warn".to_owned(),
                LogLevel::Error => "error".to_owned(),
            };

            let webrtc_throttled = level == LogLevel::Trace && !webrtc_traces;
            if webrtc_throttled {
                for target in WEBRTC_TARGETS {
                    directives.push_str(&format!(",{target}=info"));
                }
            }
            Self {
                directives,
                webrtc_throttled,
            }
        }
    }

    static INSTALLED: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INSTALLED.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let io_err = |source: std::io::Error| InitError::Io {
                    path: path.clone(),
                    source,
                };
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent).map_err(io_err)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(io_err)?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let (filter, plan) = match std::env::var(FILTER_ENV) {
            Ok(custom) => (EnvFilter::new(custom), None),
            Err(_) => {
                let plan = FilterPlan::for_level(
                    config.level,
                    env_flag(TRACE_DEPS_ENV).unwrap_or(false),
                );
                (EnvFilter::new(&plan.directives), Some(plan))
            }
        };

        let verbose = config.level >= LogLevel::Debug;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(verbose)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = INSTALLED.set(guard);
        if plan.is_some_and(|plan| plan.webrtc_throttled) {
            tracing::debug!(
                target: "call::telemetry",
                "webrtc internals held at info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to see them"
            );
        }
        Ok(())
    }

}

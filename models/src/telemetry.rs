//! Structured logging for the reaper, configured from environment variables.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

const FILTER_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const FORMAT_ENV_VAR: &str = "LOGGING_FORMATTER";
const ANSI_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// Shape of emitted log lines. Names match `tracing_subscriber::fmt::format`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Full,
    Compact,
    /// Multi-line, for reading at a terminal.
    Pretty,
    /// One JSON object per event. Cluster log pipelines expect this.
    #[default]
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogFormatter {
    message_format: MessageFormat,
    ansi_enabled: bool,
}

impl LogFormatter {
    pub fn new(message_format: MessageFormat, ansi_enabled: bool) -> Self {
        LogFormatter {
            message_format,
            ansi_enabled,
        }
    }

    pub fn try_from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the formatter through `lookup`. Unset variables fall back to JSON without color.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let message_format = match lookup(FORMAT_ENV_VAR) {
            None => MessageFormat::default(),
            Some(raw) => serde_plain::from_str(raw.trim().to_lowercase().as_str())
                .context(error::LogFormatterEnvSnafu { env_value: raw })?,
        };
        let ansi_enabled = match lookup(ANSI_ENV_VAR) {
            None => false,
            Some(raw) => raw
                .trim()
                .to_lowercase()
                .parse()
                .context(error::LogAnsiEnvSnafu { env_value: raw })?,
        };

        Ok(Self::new(message_format, ansi_enabled))
    }

    fn install_on<S>(self, subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + 'static + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let layer = fmt::layer().with_ansi(self.ansi_enabled);
        match self.message_format {
            MessageFormat::Full => Box::new(subscriber.with(layer)),
            MessageFormat::Compact => Box::new(subscriber.with(layer.compact())),
            MessageFormat::Pretty => Box::new(subscriber.with(layer.pretty())),
            MessageFormat::Json => Box::new(subscriber.with(layer.json())),
        }
    }
}

/// Sets the process-wide subscriber. Call once, before any events are emitted.
pub fn init_telemetry_from_env() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_LEVEL.into())
        .with_env_var(FILTER_ENV_VAR)
        .from_env_lossy();
    let subscriber = LogFormatter::try_from_env()?.install_on(Registry::default().with(filter));

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)
}

pub mod error {
    use super::{ANSI_ENV_VAR, FORMAT_ENV_VAR};
    use snafu::Snafu;
    use std::str::ParseBoolError;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Unable to install the tracing subscriber: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Unknown log format in '{}={}': '{}'",
            FORMAT_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Expected true or false in '{}={}': '{}'",
            ANSI_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;

use serde::Deserialize;

/// Stdio logging mode, mirroring the three ways `tracing-subscriber`
/// can render to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> Self {
    match level {
      LogLevel::Error => tracing::Level::ERROR,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Trace => tracing::Level::TRACE,
    }
  }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for LogLevel {
  fn value_variants<'a>() -> &'a [Self] {
    &[
      LogLevel::Error,
      LogLevel::Warn,
      LogLevel::Info,
      LogLevel::Debug,
      LogLevel::Trace,
    ]
  }

  fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
    Some(clap::builder::PossibleValue::new(match self {
      LogLevel::Error => "error",
      LogLevel::Warn => "warn",
      LogLevel::Info => "info",
      LogLevel::Debug => "debug",
      LogLevel::Trace => "trace",
    }))
  }
}

impl std::fmt::Display for LogLevel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      LogLevel::Error => "error",
      LogLevel::Warn => "warn",
      LogLevel::Info => "info",
      LogLevel::Debug => "debug",
      LogLevel::Trace => "trace",
    };
    write!(f, "{s}")
  }
}

/// Logging configuration resolved from [`super::Config`]. `json` wins
/// over `pretty` if both are set.
#[derive(Debug, Clone)]
pub struct LogConfig {
  pub level: LogLevel,
  pub pretty: bool,
  pub json: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self { level: LogLevel::default(), pretty: false, json: false }
  }
}

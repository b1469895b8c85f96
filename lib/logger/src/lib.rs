use anyhow::Context;
use config::LogConfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Installs the global `tracing` subscriber. `json` takes priority over
/// `pretty` when both are set. No OTLP export: this deployment has no
/// collector to send to.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();
  let registry = Registry::default().with(LevelFilter::from(log_level));

  match (config.json, config.pretty) {
    (true, _) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    (false, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
    (false, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
  }
  .context("failed to init logger")
}

use std::sync::OnceLock;

use clap::Parser;
use config::{Config, Env, LogLevel};

/// CLI overrides, layered on top of environment variables: env vars are
/// the primary surface, flags exist for local runs and ad-hoc
/// overrides.
#[derive(Debug, Parser)]
#[command(author, version, about = "CanopyOS update and backup orchestrator")]
pub struct CliArgs {
  /// Override LOG_LEVEL.
  #[arg(long)]
  pub log_level: Option<LogLevel>,

  /// Override PORT.
  #[arg(long)]
  pub port: Option<u16>,

  /// Override BIND_IP.
  #[arg(long)]
  pub bind_ip: Option<String>,
}

pub fn orchestrator_config() -> &'static Config {
  static CONFIG: OnceLock<Config> = OnceLock::new();
  CONFIG.get_or_init(|| {
    let env: Env = envy::from_env().expect("failed to parse environment");
    let args = CliArgs::parse();

    let mut config: Config = env.into();
    if let Some(level) = args.log_level {
      config.logging.level = level;
    }
    if let Some(port) = args.port {
      config.port = port;
    }
    if let Some(bind_ip) = args.bind_ip {
      config.bind_ip = bind_ip;
    }
    config
  })
}

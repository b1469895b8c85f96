//! Configuration types for the updater.
//!
//! [Env] is parsed directly from the process environment with `envy`;
//! [Config] is the fully-resolved value the rest of the crate reads
//! through a single `OnceLock` in `main`. CLI override flags live in
//! the binary crate, which layers them on top of [Config] after
//! resolution.

use std::path::PathBuf;

use serde::Deserialize;

mod logging;

pub use logging::{LogConfig, LogLevel};

/// Raw environment variables for the update and backup orchestrator.
/// Field names are lowercase so that `envy` matches them
/// case-insensitively against `UPPER_SNAKE_CASE` env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct Env {
  #[serde(default = "default_update_logs_dir")]
  pub update_logs_dir: PathBuf,
  #[serde(default = "default_workdir")]
  pub workdir: PathBuf,
  #[serde(default = "default_compose_project_name")]
  pub compose_project_name: String,
  #[serde(default = "default_deployment_repo_url")]
  pub deployment_repo_url: String,
  pub docker_bin: Option<PathBuf>,
  pub update_include: Option<String>,
  #[serde(default = "default_update_exclude")]
  pub update_exclude: String,
  #[serde(default = "default_update_health_services")]
  pub update_health_services: String,
  #[serde(default = "default_health_timeout_seconds")]
  pub health_timeout_seconds: u64,
  #[serde(default = "default_compose_timeout_seconds")]
  pub compose_timeout_seconds: u64,
  #[serde(default = "default_sse_heartbeat_seconds")]
  pub sse_heartbeat_seconds: u64,
  #[serde(default = "default_version_channel_default")]
  pub version_channel_default: String,
  pub version_manifest_url: Option<String>,
  #[serde(default = "default_version_cache_ttl_seconds")]
  pub version_cache_ttl_seconds: i64,
  #[serde(default = "default_version_min_refresh_seconds")]
  pub version_min_refresh_seconds: i64,
  #[serde(default = "default_backups_dir")]
  pub backups_dir: PathBuf,
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,
  #[serde(default = "default_port")]
  pub port: u16,
  #[serde(default)]
  pub log_level: LogLevel,
  #[serde(default)]
  pub log_pretty: bool,
  #[serde(default)]
  pub log_json: bool,
}

fn default_update_logs_dir() -> PathBuf {
  PathBuf::from("/update_logs")
}
fn default_workdir() -> PathBuf {
  PathBuf::from("/workspace")
}
fn default_compose_project_name() -> String {
  "canopyos".into()
}
fn default_deployment_repo_url() -> String {
  "https://github.com/canopyos/canopyos/archive/refs/heads/main.tar.gz".into()
}
fn default_update_exclude() -> String {
  "updater".into()
}
fn default_update_health_services() -> String {
  "postgres,influxdb,backend".into()
}
fn default_health_timeout_seconds() -> u64 {
  300
}
fn default_compose_timeout_seconds() -> u64 {
  600
}
fn default_sse_heartbeat_seconds() -> u64 {
  15
}
fn default_version_channel_default() -> String {
  "stable".into()
}
fn default_version_cache_ttl_seconds() -> i64 {
  3600
}
fn default_version_min_refresh_seconds() -> i64 {
  120
}
fn default_backups_dir() -> PathBuf {
  PathBuf::from("/backups")
}
fn default_bind_ip() -> String {
  "0.0.0.0".into()
}
fn default_port() -> u16 {
  8120
}

impl Default for Env {
  fn default() -> Self {
    Self {
      update_logs_dir: default_update_logs_dir(),
      workdir: default_workdir(),
      compose_project_name: default_compose_project_name(),
      deployment_repo_url: default_deployment_repo_url(),
      docker_bin: None,
      update_include: None,
      update_exclude: default_update_exclude(),
      update_health_services: default_update_health_services(),
      health_timeout_seconds: default_health_timeout_seconds(),
      compose_timeout_seconds: default_compose_timeout_seconds(),
      sse_heartbeat_seconds: default_sse_heartbeat_seconds(),
      version_channel_default: default_version_channel_default(),
      version_manifest_url: None,
      version_cache_ttl_seconds: default_version_cache_ttl_seconds(),
      version_min_refresh_seconds:
        default_version_min_refresh_seconds(),
      backups_dir: default_backups_dir(),
      bind_ip: default_bind_ip(),
      port: default_port(),
      log_level: LogLevel::default(),
      log_pretty: false,
      log_json: false,
    }
  }
}

/// Fully-resolved configuration. Built from [Env] plus any CLI
/// overrides by the binary's `config` module.
#[derive(Debug, Clone)]
pub struct Config {
  pub update_logs_dir: PathBuf,
  pub workdir: PathBuf,
  pub compose_project_name: String,
  pub deployment_repo_url: String,
  pub docker_bin: Option<PathBuf>,
  pub update_include: Vec<String>,
  pub update_exclude: Vec<String>,
  pub update_health_services: Vec<String>,
  pub health_timeout_seconds: u64,
  pub compose_timeout_seconds: u64,
  pub sse_heartbeat_seconds: u64,
  pub version_channel_default: String,
  pub version_manifest_url: Option<String>,
  pub version_cache_ttl_seconds: i64,
  pub version_min_refresh_seconds: i64,
  pub backups_dir: PathBuf,
  pub bind_ip: String,
  pub port: u16,
  pub logging: LogConfig,
}

fn split_csv(s: &str) -> Vec<String> {
  s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

impl From<Env> for Config {
  fn from(env: Env) -> Self {
    Self {
      update_logs_dir: env.update_logs_dir,
      workdir: env.workdir,
      compose_project_name: env.compose_project_name,
      deployment_repo_url: env.deployment_repo_url,
      docker_bin: env.docker_bin,
      update_include: env
        .update_include
        .map(|s| split_csv(&s))
        .unwrap_or_default(),
      update_exclude: split_csv(&env.update_exclude),
      update_health_services: split_csv(&env.update_health_services),
      health_timeout_seconds: env.health_timeout_seconds,
      compose_timeout_seconds: env.compose_timeout_seconds,
      sse_heartbeat_seconds: env.sse_heartbeat_seconds,
      version_channel_default: env.version_channel_default,
      version_manifest_url: env.version_manifest_url,
      version_cache_ttl_seconds: env.version_cache_ttl_seconds,
      version_min_refresh_seconds: env.version_min_refresh_seconds,
      backups_dir: env.backups_dir,
      bind_ip: env.bind_ip,
      port: env.port,
      logging: LogConfig {
        level: env.log_level,
        pretty: env.log_pretty,
        json: env.log_json,
      },
    }
  }
}

impl Config {
  /// Returns the service set to operate on for an update: `update_include`
  /// if set (exclusions are then ignored entirely), otherwise the
  /// default service list minus `update_exclude`.
  pub fn update_services(&self) -> Vec<String> {
    if !self.update_include.is_empty() {
      return self.update_include.clone();
    }
    const DEFAULT_SERVICES: &[&str] = &[
      "influxdb",
      "postgres",
      "app",
      "python_backend",
      "docker-proxy",
      "grafana",
      "loki",
      "promtail",
      "migrations",
    ];
    DEFAULT_SERVICES
      .iter()
      .map(|s| s.to_string())
      .filter(|s| !self.update_exclude.contains(s))
      .collect()
  }
}

//! Reads current container image versions, fetches the optional update
//! manifest, and computes whether an update is available. Caches the
//! latest manifest per channel.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
  entities::{LatestCache, Manifest, ServiceView, TargetView},
  error::{OrchestratorError, OrchestratorResult},
  process::ProcessRunner,
  registry::{ImageRef, RegistryClient},
};

const PRIMARY_SERVICES: &[&str] = &["app", "backend"];

/// `python_backend` is keyed as `backend` to match its container name;
/// every other service key is used as-is.
pub fn container_key(service: &str) -> String {
  if service == "python_backend" { "backend".to_string() } else { service.to_string() }
}

pub struct VersionResolver {
  process: ProcessRunner,
  registry: RegistryClient,
  http: reqwest::Client,
  manifest_url: Option<String>,
  channel_default: String,
  cache_ttl: chrono::Duration,
  min_refresh: chrono::Duration,
  cache: Mutex<LatestCache>,
}

impl VersionResolver {
  pub fn new(
    process: ProcessRunner,
    http: reqwest::Client,
    manifest_url: Option<String>,
    channel_default: String,
    cache_ttl_seconds: i64,
    min_refresh_seconds: i64,
  ) -> Self {
    Self {
      registry: RegistryClient::new(http.clone()),
      process,
      http,
      manifest_url,
      channel_default,
      cache_ttl: chrono::Duration::seconds(cache_ttl_seconds),
      min_refresh: chrono::Duration::seconds(min_refresh_seconds),
      cache: Mutex::new(LatestCache::default()),
    }
  }

  pub async fn current_versions(
    &self,
    services: &[String],
  ) -> HashMap<String, ServiceView> {
    let mut out = HashMap::new();
    for service in services {
      let key = container_key(service);
      match self.inspect_service(&key).await {
        Ok(view) => {
          out.insert(key, view);
        }
        Err(err) => {
          tracing::warn!(service = %key, %err, "failed to inspect service");
        }
      }
    }
    out
  }

  async fn inspect_service(&self, container: &str) -> OrchestratorResult<ServiceView> {
    let mut captured = String::new();
    let code = self
      .process
      .run(
        &[
          self.process.docker_bin.to_string_lossy().into_owned(),
          "inspect".to_string(),
          "--format".to_string(),
          "{{json .}}".to_string(),
          container.to_string(),
        ],
        None,
        Duration::from_secs(30),
        |line| captured.push_str(line),
      )
      .await?;
    if code != 0 {
      return Err(OrchestratorError::Subprocess(format!(
        "docker inspect {container} exited {code}"
      )));
    }
    let parsed: serde_json::Value = serde_json::from_str(&captured)
      .map_err(|err| OrchestratorError::Io(format!("parsing inspect output: {err}")))?;

    let configured_image =
      parsed.pointer("/Config/Image").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let image_id_raw =
      parsed.get("Image").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let image_id = image_id_raw.trim_start_matches("sha256:").to_string();

    let image_ref = ImageRef::parse(&configured_image);
    let digest = if image_ref.is_digest() {
      image_ref.reference.clone()
    } else {
      self.repo_digest_from_image(&image_id_raw, &image_ref.repository).await.unwrap_or_default()
    };

    let is_digest = image_ref.is_digest();
    Ok(ServiceView {
      image: configured_image,
      repo: image_ref.repository,
      tag: if is_digest { String::new() } else { image_ref.reference },
      digest,
      image_id,
    })
  }

  /// `docker image inspect` for the repo-digests list, preferring the
  /// entry whose repo matches the container's own ref.
  async fn repo_digest_from_image(&self, image_id: &str, repo: &str) -> Option<String> {
    if image_id.is_empty() {
      return None;
    }
    let mut captured = String::new();
    let code = self
      .process
      .run(
        &[
          self.process.docker_bin.to_string_lossy().into_owned(),
          "image".to_string(),
          "inspect".to_string(),
          "--format".to_string(),
          "{{json .RepoDigests}}".to_string(),
          image_id.to_string(),
        ],
        None,
        Duration::from_secs(30),
        |line| captured.push_str(line),
      )
      .await
      .ok()?;
    if code != 0 {
      return None;
    }
    let digests: Vec<String> = serde_json::from_str(&captured).ok()?;
    let chosen = digests
      .iter()
      .find(|d| d.starts_with(&format!("{repo}@")))
      .or_else(|| digests.first())?;
    chosen.split_once('@').map(|(_, digest)| digest.to_string())
  }

  pub async fn get_latest(&self, refresh: bool) -> OrchestratorResult<Manifest> {
    let channel = self.channel_default.clone();
    let now = Utc::now();
    {
      let cache = self.cache.lock().await;
      let fresh_enough =
        if refresh { now < cache.min_refresh_at } else { now < cache.expires_at };
      if cache.channel == channel && cache.latest.is_some() && fresh_enough {
        return Ok(cache.latest.clone().unwrap());
      }
    }

    let result = self.fetch_manifest(&channel).await;
    let mut cache = self.cache.lock().await;
    let now = Utc::now();
    match &result {
      Ok(manifest) => {
        cache.latest = Some(manifest.clone());
        cache.last_result = Some("ok".to_string());
      }
      Err(err) => {
        cache.last_result = Some(err.to_string());
      }
    }
    cache.channel = channel;
    cache.expires_at = now + self.cache_ttl;
    cache.min_refresh_at = now + self.min_refresh;
    result
  }

  async fn fetch_manifest(&self, channel: &str) -> OrchestratorResult<Manifest> {
    if let Some(template) = &self.manifest_url {
      let url = template.replace("{channel}", channel);
      let resp = self
        .http
        .get(&url)
        .send()
        .await
        .map_err(|err| OrchestratorError::Registry(err.to_string()))?;
      if !resp.status().is_success() {
        return Err(OrchestratorError::Registry(format!(
          "manifest fetch returned {}",
          resp.status()
        )));
      }
      resp.json().await.map_err(|err| OrchestratorError::Registry(err.to_string()))
    } else {
      let mut digests = HashMap::new();
      for key in PRIMARY_SERVICES {
        let reference = format!("canopyos/{key}:latest");
        let image_ref = ImageRef::parse(&reference);
        if let Some(digest) = self.registry.resolve_digest(&image_ref).await? {
          digests.insert(key.to_string(), digest);
        }
      }
      Ok(Manifest { version: channel.to_string(), services: HashMap::new(), digests })
    }
  }

  pub async fn get_target_for_services(
    &self,
    services: &[String],
    manifest: &Manifest,
  ) -> OrchestratorResult<HashMap<String, TargetView>> {
    let mut out = HashMap::new();
    for service in services {
      let key = container_key(service);
      let image_ref_str = manifest.services.get(&key).cloned();
      let digest = manifest.digests.get(&key).cloned();
      match (image_ref_str, digest) {
        (Some(image_ref_str), Some(digest)) => {
          let image_ref = ImageRef::parse(&image_ref_str);
          out.insert(key, TargetView { repo: image_ref.repository, digest });
        }
        (Some(image_ref_str), None) => {
          let image_ref = ImageRef::parse(&image_ref_str);
          if let Some(digest) = self.registry.resolve_digest(&image_ref).await? {
            out.insert(key, TargetView { repo: image_ref.repository, digest });
          }
        }
        (None, Some(_)) | (None, None) => {}
      }
    }
    Ok(out)
  }
}

/// False whenever every primary service's current digest equals the
/// latest digest. Unknown-current digests never trigger a report when
/// the latest digest is known (image ids and manifest digests are not
/// directly comparable).
pub fn compute_update_available(
  current: &HashMap<String, ServiceView>,
  latest: &Manifest,
) -> bool {
  for key in PRIMARY_SERVICES {
    let Some(view) = current.get(*key) else { continue };
    match latest.digests.get(*key) {
      Some(latest_digest) => {
        if view.digest.is_empty() {
          continue;
        }
        if !digest_eq(&view.digest, latest_digest) {
          return true;
        }
      }
      None => {
        if let Some(latest_image) = latest.services.get(*key) {
          let latest_ref = ImageRef::parse(latest_image);
          if !latest_ref.is_digest() && latest_ref.reference != view.tag {
            return true;
          }
        }
      }
    }
  }
  false
}

fn digest_eq(a: &str, b: &str) -> bool {
  a.trim_start_matches("sha256:") == b.trim_start_matches("sha256:")
}

pub type SharedVersionResolver = Arc<VersionResolver>;

#[cfg(test)]
mod tests {
  use super::*;
  use crate::entities::ServiceView;

  fn view(digest: &str, tag: &str) -> ServiceView {
    ServiceView {
      image: String::new(),
      repo: "canopyos/app".to_string(),
      tag: tag.to_string(),
      digest: digest.to_string(),
      image_id: String::new(),
    }
  }

  #[test]
  fn no_update_when_digests_match() {
    let mut current = HashMap::new();
    current.insert("app".to_string(), view("sha256:aaaa", "1.0.0"));
    let mut digests = HashMap::new();
    digests.insert("app".to_string(), "sha256:aaaa".to_string());
    let latest = Manifest { version: "1".to_string(), services: HashMap::new(), digests };
    assert!(!compute_update_available(&current, &latest));
  }

  #[test]
  fn update_when_digests_differ() {
    let mut current = HashMap::new();
    current.insert("app".to_string(), view("sha256:aaaa", "1.0.0"));
    let mut digests = HashMap::new();
    digests.insert("app".to_string(), "sha256:bbbb".to_string());
    let latest = Manifest { version: "1".to_string(), services: HashMap::new(), digests };
    assert!(compute_update_available(&current, &latest));
  }

  #[test]
  fn no_update_when_current_digest_unknown() {
    let mut current = HashMap::new();
    current.insert("app".to_string(), view("", "1.0.0"));
    let mut digests = HashMap::new();
    digests.insert("app".to_string(), "sha256:bbbb".to_string());
    let latest = Manifest { version: "1".to_string(), services: HashMap::new(), digests };
    assert!(!compute_update_available(&current, &latest));
  }

  #[test]
  fn falls_back_to_tag_comparison() {
    let mut current = HashMap::new();
    current.insert("app".to_string(), view("", "1.0.0"));
    let mut services = HashMap::new();
    services.insert("app".to_string(), "canopyos/app:1.1.0".to_string());
    let latest = Manifest { version: "1".to_string(), services, digests: HashMap::new() };
    assert!(compute_update_available(&current, &latest));
  }
}

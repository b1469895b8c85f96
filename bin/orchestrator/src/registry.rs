//! OCI Distribution v2 registry client: resolves `repo:tag` or
//! `repo@digest` references to a canonical `sha256:…` manifest digest,
//! with anonymous bearer-token authentication.

use std::collections::HashMap;

use reqwest::{StatusCode, header};

use crate::error::{OrchestratorError, OrchestratorResult};

const ACCEPT_HEADERS: &str = concat!(
  "application/vnd.oci.image.index.v1+json, ",
  "application/vnd.docker.distribution.manifest.list.v2+json, ",
  "application/vnd.oci.image.manifest.v1+json, ",
  "application/vnd.docker.distribution.manifest.v2+json",
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
  pub registry: String,
  pub repository: String,
  pub reference: String,
}

impl ImageRef {
  /// Parses `registry/repo[:tag|@digest]`. The host is detected by
  /// inspecting the first path segment: it's a registry host if it
  /// contains a dot, a colon (port), or is literally `localhost`.
  /// Docker Hub references are normalized and bare names get the
  /// `library/` prefix.
  pub fn parse(image: &str) -> Self {
    let (without_digest, digest) = match image.split_once('@') {
      Some((base, digest)) => {
        let digest = if digest.starts_with("sha256:") {
          digest.to_string()
        } else {
          format!("sha256:{digest}")
        };
        (base, Some(digest))
      }
      None => (image, None),
    };

    let mut registry = "registry-1.docker.io".to_string();
    let mut rest = without_digest;
    if let Some((first, remainder)) = without_digest.split_once('/') {
      if first == "localhost" || first.contains('.') || first.contains(':') {
        registry = first.to_string();
        rest = remainder;
      }
    }

    let (repo_path, tag) = match rest.rsplit_once(':') {
      Some((repo, tag)) if !tag.contains('/') => (repo, Some(tag.to_string())),
      _ => (rest, None),
    };

    registry = match registry.as_str() {
      "docker.io" | "index.docker.io" => "registry-1.docker.io".to_string(),
      other => other.to_string(),
    };

    let repository = if registry == "registry-1.docker.io" && !repo_path.contains('/')
    {
      format!("library/{repo_path}")
    } else {
      repo_path.to_string()
    };

    let reference = digest.or(tag).unwrap_or_else(|| "latest".to_string());

    Self { registry, repository, reference }
  }

  pub fn is_digest(&self) -> bool {
    self.reference.starts_with("sha256:")
  }
}

impl std::fmt::Display for ImageRef {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.is_digest() {
      write!(f, "{}/{}@{}", self.registry, self.repository, self.reference)
    } else {
      write!(f, "{}/{}:{}", self.registry, self.repository, self.reference)
    }
  }
}

pub struct RegistryClient {
  http: reqwest::Client,
}

impl RegistryClient {
  pub fn new(http: reqwest::Client) -> Self {
    Self { http }
  }

  /// `scheme` is overridable so tests can point this at a plain-http
  /// `wiremock` server without touching the production TLS path.
  fn base_url(&self, image_ref: &ImageRef, scheme: &str) -> String {
    format!(
      "{scheme}://{}/v2/{}/manifests/{}",
      image_ref.registry, image_ref.repository, image_ref.reference
    )
  }

  pub async fn resolve_digest(
    &self,
    image_ref: &ImageRef,
  ) -> OrchestratorResult<Option<String>> {
    self.resolve_digest_with_scheme(image_ref, registry_scheme(&image_ref.registry))
      .await
  }

  pub async fn resolve_digest_with_scheme(
    &self,
    image_ref: &ImageRef,
    scheme: &str,
  ) -> OrchestratorResult<Option<String>> {
    if image_ref.is_digest() {
      return Ok(Some(image_ref.reference.clone()));
    }

    let url = self.base_url(image_ref, scheme);
    let resp = self
      .http
      .get(&url)
      .header(header::ACCEPT, ACCEPT_HEADERS)
      .send()
      .await
      .map_err(|err| OrchestratorError::Registry(err.to_string()))?;

    let resp = if resp.status() == StatusCode::UNAUTHORIZED {
      let challenge = resp
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
      let Some(challenge) = challenge else {
        return Ok(None);
      };
      let Some(token) =
        self.fetch_bearer_token(&challenge, &image_ref.repository).await?
      else {
        return Ok(None);
      };
      self
        .http
        .get(&url)
        .header(header::ACCEPT, ACCEPT_HEADERS)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|err| OrchestratorError::Registry(err.to_string()))?
    } else {
      resp
    };

    if !resp.status().is_success() {
      return Ok(None);
    }

    let digest = resp
      .headers()
      .iter()
      .find(|(name, _)| name.as_str().eq_ignore_ascii_case("docker-content-digest"))
      .and_then(|(_, value)| value.to_str().ok())
      .map(str::to_string);
    Ok(digest)
  }

  async fn fetch_bearer_token(
    &self,
    challenge: &str,
    repository: &str,
  ) -> OrchestratorResult<Option<String>> {
    let params = parse_bearer_challenge(challenge);
    let Some(realm) = params.get("realm") else {
      return Ok(None);
    };
    let scope = params
      .get("scope")
      .cloned()
      .unwrap_or_else(|| format!("repository:{repository}:pull"));

    let mut req = self.http.get(realm).query(&[("scope", scope.as_str())]);
    if let Some(service) = params.get("service") {
      req = req.query(&[("service", service.as_str())]);
    }

    let resp = req
      .send()
      .await
      .map_err(|err| OrchestratorError::Registry(err.to_string()))?;
    if !resp.status().is_success() {
      return Ok(None);
    }
    let body: serde_json::Value = resp
      .json()
      .await
      .map_err(|err| OrchestratorError::Registry(err.to_string()))?;
    let token = body
      .get("token")
      .or_else(|| body.get("access_token"))
      .and_then(|v| v.as_str())
      .map(str::to_string);
    Ok(token)
  }
}

fn parse_bearer_challenge(header: &str) -> HashMap<String, String> {
  let mut out = HashMap::new();
  let Some(rest) = header.strip_prefix("Bearer ") else {
    return out;
  };
  for part in rest.split(',') {
    if let Some((key, value)) = part.split_once('=') {
      out.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
    }
  }
  out
}

fn registry_scheme(registry: &str) -> &'static str {
  if registry.starts_with("localhost") || registry.starts_with("127.0.0.1") {
    "http"
  } else {
    "https"
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_bare_docker_hub_name() {
    let r = ImageRef::parse("redis:7");
    assert_eq!(r.registry, "registry-1.docker.io");
    assert_eq!(r.repository, "library/redis");
    assert_eq!(r.reference, "7");
  }

  #[test]
  fn parses_namespaced_docker_hub_name() {
    let r = ImageRef::parse("canopyos/backend:latest");
    assert_eq!(r.registry, "registry-1.docker.io");
    assert_eq!(r.repository, "canopyos/backend");
    assert_eq!(r.reference, "latest");
  }

  #[test]
  fn normalizes_docker_io_host() {
    let r = ImageRef::parse("docker.io/library/nginx:stable");
    assert_eq!(r.registry, "registry-1.docker.io");
    assert_eq!(r.repository, "library/nginx");
  }

  #[test]
  fn parses_private_registry_with_port() {
    let r = ImageRef::parse("registry.internal:5000/canopyos/app:1.2.3");
    assert_eq!(r.registry, "registry.internal:5000");
    assert_eq!(r.repository, "canopyos/app");
    assert_eq!(r.reference, "1.2.3");
  }

  #[test]
  fn parses_digest_reference_without_tag() {
    let r = ImageRef::parse(
      "ghcr.io/canopyos/app@sha256:deadbeefcafef00ddeadbeefcafef00ddeadbeefcafef00ddeadbeefcafef00d",
    );
    assert!(r.is_digest());
    assert_eq!(r.registry, "ghcr.io");
    assert!(r.reference.starts_with("sha256:"));
  }

  #[test]
  fn defaults_to_latest() {
    let r = ImageRef::parse("ghcr.io/canopyos/app");
    assert_eq!(r.reference, "latest");
  }

  #[test]
  fn parse_of_display_is_idempotent() {
    let original = ImageRef::parse("registry.internal:5000/canopyos/app:1.2.3");
    let reparsed = ImageRef::parse(&original.to_string());
    assert_eq!(original, reparsed);
    let twice = ImageRef::parse(&reparsed.to_string());
    assert_eq!(reparsed, twice);
  }

  #[tokio::test]
  async fn resolves_digest_through_bearer_challenge_retry() {
    use wiremock::{
      Mock, MockServer, ResponseTemplate,
      matchers::{method, path},
    };

    let server = MockServer::start().await;
    let challenge = format!(
      "Bearer realm=\"{}/token\",service=\"test-registry\",scope=\"repository:library/app:pull\"",
      server.uri()
    );

    Mock::given(method("GET"))
      .and(path("/v2/library/app/manifests/latest"))
      .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()))
      .up_to_n_times(1)
      .with_priority(1)
      .mount(&server)
      .await;

    Mock::given(method("GET"))
      .and(path("/token"))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "token": "test-token" })),
      )
      .mount(&server)
      .await;

    Mock::given(method("GET"))
      .and(path("/v2/library/app/manifests/latest"))
      .respond_with(ResponseTemplate::new(200).insert_header(
        "Docker-Content-Digest",
        "sha256:1111111111111111111111111111111111111111111111111111111111111111",
      ))
      .mount(&server)
      .await;

    let image_ref = ImageRef {
      registry: server.address().to_string(),
      repository: "library/app".to_string(),
      reference: "latest".to_string(),
    };
    let client = RegistryClient::new(reqwest::Client::new());
    let digest = client.resolve_digest_with_scheme(&image_ref, "http").await.unwrap();

    assert_eq!(
      digest.as_deref(),
      Some("sha256:1111111111111111111111111111111111111111111111111111111111111111")
    );
  }
}

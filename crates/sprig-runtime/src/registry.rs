//! Blocking Docker Registry v2 client.
//!
//! Supports anonymous bearer-token negotiation, manifest lists (resolved to
//! the host platform) and streamed blob downloads.

use crate::image::{Descriptor, ImageManifest, ImageRef, ImageSource};
use crate::RuntimeError;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};
use ureq::http::Response;
use ureq::{Agent, Body};

const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, PartialEq, Eq)]
struct AuthChallenge {
    realm: String,
    service: String,
    scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestDocument {
    #[serde(rename = "mediaType", default)]
    media_type: String,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<PlatformEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct PlatformEntry {
    digest: String,
    #[serde(default)]
    platform: Platform,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Platform {
    #[serde(default)]
    os: String,
    #[serde(default)]
    architecture: String,
}

pub struct RegistrySource {
    agent: Agent,
    base_url: Option<String>,
    tokens: Mutex<HashMap<String, String>>,
}

impl Default for RegistrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrySource {
    pub fn new() -> Self {
        let agent: Agent = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(CONNECT_TIMEOUT))
            .build()
            .into();
        Self {
            agent,
            base_url: None,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Talk to `url` instead of the registry named in the image reference.
    pub fn with_base_url(url: impl Into<String>) -> Self {
        Self {
            base_url: Some(url.into()),
            ..Self::new()
        }
    }

    fn base(&self, image: &ImageRef) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| image.registry_url())
    }

    fn send(
        &self,
        url: &str,
        accept: Option<&str>,
        token: Option<&str>,
    ) -> Result<Response<Body>, RuntimeError> {
        let mut req = self.agent.get(url);
        if let Some(accept) = accept {
            req = req.header("Accept", accept);
        }
        if let Some(token) = token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        req.call()
            .map_err(|e| RuntimeError::Registry(format!("GET {url}: {e}")))
    }

    /// GET with a cached bearer token, negotiating a fresh one on 401.
    fn get(
        &self,
        url: &str,
        repository: &str,
        accept: Option<&str>,
    ) -> Result<Response<Body>, RuntimeError> {
        let cached = self
            .tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(repository).cloned());
        debug!("GET {url}");
        let resp = self.send(url, accept, cached.as_deref())?;
        if resp.status().as_u16() != 401 {
            return check_status(resp, url);
        }

        let header = resp
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                RuntimeError::Registry(format!("401 without WWW-Authenticate for {url}"))
            })?;
        trace!(header, "auth challenge");
        let challenge = parse_challenge(header).ok_or_else(|| {
            RuntimeError::Registry(format!("unsupported auth challenge: {header}"))
        })?;
        let token = self.fetch_token(&challenge, repository)?;
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(repository.to_owned(), token.clone());
        }
        let resp = self.send(url, accept, Some(&token))?;
        check_status(resp, url)
    }

    fn fetch_token(
        &self,
        challenge: &AuthChallenge,
        repository: &str,
    ) -> Result<String, RuntimeError> {
        let scope = if challenge.scope.is_empty() {
            format!("repository:{repository}:pull")
        } else {
            challenge.scope.clone()
        };
        debug!(realm = %challenge.realm, scope = %scope, "requesting registry token");
        let mut req = self.agent.get(&challenge.realm).query("scope", &scope);
        if !challenge.service.is_empty() {
            req = req.query("service", &challenge.service);
        }
        let resp = req
            .call()
            .map_err(|e| RuntimeError::Registry(format!("token request failed: {e}")))?;
        let resp = check_status(resp, &challenge.realm)?;
        let parsed: TokenResponse = serde_json::from_reader(resp.into_body().into_reader())
            .map_err(|source| RuntimeError::Decode {
                what: "token response",
                source,
            })?;
        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RuntimeError::Registry("token response carried no token".to_owned()))
    }

    fn fetch_manifest(
        &self,
        image: &ImageRef,
        reference: &str,
    ) -> Result<ManifestDocument, RuntimeError> {
        let url = format!(
            "{}/v2/{}/manifests/{reference}",
            self.base(image),
            image.repository
        );
        let resp = self.get(&url, &image.repository, Some(ACCEPT_MANIFEST))?;
        serde_json::from_reader(resp.into_body().into_reader()).map_err(|source| {
            RuntimeError::Decode {
                what: "image manifest",
                source,
            }
        })
    }
}

impl ImageSource for RegistrySource {
    fn manifest(&self, image: &ImageRef) -> Result<ImageManifest, RuntimeError> {
        let mut doc = self.fetch_manifest(image, &image.reference)?;
        if !doc.manifests.is_empty() {
            let arch = host_arch();
            let entry = select_platform(&doc.manifests, arch).ok_or_else(|| {
                RuntimeError::Image(format!("{image} has no linux/{arch} variant"))
            })?;
            debug!(digest = %entry.digest, "selected platform manifest");
            doc = self.fetch_manifest(image, &entry.digest)?;
        }
        if !doc.manifests.is_empty() || doc.layers.is_empty() {
            return Err(RuntimeError::Image(format!(
                "unexpected manifest for {image} (media type '{}')",
                doc.media_type
            )));
        }
        Ok(ImageManifest { layers: doc.layers })
    }

    fn open_layer(
        &self,
        image: &ImageRef,
        layer: &Descriptor,
    ) -> Result<Box<dyn Read>, RuntimeError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base(image),
            image.repository,
            layer.digest
        );
        let resp = self.get(&url, &image.repository, None)?;
        Ok(Box::new(resp.into_body().into_reader()))
    }
}

fn check_status(resp: Response<Body>, url: &str) -> Result<Response<Body>, RuntimeError> {
    let code = resp.status().as_u16();
    if code >= 400 {
        return Err(RuntimeError::Registry(format!("HTTP {code} for {url}")));
    }
    Ok(resp)
}

/// Parse `Bearer realm="...",service="...",scope="..."`. Quoted values may
/// contain commas.
fn parse_challenge(header: &str) -> Option<AuthChallenge> {
    let trimmed = header.trim();
    let (scheme, mut rest) = trimmed.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut challenge = AuthChallenge::default();
    loop {
        rest = rest.trim_start_matches([',', ' ']);
        if rest.is_empty() {
            break;
        }
        let (key, after) = rest.split_once('=')?;
        let (value, tail) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        match key.trim() {
            "realm" => value.clone_into(&mut challenge.realm),
            "service" => value.clone_into(&mut challenge.service),
            "scope" => value.clone_into(&mut challenge.scope),
            _ => {}
        }
        rest = tail;
    }

    (!challenge.realm.is_empty()).then_some(challenge)
}

fn select_platform<'a>(entries: &'a [PlatformEntry], arch: &str) -> Option<&'a PlatformEntry> {
    entries
        .iter()
        .find(|e| e.platform.os == "linux" && e.platform.architecture == arch)
}

/// Host architecture in OCI naming.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        a => a,
    }
}

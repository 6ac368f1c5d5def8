//! OCI registry client.
//!
//! Artifacts are ORAS-style OCI manifests: every layer carries an
//! `org.opencontainers.image.title` annotation with its file name. Layers
//! also annotated `io.deis.oras.content.unpack: "true"` are gzip tarballs of a
//! directory and are unpacked under their title.
//!
//! Only pulls are supported. Blobs are verified against their SHA-256 digest
//! and transferred by a small fixed pool of workers.

use super::cancel::Cancel;
use super::credentials::CredentialStore;
use super::reference::ArtifactRef;
use crate::config::RegistryConfig;
use crate::error::IntegrityError;
use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Concurrent blob transfers per artifact.
pub const BLOB_WORKERS: usize = 4;

const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
const ANNOTATION_UNPACK: &str = "io.deis.oras.content.unpack";
const MANIFEST_MEDIA_TYPES: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";
const PROGRESS_STEP: u64 = 64 * 1024 * 1024;

/// Something that can materialize an artifact's files into a directory.
///
/// `dest` is an empty directory owned by the caller; on error its contents
/// are discarded by the caller.
pub trait Registry: Send + Sync {
    fn pull(&self, artifact: &ArtifactRef, dest: &Path, cancel: &Cancel) -> Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    digest: String,
    size: u64,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl Descriptor {
    fn title(&self) -> Result<&str> {
        let title = self
            .annotations
            .get(ANNOTATION_TITLE)
            .ok_or_else(|| anyhow!("layer {} has no {} annotation", self.digest, ANNOTATION_TITLE))?;
        validate_title(title)?;
        Ok(title)
    }

    fn unpack(&self) -> bool {
        self.annotations
            .get(ANNOTATION_UNPACK)
            .is_some_and(|v| v == "true")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Pull-only OCI distribution client.
pub struct OciRegistry {
    client: Client,
    host: String,
    base_url: String,
    prefix: String,
    credentials: Box<dyn CredentialStore>,
    tokens: Mutex<HashMap<String, String>>,
}

impl OciRegistry {
    pub fn new(config: &RegistryConfig, credentials: Box<dyn CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("fab-installer/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let scheme = if config.insecure { "http" } else { "https" };
        Ok(Self {
            client,
            host: config.url.clone(),
            base_url: format!("{scheme}://{}", config.url),
            prefix: config.prefix.trim_matches('/').to_string(),
            credentials,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn repository(&self, artifact: &ArtifactRef) -> String {
        if self.prefix.is_empty() {
            artifact.name.clone()
        } else {
            format!("{}/{}", self.prefix, artifact.name)
        }
    }

    /// Full reference, `<host>/<prefix>/<name>:<version>`.
    pub fn reference(&self, artifact: &ArtifactRef) -> String {
        format!("{}/{}:{}", self.host, self.repository(artifact), artifact.version)
    }

    fn get(&self, repository: &str, url: &str, accept: Option<&str>) -> Result<Response> {
        let request = |token: Option<&str>| {
            let mut req = self.client.get(url);
            if let Some(accept) = accept {
                req = req.header(ACCEPT, accept);
            }
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            req.send()
                .with_context(|| format!("GET {url} failed"))
        };

        let cached = self.cached_token(repository)?;
        let mut resp = request(cached.as_deref())?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("GET {url}: 401 without an authentication challenge"))?;
            let token = self.fetch_token(repository, &challenge)?;
            resp = request(Some(&token))?;
        }

        let status = resp.status();
        if !status.is_success() {
            bail!("GET {url}: registry answered {status}");
        }
        Ok(resp)
    }

    fn cached_token(&self, repository: &str) -> Result<Option<String>> {
        let tokens = self
            .tokens
            .lock()
            .map_err(|_| anyhow!("registry token cache poisoned"))?;
        Ok(tokens.get(repository).cloned())
    }

    fn fetch_token(&self, repository: &str, challenge: &str) -> Result<String> {
        let params = parse_challenge(challenge)
            .ok_or_else(|| anyhow!("unsupported authentication challenge: {challenge}"))?;
        let realm = params
            .get("realm")
            .ok_or_else(|| anyhow!("authentication challenge without realm: {challenge}"))?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));

        let mut query = vec![("scope", scope.as_str())];
        if let Some(service) = params.get("service") {
            query.push(("service", service.as_str()));
        }
        let mut req = self.client.get(realm).query(&query);
        if let Some(creds) = self.credentials.credentials(&self.host) {
            req = req.basic_auth(creds.username, Some(creds.password));
        }
        let resp = req
            .send()
            .with_context(|| format!("token request to {realm} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("token request to {realm}: {status}");
        }
        let body: TokenResponse = resp
            .json()
            .with_context(|| format!("invalid token response from {realm}"))?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| anyhow!("token response from {realm} has no token"))?;

        self.tokens
            .lock()
            .map_err(|_| anyhow!("registry token cache poisoned"))?
            .insert(repository.to_string(), token.clone());
        Ok(token)
    }

    fn manifest(&self, repository: &str, version: &str) -> Result<Manifest> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, repository, version);
        let resp = self.get(repository, &url, Some(MANIFEST_MEDIA_TYPES))?;
        resp.json()
            .with_context(|| format!("invalid manifest at {url}"))
    }

    fn fetch_layer(
        &self,
        repository: &str,
        layer: &Descriptor,
        dest: &Path,
        cancel: &Cancel,
    ) -> Result<()> {
        let title = layer.title()?;
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, repository, layer.digest);
        let resp = self.get(repository, &url, None)?;

        if layer.unpack() {
            let blob = dest.join(format!(".blob-{}", digest_hex(&layer.digest)?));
            download(resp, &blob, &layer.digest, title, layer.size, cancel)?;
            let target = dest.join(title);
            fs::create_dir_all(&target)?;
            let mut archive = tar::Archive::new(GzDecoder::new(File::open(&blob)?));
            archive
                .unpack(&target)
                .with_context(|| format!("Failed to unpack layer {title}"))?;
            fs::remove_file(&blob)?;
        } else {
            let target = dest.join(title);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            download(resp, &target, &layer.digest, title, layer.size, cancel)?;
        }
        Ok(())
    }
}

impl Registry for OciRegistry {
    fn pull(&self, artifact: &ArtifactRef, dest: &Path, cancel: &Cancel) -> Result<()> {
        let repository = self.repository(artifact);
        let manifest = self
            .manifest(&repository, &artifact.version)
            .with_context(|| format!("Failed to resolve {}", self.reference(artifact)))?;
        info!(
            "Pulling {} ({} layers)",
            self.reference(artifact),
            manifest.layers.len()
        );

        let queue = Mutex::new(manifest.layers.iter());
        let failure: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let abort = cancel.child();

        std::thread::scope(|scope| {
            for _ in 0..BLOB_WORKERS.min(manifest.layers.len()) {
                scope.spawn(|| loop {
                    let next = match queue.lock() {
                        Ok(mut layers) => layers.next(),
                        Err(_) => None,
                    };
                    let Some(layer) = next else { break };
                    if abort.is_cancelled() {
                        break;
                    }
                    if let Err(e) = self.fetch_layer(&repository, layer, dest, &abort) {
                        abort.cancel();
                        if let Ok(mut slot) = failure.lock() {
                            // Keep the root cause, not a sibling's cancellation.
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                        break;
                    }
                });
            }
        });

        if let Some(e) = failure
            .into_inner()
            .map_err(|_| anyhow!("blob worker panicked"))?
        {
            return Err(e);
        }
        cancel.check()?;
        Ok(())
    }
}

/// Stream `resp` into `target`, verifying its digest.
fn download(
    mut resp: Response,
    target: &Path,
    digest: &str,
    title: &str,
    expected_size: u64,
    cancel: &Cancel,
) -> Result<()> {
    let expected = digest_hex(digest)?;
    let mut file =
        File::create(target).with_context(|| format!("Failed to create {}", target.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 256 * 1024];
    let mut transferred = 0u64;
    let mut next_report = PROGRESS_STEP;
    loop {
        cancel.check()?;
        let n = resp
            .read(&mut buf)
            .with_context(|| format!("Failed to read blob {title}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
        transferred += n as u64;
        if transferred >= next_report {
            debug!("{title}: {transferred}/{expected_size} bytes");
            next_report += PROGRESS_STEP;
        }
    }
    file.sync_all()?;

    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        return Err(IntegrityError::DigestMismatch {
            what: title.to_string(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    info!("Downloaded {title} ({transferred} bytes)");
    Ok(())
}

fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| anyhow!("unsupported digest algorithm: {digest}"))?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("malformed digest: {digest}");
    }
    Ok(hex)
}

fn validate_title(title: &str) -> Result<()> {
    let path = PathBuf::from(title);
    let safe = !title.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        bail!("unsafe layer title: {title}");
    }
    Ok(())
}

/// Parse `Bearer realm="…",service="…",scope="…"`.
fn parse_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_string(), value);
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::credentials::{Anonymous, Credentials, StaticCredentials};
    use crate::cache::ArtifactCache;
    use crate::error::{classify, FailureKind};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;
    use tempfile::TempDir;

    const MANIFEST_PATH: &str = "/v2/fab/k3s/manifests/v1.31.1";

    fn k3s() -> ArtifactRef {
        ArtifactRef::new("k3s", "v1.31.1")
    }

    fn registry_for(server: &Server, credentials: Box<dyn CredentialStore>) -> OciRegistry {
        let config = RegistryConfig {
            url: server.addr().to_string(),
            prefix: "fab".to_string(),
            insecure: true,
            timeout_secs: 30,
        };
        OciRegistry::new(&config, credentials).unwrap()
    }

    fn digest_of(blob: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(blob)))
    }

    fn layer(title: &str, blob: &[u8], unpack: bool) -> serde_json::Value {
        let mut annotations = json!({ ANNOTATION_TITLE: title });
        if unpack {
            annotations[ANNOTATION_UNPACK] = json!("true");
        }
        json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": digest_of(blob),
            "size": blob.len(),
            "annotations": annotations,
        })
    }

    fn manifest(layers: Vec<serde_json::Value>) -> serde_json::Value {
        json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "layers": layers,
        })
    }

    fn blob_path(blob: &[u8]) -> String {
        format!("/v2/fab/k3s/blobs/{}", digest_of(blob))
    }

    fn gzip_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn parses_bearer_challenge_with_commas_in_scope() {
        let params = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:a/b:pull,push""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://ghcr.io/token");
        assert_eq!(params["service"], "ghcr.io");
        assert_eq!(params["scope"], "repository:a/b:pull,push");
        assert!(parse_challenge("Basic realm=x").is_none());
    }

    #[test]
    fn digest_validation() {
        let hex = "a".repeat(64);
        assert_eq!(digest_hex(&format!("sha256:{hex}")).unwrap(), hex);
        assert!(digest_hex("sha512:abcd").is_err());
        assert!(digest_hex("sha256:xyz").is_err());
    }

    #[test]
    fn titles_must_stay_inside_the_artifact() {
        assert!(validate_title("k3s").is_ok());
        assert!(validate_title("images/efiboot.img").is_ok());
        assert!(validate_title("../etc/passwd").is_err());
        assert!(validate_title("/abs").is_err());
        assert!(validate_title("").is_err());
    }

    #[test]
    fn reference_uses_prefix() {
        let registry = OciRegistry::new(&RegistryConfig::default(), Box::new(Anonymous)).unwrap();
        let r = ArtifactRef::new("fabricator/k9s", "v0.32.5");
        assert_eq!(
            registry.reference(&r),
            "ghcr.io/githedgehog/fabricator/k9s:v0.32.5"
        );
    }

    #[test]
    fn manifest_layers_deserialize() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"mediaType": "application/vnd.oci.empty.v1+json", "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a", "size": 2},
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                "size": 5,
                "annotations": {"org.opencontainers.image.title": "k9s"}
            }]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].title().unwrap(), "k9s");
        assert!(!manifest.layers[0].unpack());
    }

    #[test]
    fn pull_with_token_challenge_and_unpacked_layer() {
        let server = Server::run();
        let k3s_bin = b"k3s binary".to_vec();
        let charts = gzip_tar(&[
            ("fabric.tgz", &b"chart"[..]),
            ("values/default.yaml", &b"a: 1\n"[..]),
        ]);
        let challenge = format!(
            r#"Bearer realm="{}",service="fab-registry",scope="repository:fab/k3s:pull""#,
            server.url("/token")
        );

        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", MANIFEST_PATH),
                request::headers(not(contains(key("authorization")))),
            ])
            .respond_with(status_code(401).insert_header("WWW-Authenticate", challenge)),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/token"),
                request::query(url_decoded(contains(("scope", "repository:fab/k3s:pull")))),
                request::query(url_decoded(contains(("service", "fab-registry")))),
                request::headers(contains(("authorization", "Basic cm9ib3Q6czNjcmV0"))),
            ])
            .respond_with(json_encoded(json!({ "token": "tok-123" }))),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", MANIFEST_PATH),
                request::headers(contains(("authorization", "Bearer tok-123"))),
            ])
            .respond_with(json_encoded(manifest(vec![
                layer("k3s", &k3s_bin, false),
                layer("charts", &charts, true),
            ]))),
        );
        for blob in [&k3s_bin, &charts] {
            server.expect(
                Expectation::matching(all_of![
                    request::method_path("GET", blob_path(blob)),
                    request::headers(contains(("authorization", "Bearer tok-123"))),
                ])
                .respond_with(status_code(200).body(blob.clone())),
            );
        }

        let registry = registry_for(
            &server,
            Box::new(StaticCredentials(Credentials {
                username: "robot".to_string(),
                password: "s3cret".to_string(),
            })),
        );
        let dest = TempDir::new().unwrap();
        registry.pull(&k3s(), dest.path(), &Cancel::new()).unwrap();

        assert_eq!(fs::read(dest.path().join("k3s")).unwrap(), k3s_bin);
        assert_eq!(fs::read(dest.path().join("charts/fabric.tgz")).unwrap(), b"chart");
        assert_eq!(
            fs::read(dest.path().join("charts/values/default.yaml")).unwrap(),
            b"a: 1\n"
        );
        let names: Vec<String> = fs::read_dir(dest.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.starts_with(".blob-")), "{names:?}");
    }

    #[test]
    fn corrupted_blob_is_an_integrity_error() {
        let server = Server::run();
        let expected = b"k3s binary".to_vec();
        server.expect(
            Expectation::matching(request::method_path("GET", MANIFEST_PATH))
                .respond_with(json_encoded(manifest(vec![layer("k3s", &expected, false)]))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", blob_path(&expected)))
                .respond_with(status_code(200).body("k3s binarY")),
        );

        let registry = registry_for(&server, Box::new(Anonymous));
        let dest = TempDir::new().unwrap();
        let err = registry.pull(&k3s(), dest.path(), &Cancel::new()).unwrap_err();

        assert_eq!(classify(&err), FailureKind::Integrity);
        let mismatch = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<IntegrityError>())
            .unwrap();
        match mismatch {
            IntegrityError::DigestMismatch { what, expected: want, .. } => {
                assert_eq!(what, "k3s");
                assert_eq!(want.as_str(), digest_hex(&digest_of(&expected)).unwrap());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn layers_are_spread_over_the_worker_pool() {
        let server = Server::run();
        let delay = Duration::from_millis(300);
        let blobs: Vec<Vec<u8>> = (0..6).map(|i| format!("image {i}").into_bytes()).collect();
        let layers = blobs
            .iter()
            .enumerate()
            .map(|(i, blob)| layer(&format!("images/{i}.tar"), blob, false))
            .collect();
        server.expect(
            Expectation::matching(request::method_path("GET", MANIFEST_PATH))
                .respond_with(json_encoded(manifest(layers))),
        );
        for blob in &blobs {
            server.expect(
                Expectation::matching(request::method_path("GET", blob_path(blob)))
                    .respond_with(delay_and_then(delay, status_code(200).body(blob.clone()))),
            );
        }

        let registry = registry_for(&server, Box::new(Anonymous));
        let dest = TempDir::new().unwrap();
        let started = Instant::now();
        registry.pull(&k3s(), dest.path(), &Cancel::new()).unwrap();
        let elapsed = started.elapsed();

        for (i, blob) in blobs.iter().enumerate() {
            assert_eq!(&fs::read(dest.path().join(format!("images/{i}.tar"))).unwrap(), blob);
        }
        // Six delayed blobs one after another would take 1.8s; four workers
        // finish in two rounds.
        assert!(elapsed < delay * 5, "pull took {elapsed:?}");
    }

    #[test]
    fn cancel_during_download_publishes_nothing() {
        let server = Server::run();
        let blob = b"k3s binary".to_vec();
        server.expect(
            Expectation::matching(request::method_path("GET", MANIFEST_PATH))
                .respond_with(json_encoded(manifest(vec![layer("k3s", &blob, false)]))),
        );
        server.expect(
            Expectation::matching(request::method_path("GET", blob_path(&blob))).respond_with(
                delay_and_then(Duration::from_millis(500), status_code(200).body(blob.clone())),
            ),
        );

        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(registry_for(&server, Box::new(Anonymous)));
        let cache = ArtifactCache::new(tmp.path(), registry).unwrap();
        let cancel = Cancel::new();
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };

        let err = cache.fetch(&k3s(), &cancel).unwrap_err();
        canceller.join().unwrap();
        assert_eq!(classify(&err), FailureKind::Cancelled);
        assert!(!cache.entry_path(&k3s()).exists());
        let leftovers: Vec<String> = fs::read_dir(cache.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".fetch-"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}

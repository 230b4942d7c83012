//! Registry API client
//!
//! Speaks the OCI distribution API: descriptor lookup, manifest and blob
//! reads, index writes, tag listing. Transport goes through an [`HttpClient`]
//! trait so tests can substitute a mock; authentication is resolved per host
//! through [`CredentialStore`] with 401 Bearer challenges exchanged for
//! tokens on the fly.

use crate::errors::{Result, WarpgateError};
use crate::redaction;
use crate::reference::ImageReference;
use crate::registry::auth::{CredentialStore, Credentials};
use crate::registry::types::{
    Descriptor, HttpResponse, ImageIndex, TagList, ACCEPTED_MANIFEST_TYPES,
};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP transport used by the registry client. Implementations return a
/// response for every completed exchange, including non-2xx statuses;
/// `Err` means the transport itself failed.
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError>;

    async fn head(
        &self,
        url: &str,
        headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError>;

    async fn put(
        &self,
        url: &str,
        body: Bytes,
        headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError>;
}

/// Default transport backed by reqwest
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> std::result::Result<Self, BoxError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError> {
        let mut request = request;
        for (key, value) in &headers {
            request = request.header(key, value);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let mut response_headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(key.to_string(), value.to_string());
            }
        }
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

#[async_trait::async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(
        &self,
        url: &str,
        headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError> {
        self.execute(self.client.get(url), headers).await
    }

    async fn head(
        &self,
        url: &str,
        headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError> {
        self.execute(self.client.head(url), headers).await
    }

    async fn put(
        &self,
        url: &str,
        body: Bytes,
        headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError> {
        self.execute(self.client.put(url).body(body), headers).await
    }
}

/// `sha256:<hex>` of a byte string.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

enum Method {
    Get,
    Head,
    Put(Bytes),
}

/// Registry client: descriptor lookup, manifest/blob reads, index writes
pub struct RegistryClient {
    http: Arc<dyn HttpClient>,
    credentials: CredentialStore,
}

impl RegistryClient {
    pub fn new(credentials: CredentialStore) -> Result<Self> {
        let http = ReqwestHttpClient::new()
            .map_err(|e| WarpgateError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http: Arc::new(http),
            credentials,
        })
    }

    /// Build a client over a custom transport (tests use this).
    pub fn with_http_client(http: Arc<dyn HttpClient>, credentials: CredentialStore) -> Self {
        Self { http, credentials }
    }

    /// Fetch the descriptor (`mediaType`, `size`, `digest`) for a reference.
    pub async fn get_descriptor(
        &self,
        image_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<Descriptor> {
        let reference = ImageReference::parse(image_ref)?;
        let url = manifest_url(&reference);
        let response = self
            .request(Method::Head, &url, accept_headers(), &reference, cancel)
            .await?;

        let media_type = response
            .header("content-type")
            .unwrap_or_default()
            .to_string();
        let size = response
            .header("content-length")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);

        if let Some(digest) = response.header("docker-content-digest") {
            return Ok(Descriptor {
                media_type,
                digest: digest.to_string(),
                size,
                platform: None,
                annotations: None,
            });
        }

        // Some registries omit the digest header on HEAD; fall back to a
        // full GET and hash the body.
        let (body, descriptor) = self.get_manifest(image_ref, cancel).await?;
        debug!(image_ref, size = body.len(), "computed digest from manifest body");
        Ok(descriptor)
    }

    /// Fetch a manifest body together with its descriptor.
    pub async fn get_manifest(
        &self,
        image_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<(Bytes, Descriptor)> {
        let reference = ImageReference::parse(image_ref)?;
        let url = manifest_url(&reference);
        let response = self
            .request(Method::Get, &url, accept_headers(), &reference, cancel)
            .await?;

        let digest = response
            .header("docker-content-digest")
            .map(str::to_string)
            .unwrap_or_else(|| sha256_digest(&response.body));
        let media_type = response
            .header("content-type")
            .unwrap_or_default()
            .to_string();
        let descriptor = Descriptor {
            media_type,
            digest,
            size: response.body.len() as i64,
            platform: None,
            annotations: None,
        };
        Ok((response.body, descriptor))
    }

    /// Fetch a blob (e.g. an image config) by digest.
    pub async fn get_blob(
        &self,
        image_ref: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let reference = ImageReference::parse(image_ref)?;
        let url = format!(
            "{}/v2/{}/blobs/{}",
            registry_base(&reference),
            reference.repository,
            digest
        );
        let response = self
            .request(Method::Get, &url, HashMap::new(), &reference, cancel)
            .await?;
        Ok(response.body)
    }

    /// Write a manifest index under the reference's tag. Returns the
    /// content digest of the pushed body. Identical indexes produce
    /// identical digests: the body is a deterministic serialization.
    pub async fn put_index(
        &self,
        image_ref: &str,
        index: &ImageIndex,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let reference = ImageReference::parse(image_ref)?;
        let body = serde_json::to_vec(index)
            .map_err(|e| WarpgateError::internal(format!("index serialization failed: {e}")))?;
        let digest = sha256_digest(&body);

        let url = manifest_url(&reference);
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), index.media_type.clone());

        let response = self
            .request(
                Method::Put(Bytes::from(body)),
                &url,
                headers,
                &reference,
                cancel,
            )
            .await?;

        Ok(response
            .header("docker-content-digest")
            .map(str::to_string)
            .unwrap_or(digest))
    }

    /// List tags for a repository, in registry order.
    pub async fn list_tags(
        &self,
        image_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let reference = ImageReference::parse(image_ref)?;
        let url = format!(
            "{}/v2/{}/tags/list",
            registry_base(&reference),
            reference.repository
        );
        let response = self
            .request(Method::Get, &url, HashMap::new(), &reference, cancel)
            .await?;
        let list: TagList = serde_json::from_slice(&response.body).map_err(|e| {
            WarpgateError::transport(format!("malformed tag list from {url}: {e}"))
        })?;
        Ok(list.tags)
    }

    /// Whether a manifest exists under the reference.
    pub async fn manifest_exists(
        &self,
        image_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        match self.get_descriptor(image_ref, cancel).await {
            Ok(_) => Ok(true),
            Err(WarpgateError::Resolution { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Perform one request with per-host auth, exchanging a 401 Bearer
    /// challenge for a token and retrying once.
    async fn request(
        &self,
        method: Method,
        url: &str,
        mut headers: HashMap<String, String>,
        reference: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let credentials = self.credentials.resolve(&reference.registry);
        if let Some(header) = credentials.to_auth_header() {
            headers.insert("Authorization".to_string(), header);
        }

        let response = self.send(&method, url, headers.clone(), cancel).await?;

        if response.status == 401 {
            if let Some(challenge) = response.header("www-authenticate") {
                if challenge.starts_with("Bearer ") {
                    debug!(url, "401 with Bearer challenge, exchanging for token");
                    let token = self
                        .exchange_token(challenge, reference, &credentials, cancel)
                        .await?;
                    headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                    let retried = self.send(&method, url, headers, cancel).await?;
                    return check_status(retried, url, &reference.registry);
                }
            }
            return Err(WarpgateError::authentication(
                reference.registry.clone(),
                format!("registry rejected credentials for {url}"),
            ));
        }

        check_status(response, url, &reference.registry)
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        headers: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<HttpResponse> {
        let fut = async {
            match method {
                Method::Get => self.http.get(url, headers).await,
                Method::Head => self.http.head(url, headers).await,
                Method::Put(body) => self.http.put(url, body.clone(), headers).await,
            }
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WarpgateError::Cancelled),
            result = fut => result,
        };
        result.map_err(|e| {
            WarpgateError::transport(redaction::redact(&format!("request to {url} failed: {e}")))
        })
    }

    /// OCI distribution token flow: parse the Bearer challenge, call the
    /// realm with service/scope, forward basic credentials when present.
    async fn exchange_token(
        &self,
        challenge: &str,
        reference: &ImageReference,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let params = parse_bearer_challenge(challenge);
        let realm = params.get("realm").cloned().ok_or_else(|| {
            WarpgateError::authentication(
                reference.registry.clone(),
                "Bearer challenge without realm",
            )
        })?;

        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull,push", reference.repository));

        let mut token_url = realm;
        let mut query = Vec::new();
        if let Some(service) = params.get("service") {
            query.push(format!("service={service}"));
        }
        query.push(format!("scope={scope}"));
        token_url.push('?');
        token_url.push_str(&query.join("&"));

        let mut headers = HashMap::new();
        if let Credentials::Basic { .. } = credentials {
            if let Some(header) = credentials.to_auth_header() {
                headers.insert("Authorization".to_string(), header);
            }
        }

        let fut = self.http.get(&token_url, headers);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WarpgateError::Cancelled),
            result = fut => result,
        }
        .map_err(|e| WarpgateError::transport(format!("token request failed: {e}")))?;

        if response.status != 200 {
            return Err(WarpgateError::authentication(
                reference.registry.clone(),
                format!("token endpoint returned HTTP {}", response.status),
            ));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: String,
            #[serde(default)]
            access_token: String,
        }
        let parsed: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
            WarpgateError::authentication(
                reference.registry.clone(),
                format!("malformed token response: {e}"),
            )
        })?;
        let token = if parsed.token.is_empty() {
            parsed.access_token
        } else {
            parsed.token
        };
        if token.is_empty() {
            return Err(WarpgateError::authentication(
                reference.registry.clone(),
                "token endpoint returned no token",
            ));
        }
        redaction::add_global_secret(&token);
        Ok(token)
    }
}

fn check_status(response: HttpResponse, url: &str, registry: &str) -> Result<HttpResponse> {
    match response.status {
        200..=299 => Ok(response),
        401 | 403 => Err(WarpgateError::authentication(
            registry.to_string(),
            format!("registry rejected credentials for {url}"),
        )),
        404 => Err(WarpgateError::resolution(
            url.to_string(),
            "not found in registry".to_string(),
        )),
        status => Err(WarpgateError::transport(format!(
            "HTTP {status} from {url}"
        ))),
    }
}

fn accept_headers() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert("Accept".to_string(), ACCEPTED_MANIFEST_TYPES.join(","));
    headers
}

fn manifest_url(reference: &ImageReference) -> String {
    let manifest_ref = match &reference.digest {
        Some(digest) => digest.clone(),
        None => reference.tag_or_latest().to_string(),
    };
    format!(
        "{}/v2/{}/manifests/{}",
        registry_base(reference),
        reference.repository,
        manifest_ref
    )
}

/// Scheme + API host. Local registries get plain HTTP; everything else TLS.
fn registry_base(reference: &ImageReference) -> String {
    let host = reference.api_host();
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        format!("http://{host}")
    } else {
        format!("https://{host}")
    }
}

fn parse_bearer_challenge(challenge: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(rest) = challenge.strip_prefix("Bearer ") {
        for part in rest.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                params.insert(
                    key.trim().to_string(),
                    value.trim().trim_matches('"').to_string(),
                );
            }
        }
    }
    params
}

/// Scripted transport for unit tests
#[derive(Default)]
pub struct MockHttpClient {
    responses: Mutex<HashMap<String, Vec<HttpResponse>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a URL; multiple responses for one URL are
    /// served in order.
    pub async fn add_response(&self, url: impl Into<String>, response: HttpResponse) {
        let mut responses = self.responses.lock().await;
        responses.entry(url.into()).or_default().push(response);
    }

    async fn next_response(&self, url: &str) -> std::result::Result<HttpResponse, BoxError> {
        let mut responses = self.responses.lock().await;
        match responses.get_mut(url) {
            Some(queue) if !queue.is_empty() => Ok(queue.remove(0)),
            _ => Err(format!("no mock response for URL: {url}").into()),
        }
    }
}

#[async_trait::async_trait]
impl HttpClient for MockHttpClient {
    async fn get(
        &self,
        url: &str,
        _headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError> {
        self.next_response(url).await
    }

    async fn head(
        &self,
        url: &str,
        _headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError> {
        self.next_response(url).await
    }

    async fn put(
        &self,
        url: &str,
        _body: Bytes,
        _headers: HashMap<String, String>,
    ) -> std::result::Result<HttpResponse, BoxError> {
        self.next_response(url).await
    }
}

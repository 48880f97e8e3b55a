use anyhow::Context;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::SessionStore;
use crate::error::ApiError;

/// Header used to correlate client and server logs
const REQUEST_ID_HEADER: &str = "x-request-id";

/// A caller-initiated API call. Cloneable so it can be re-dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Successful (2xx) response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    /// Deserialize the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Body as UTF-8 text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Request dispatcher
/// Sends one request with the current access credential and classifies the
/// outcome. Never retries.
pub struct Dispatcher {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// API origin every request path is resolved against
    base_url: Url,

    /// Source of the access credential
    store: Arc<SessionStore>,

    /// User-Agent sent on every request
    user_agent: String,
}

impl Dispatcher {
    pub fn new(client: Client, base_url: Url, store: Arc<SessionStore>) -> Self {
        Self {
            client,
            base_url,
            store,
            user_agent: default_user_agent(),
        }
    }

    /// Build a pooled HTTP client with the given timeouts
    pub fn build_client(
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> anyhow::Result<Client> {
        Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a request path against the base URL. Absolute URLs are only
    /// accepted on the base origin, so the credential never leaves it.
    fn resolve(&self, path: &str) -> Result<Url, ApiError> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidRequest(format!("{}: {}", path, e)))?;

        if url.origin() != self.base_url.origin() {
            tracing::warn!(path = %path, "Refusing request outside the API origin");
            return Err(ApiError::InvalidRequest(format!(
                "{} is outside the API origin {}",
                path,
                self.base_url.origin().ascii_serialization()
            )));
        }

        Ok(url)
    }

    /// Build the outgoing request. The credential is read and the header
    /// attached under the store lock, so a cleared session is never sent.
    fn build(
        &self,
        request: &ApiRequest,
        request_id: &str,
    ) -> Result<(reqwest::Request, Option<String>), ApiError> {
        let url = self.resolve(&request.path)?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::InvalidRequest(format!("header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ApiError::InvalidRequest(format!("header {}: {}", name, e)))?;
            headers.insert(name, value);
        }

        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        if let Ok(id) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, id);
        }

        self.store.with_session(|session| -> Result<_, ApiError> {
            let presented = session
                .map(|s| s.access_credential.as_str())
                .filter(|c| !c.is_empty());

            if let Some(credential) = presented {
                let value = HeaderValue::from_str(&format!("Bearer {}", credential))
                    .map_err(|e| ApiError::InvalidRequest(format!("authorization: {}", e)))?;
                headers.insert(AUTHORIZATION, value);
            }

            let mut builder = self
                .client
                .request(request.method.clone(), url)
                .headers(headers);
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let built = builder
                .build()
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
            Ok((built, presented.map(str::to_string)))
        })
    }

    /// Perform a single call and classify the result
    pub async fn dispatch(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let (outgoing, presented) = self.build(request, &request_id)?;

        let method = outgoing.method().clone();
        let url = outgoing.url().clone();
        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %url,
            authenticated = presented.is_some(),
            "Sending HTTP request"
        );

        let response = match self.client.execute(outgoing).await {
            Ok(response) => response,
            Err(e) => {
                let err = ApiError::from_transport(e);
                tracing::warn!(
                    request_id = %request_id,
                    url = %url,
                    error = %err,
                    "HTTP request error"
                );
                return Err(err);
            }
        };

        let status = response.status();
        tracing::debug!(request_id = %request_id, status = %status, "Received HTTP response");

        if status.is_success() {
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(ApiError::from_transport)?;
            return Ok(ApiResponse {
                status,
                headers,
                body,
            });
        }

        if status == StatusCode::UNAUTHORIZED {
            tracing::info!(
                request_id = %request_id,
                method = %method,
                url = %url,
                "Access credential rejected"
            );
            return Err(ApiError::ExpiredCredential {
                request: Box::new(request.clone()),
                presented,
            });
        }

        let body = response.text().await.unwrap_or_default();
        tracing::warn!(
            request_id = %request_id,
            status = status.as_u16(),
            url = %url,
            "HTTP request failed with error response"
        );
        Err(ApiError::RequestFailed {
            status: status.as_u16(),
            body,
        })
    }
}

/// Get machine fingerprint for User-Agent
fn get_machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn default_user_agent() -> String {
    format!(
        "crm-client/{} ({})",
        env!("CARGO_PKG_VERSION"),
        get_machine_fingerprint()
    )
}

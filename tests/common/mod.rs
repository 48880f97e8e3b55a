// Mock CRM backend shared by the integration tests
//
// Tracks which access and refresh credentials are currently valid, counts
// calls per endpoint, and can delay or reject refresh exchanges.

#![allow(dead_code)]

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

use crm_client::auth::{
    CredentialCache, Navigator, Notification, NotificationSink,
};
use crm_client::config::Config;
use crm_client::CrmClient;

/// How the mock answers `/auth/refresh`
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RefreshMode {
    /// New access and refresh credential; the old refresh credential dies
    Rotate,
    /// New access credential only; the refresh credential stays valid
    KeepRefresh,
    /// Reject with 401
    Reject,
}

pub struct Backend {
    pub access: Mutex<String>,
    pub refresh: Mutex<String>,
    pub mode: Mutex<RefreshMode>,
    pub refresh_delay: Mutex<Duration>,
    pub issued: AtomicUsize,

    pub refresh_calls: AtomicUsize,
    pub lead_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub logout_status: Mutex<StatusCode>,

    /// Refresh credentials received by `/auth/refresh`, in order
    pub refresh_seen: Mutex<Vec<String>>,
    /// Bearer credentials that reached a protected endpoint successfully
    pub accepted: Mutex<Vec<String>>,
}

impl Backend {
    fn new() -> Self {
        Self {
            access: Mutex::new("a-1".to_string()),
            refresh: Mutex::new("r-1".to_string()),
            mode: Mutex::new(RefreshMode::Rotate),
            refresh_delay: Mutex::new(Duration::ZERO),
            issued: AtomicUsize::new(1),
            refresh_calls: AtomicUsize::new(0),
            lead_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            logout_status: Mutex::new(StatusCode::NO_CONTENT),
            refresh_seen: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
        }
    }

    /// Server-side expiry of the current access credential
    pub fn expire_access(&self) {
        *self.access.lock().unwrap() = "expired".to_string();
    }

    pub fn set_mode(&self, mode: RefreshMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn lead_calls(&self) -> usize {
        self.lead_calls.load(Ordering::SeqCst)
    }

    fn bearer_ok(&self, headers: &HeaderMap) -> Option<String> {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))?
            .to_string();
        let valid = self.access.lock().unwrap().clone();
        (presented == valid).then_some(presented)
    }
}

pub struct MockBackend {
    pub state: Arc<Backend>,
    pub url: String,
}

impl MockBackend {
    pub async fn start() -> Self {
        let state = Arc::new(Backend::new());

        let app = Router::new()
            .route("/auth/login", post(login))
            .route("/auth/refresh", post(refresh))
            .route("/auth/logout", post(logout))
            .route("/leads", get(leads))
            .route("/admin/settings", get(admin_settings))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        Self {
            state,
            url: format!("http://{}/", addr),
        }
    }
}

async fn login(State(state): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    if body["password"] != "correct horse" {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad credentials"})))
            .into_response();
    }

    let access = state.access.lock().unwrap().clone();
    let refresh = state.refresh.lock().unwrap().clone();
    Json(json!({
        "access_credential": access,
        "refresh_credential": refresh,
        "lifetime_seconds": 900,
        "user": {"id": "u-1", "display_name": "Dana Reyes", "role": "admin"}
    }))
    .into_response()
}

async fn refresh(State(state): State<Arc<Backend>>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let presented = body["refresh_credential"].as_str().unwrap_or_default().to_string();
    state.refresh_seen.lock().unwrap().push(presented.clone());

    let delay = *state.refresh_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mode = *state.mode.lock().unwrap();
    if mode == RefreshMode::Reject {
        return (StatusCode::UNAUTHORIZED, "refresh credential revoked").into_response();
    }

    {
        let valid = state.refresh.lock().unwrap();
        if presented != *valid {
            return (StatusCode::UNAUTHORIZED, "refresh credential already used").into_response();
        }
    }

    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    let access = format!("a-{}", n);
    *state.access.lock().unwrap() = access.clone();

    match mode {
        RefreshMode::Rotate => {
            let refresh = format!("r-{}", n);
            *state.refresh.lock().unwrap() = refresh.clone();
            Json(json!({
                "access_credential": access,
                "refresh_credential": refresh,
                "lifetime_seconds": 900
            }))
            .into_response()
        }
        _ => Json(json!({
            "access_credential": access,
            "lifetime_seconds": 900
        }))
        .into_response(),
    }
}

async fn logout(State(state): State<Arc<Backend>>) -> StatusCode {
    state.logout_calls.fetch_add(1, Ordering::SeqCst);
    *state.logout_status.lock().unwrap()
}

async fn leads(State(state): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    state.lead_calls.fetch_add(1, Ordering::SeqCst);
    match state.bearer_ok(&headers) {
        Some(credential) => {
            state.accepted.lock().unwrap().push(credential);
            Json(json!([{"id": 1, "name": "Acme Corp", "stage": "qualified"}])).into_response()
        }
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn admin_settings(State(state): State<Arc<Backend>>, headers: HeaderMap) -> Response {
    match state.bearer_ok(&headers) {
        Some(_) => (StatusCode::FORBIDDEN, "admins only").into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

// ==================================================================================================
// Client side helpers
// ==================================================================================================

#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.messages.lock().unwrap().push(notification);
    }
}

#[derive(Default)]
pub struct CountingNavigator {
    pub calls: AtomicUsize,
}

impl CountingNavigator {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Navigator for CountingNavigator {
    fn to_login(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub client: Arc<CrmClient>,
    pub sink: Arc<RecordingSink>,
    pub navigator: Arc<CountingNavigator>,
}

pub fn client_for(backend: &MockBackend, cache: Arc<dyn CredentialCache>) -> Harness {
    let config = Config::new(reqwest::Url::parse(&backend.url).unwrap());
    let sink = Arc::new(RecordingSink::default());
    let navigator = Arc::new(CountingNavigator::default());

    let client = CrmClient::new(
        config,
        cache,
        Some(sink.clone() as Arc<dyn NotificationSink>),
        navigator.clone(),
    )
    .expect("Failed to create client");

    Harness {
        client: Arc::new(client),
        sink,
        navigator,
    }
}

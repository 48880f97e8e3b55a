// Authenticated request pipeline
// Dispatch, refresh on expiry, retry exactly once

use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

use crate::auth::{RefreshCoordinator, RefreshOutcome, SessionStore};
use crate::error::{ApiError, Result};
use crate::http_client::{ApiRequest, ApiResponse, Dispatcher};

/// Entry point for every outbound API call
pub struct RequestPipeline {
    dispatcher: Arc<Dispatcher>,
    coordinator: RefreshCoordinator,
    store: Arc<SessionStore>,

    /// Refresh ahead of the estimated expiry by this many seconds (0 = off)
    refresh_threshold: u64,
}

impl RequestPipeline {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        coordinator: RefreshCoordinator,
        store: Arc<SessionStore>,
        refresh_threshold: u64,
    ) -> Self {
        Self {
            dispatcher,
            coordinator,
            store,
            refresh_threshold,
        }
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Refresh before sending if the session is about to expire.
    /// The expiry estimate is advisory; a 401 still drives the reactive path.
    /// Sessions whose whole lifetime fits inside the threshold are left to
    /// the reactive path, otherwise every call would refresh.
    async fn refresh_if_expiring(&self) -> Option<ApiError> {
        if self.refresh_threshold == 0 {
            return None;
        }

        let current = self
            .store
            .get()
            .filter(|s| s.lifetime_seconds > self.refresh_threshold)
            .filter(|s| s.is_expiring_soon(self.refresh_threshold))
            .map(|s| s.access_credential)?;

        tracing::debug!(
            threshold = self.refresh_threshold,
            "Access credential expiring soon, refreshing ahead of time"
        );

        match self.coordinator.refresh_after(Some(&current)).await {
            RefreshOutcome::Refreshed => None,
            RefreshOutcome::Failed(reason) => Some(ApiError::AuthenticationLost(reason)),
        }
    }

    /// Send a request through the pipeline.
    ///
    /// Success and non-auth failures come back unchanged. A 401 triggers one
    /// refresh and one retry; the retry's result is returned as is.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        if let Some(err) = self.refresh_if_expiring().await {
            return Err(err);
        }

        let presented = match self.dispatcher.dispatch(&request).await {
            Err(ApiError::ExpiredCredential { presented, .. }) => presented,
            other => return other,
        };

        tracing::info!(
            method = %request.method,
            path = %request.path,
            "Request rejected with expired credential, refreshing"
        );

        match self.coordinator.refresh_after(presented.as_deref()).await {
            RefreshOutcome::Refreshed => {
                tracing::debug!(
                    method = %request.method,
                    path = %request.path,
                    "Retrying request with refreshed credential"
                );
                self.dispatcher.dispatch(&request).await
            }
            RefreshOutcome::Failed(reason) => {
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %reason,
                    "Refresh failed, request abandoned"
                );
                Err(ApiError::AuthenticationLost(reason))
            }
        }
    }

    /// GET and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    /// POST a JSON body and decode the JSON response
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = ApiRequest::new(Method::POST, path).with_body(to_value(body)?);
        self.send(request).await?.json()
    }

    /// PUT a JSON body and decode the JSON response
    pub async fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = ApiRequest::new(Method::PUT, path).with_body(to_value(body)?);
        self.send(request).await?.json()
    }

    /// DELETE, ignoring any response body
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.send(ApiRequest::new(Method::DELETE, path)).await?;
        Ok(())
    }
}

fn to_value<B: Serialize>(body: &B) -> Result<serde_json::Value> {
    serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryCredentialCache, NoopSink, Session, SessionTerminator};
    use crate::error::RefreshFailure;
    use reqwest::{Client, Url};
    use std::time::Duration;

    fn pipeline(server: &mockito::ServerGuard, refresh_threshold: u64) -> (RequestPipeline, Arc<SessionStore>) {
        let base = Url::parse(&format!("{}/", server.url())).unwrap();
        let store = Arc::new(SessionStore::new());
        let cache = Arc::new(MemoryCredentialCache::new());
        let terminator = Arc::new(SessionTerminator::new(
            store.clone(),
            cache.clone(),
            Arc::new(NoopSink),
            Arc::new(|| {}),
        ));
        let coordinator = RefreshCoordinator::new(
            Client::new(),
            base.clone(),
            store.clone(),
            cache,
            terminator,
            Duration::from_secs(5),
        );
        let dispatcher = Arc::new(Dispatcher::new(Client::new(), base, store.clone()));

        store.set(Session::new("a-1".to_string(), "r-1".to_string(), 600, None));
        (
            RequestPipeline::new(dispatcher, coordinator, store.clone(), refresh_threshold),
            store,
        )
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/leads/3")
            .with_status(200)
            .with_body(r#"{"id": 3, "name": "Acme"}"#)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        let (pipeline, _) = pipeline(&server, 0);
        let lead: serde_json::Value = pipeline.get_json("/leads/3").await.unwrap();

        assert_eq!(lead["name"], "Acme");
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_then_refreshed_then_retried() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/leads")
            .match_header("authorization", "Bearer a-1")
            .with_status(401)
            .create_async()
            .await;
        let retried = server
            .mock("GET", "/leads")
            .match_header("authorization", "Bearer a-2")
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"access_credential":"a-2"}"#)
            .expect(1)
            .create_async()
            .await;

        let (pipeline, store) = pipeline(&server, 0);
        let leads: Vec<serde_json::Value> = pipeline.get_json("/leads").await.unwrap();

        assert!(leads.is_empty());
        retried.assert_async().await;
        assert_eq!(store.access_credential().as_deref(), Some("a-2"));
    }

    #[tokio::test]
    async fn test_second_401_is_returned_without_another_refresh() {
        let mut server = mockito::Server::new_async().await;
        let leads = server
            .mock("GET", "/leads")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"access_credential":"a-2"}"#)
            .expect(1)
            .create_async()
            .await;

        let (pipeline, _) = pipeline(&server, 0);
        let err = pipeline.send(ApiRequest::get("/leads")).await.unwrap_err();

        assert!(matches!(err, ApiError::ExpiredCredential { .. }));
        leads.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_403_is_not_refreshed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/admin/settings")
            .with_status(403)
            .with_body("admins only")
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;

        let (pipeline, store) = pipeline(&server, 0);
        let err = pipeline
            .send(ApiRequest::get("/admin/settings"))
            .await
            .unwrap_err();

        match err {
            ApiError::RequestFailed { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "admins only");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        refresh.assert_async().await;
        assert!(store.is_authenticated());
    }

    #[tokio::test]
    async fn test_refresh_failure_is_authentication_lost() {
        let mut server = mockito::Server::new_async().await;
        let leads = server
            .mock("GET", "/leads")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(400)
            .with_body("invalid_grant")
            .create_async()
            .await;

        let (pipeline, store) = pipeline(&server, 0);
        let err = pipeline.send(ApiRequest::get("/leads")).await.unwrap_err();

        match err {
            ApiError::AuthenticationLost(RefreshFailure::RefreshExchangeFailed { status, .. }) => {
                assert_eq!(status, 400)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        leads.assert_async().await;
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn test_proactive_refresh_before_dispatch() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"access_credential":"a-2","lifetime_seconds":3600}"#)
            .expect(1)
            .create_async()
            .await;
        let leads = server
            .mock("GET", "/leads")
            .match_header("authorization", "Bearer a-2")
            .with_status(200)
            .with_body("[]")
            .expect(2)
            .create_async()
            .await;

        let (pipeline, store) = pipeline(&server, 900);
        // 50 s left of a 1000 s lifetime
        let mut session = Session::new("a-1".to_string(), "r-1".to_string(), 1000, None);
        session.issued_at = chrono::Utc::now() - chrono::Duration::seconds(950);
        store.set(session);

        pipeline.send(ApiRequest::get("/leads")).await.unwrap();
        // The refreshed session is good for an hour
        pipeline.send(ApiRequest::get("/leads")).await.unwrap();

        refresh.assert_async().await;
        leads.assert_async().await;
        assert_eq!(pipeline.coordinator().exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_short_lifetime_does_not_refresh_every_call() {
        let mut server = mockito::Server::new_async().await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .expect(0)
            .create_async()
            .await;
        let leads = server
            .mock("GET", "/leads")
            .match_header("authorization", "Bearer a-1")
            .with_status(200)
            .with_body("[]")
            .expect(5)
            .create_async()
            .await;

        // 300 s lifetime never leaves a 900 s threshold
        let (pipeline, store) = pipeline(&server, 900);
        store.set(Session::new("a-1".to_string(), "r-1".to_string(), 300, None));

        for _ in 0..5 {
            pipeline.send(ApiRequest::get("/leads")).await.unwrap();
        }

        refresh.assert_async().await;
        leads.assert_async().await;
        assert_eq!(pipeline.coordinator().exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_huge_lifetime_does_not_panic() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/leads")
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let (pipeline, store) = pipeline(&server, 900);
        store.set(Session::new("a-1".to_string(), "r-1".to_string(), u64::MAX, None));

        pipeline.send(ApiRequest::get("/leads")).await.unwrap();
        assert_eq!(pipeline.coordinator().exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_and_post_helpers() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/calls/5")
            .with_status(204)
            .create_async()
            .await;
        server
            .mock("POST", "/documents/9/approve")
            .match_body(mockito::Matcher::Json(serde_json::json!({"note": "ok"})))
            .with_status(200)
            .with_body(r#"{"state":"approved"}"#)
            .create_async()
            .await;

        let (pipeline, _) = pipeline(&server, 0);
        pipeline.delete("/calls/5").await.unwrap();

        let doc: serde_json::Value = pipeline
            .post_json("/documents/9/approve", &serde_json::json!({"note": "ok"}))
            .await
            .unwrap();
        assert_eq!(doc["state"], "approved");
    }

    #[tokio::test]
    async fn test_undecodable_success_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/leads")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let (pipeline, _) = pipeline(&server, 0);
        let err = pipeline
            .get_json::<Vec<serde_json::Value>>("/leads")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}

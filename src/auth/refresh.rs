// Credential exchange calls against the auth endpoints

use reqwest::{Client, Url};
use std::time::Duration;

use super::types::{
    LoginRequest, LoginResponse, RefreshRequest, RefreshResponse, Session, TokenData,
    DEFAULT_LIFETIME_SECONDS,
};
use crate::error::{ApiError, RefreshFailure};

const REFRESH_PATH: &str = "auth/refresh";
const LOGIN_PATH: &str = "auth/login";
const LOGOUT_PATH: &str = "auth/logout";

/// Join an auth endpoint onto the API origin
fn endpoint(base_url: &Url, path: &str) -> Result<Url, String> {
    base_url
        .join(path)
        .map_err(|e| format!("Invalid auth endpoint {}: {}", path, e))
}

/// Exchange a refresh credential for a new access credential.
/// The whole exchange is bounded by `timeout`.
pub async fn refresh_session(
    client: &Client,
    base_url: &Url,
    refresh_credential: &str,
    timeout: Duration,
) -> Result<TokenData, RefreshFailure> {
    match tokio::time::timeout(timeout, exchange(client, base_url, refresh_credential)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(timeout_secs = timeout.as_secs_f64(), "Refresh exchange timed out");
            Err(RefreshFailure::Timeout)
        }
    }
}

async fn exchange(
    client: &Client,
    base_url: &Url,
    refresh_credential: &str,
) -> Result<TokenData, RefreshFailure> {
    tracing::info!("Refreshing access credential...");

    let url = endpoint(base_url, REFRESH_PATH).map_err(RefreshFailure::Transport)?;

    let response = client
        .post(url)
        .json(&RefreshRequest { refresh_credential })
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to send refresh request");
            RefreshFailure::Transport(e.to_string())
        })?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            body = %error_text,
            "Refresh exchange rejected"
        );
        return Err(RefreshFailure::RefreshExchangeFailed {
            status: status.as_u16(),
            message: error_text,
        });
    }

    let data: RefreshResponse = response
        .json()
        .await
        .map_err(|e| RefreshFailure::MalformedResponse(e.to_string()))?;

    if data.access_credential.is_empty() {
        return Err(RefreshFailure::MalformedResponse(
            "response does not contain access_credential".to_string(),
        ));
    }

    let lifetime_seconds = data.lifetime_seconds.unwrap_or(DEFAULT_LIFETIME_SECONDS);
    let rotated = data
        .refresh_credential
        .filter(|refresh| !refresh.is_empty());

    tracing::info!(
        lifetime_seconds,
        rotated = rotated.is_some(),
        "Access credential refreshed"
    );

    Ok(TokenData {
        access_credential: data.access_credential,
        refresh_credential: rotated,
        lifetime_seconds,
    })
}

/// Authenticate with username and password.
/// Any non-2xx status, 401 included, is a plain request failure here.
pub async fn login(
    client: &Client,
    base_url: &Url,
    username: &str,
    password: &str,
) -> Result<Session, ApiError> {
    tracing::info!(username, "Signing in...");

    let url = endpoint(base_url, LOGIN_PATH).map_err(ApiError::InvalidRequest)?;

    let response = client
        .post(url)
        .json(&LoginRequest { username, password })
        .send()
        .await
        .map_err(ApiError::from_transport)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "Sign-in rejected");
        return Err(ApiError::RequestFailed {
            status: status.as_u16(),
            body,
        });
    }

    let data: LoginResponse = response
        .json()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))?;

    if data.access_credential.is_empty() || data.refresh_credential.is_empty() {
        return Err(ApiError::Decode(
            "login response is missing a credential".to_string(),
        ));
    }

    Ok(Session::new(
        data.access_credential,
        data.refresh_credential,
        data.lifetime_seconds.unwrap_or(DEFAULT_LIFETIME_SECONDS),
        Some(data.user),
    ))
}

/// Best-effort server-side invalidation of a refresh credential.
/// Failures are logged and swallowed.
pub async fn logout(client: &Client, base_url: &Url, refresh_credential: &str, timeout: Duration) {
    let url = match endpoint(base_url, LOGOUT_PATH) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!("Skipping server logout: {}", e);
            return;
        }
    };

    let request = client
        .post(url)
        .json(&RefreshRequest { refresh_credential })
        .timeout(timeout)
        .send();

    match request.await {
        Ok(response) if response.status().is_success() => {
            tracing::info!("Refresh credential invalidated on server");
        }
        Ok(response) => {
            tracing::warn!(
                status = response.status().as_u16(),
                "Server logout failed, continuing with local teardown"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Server logout failed, continuing with local teardown");
        }
    }
}

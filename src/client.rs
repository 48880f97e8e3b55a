// Client facade
// Wires session store, cache, dispatcher, refresh and teardown together

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    self, CredentialCache, Identity, Navigator, NoopSink, NotificationSink, RefreshCoordinator,
    Session, SessionStore, SessionTerminator, TeardownReason,
};
use crate::config::Config;
use crate::error::ApiError;
use crate::http_client::Dispatcher;
use crate::pipeline::RequestPipeline;

/// Authenticated CRM API client
pub struct CrmClient {
    config: Config,
    store: Arc<SessionStore>,
    cache: Arc<dyn CredentialCache>,
    dispatcher: Arc<Dispatcher>,
    terminator: Arc<SessionTerminator>,
    pipeline: RequestPipeline,
}

impl CrmClient {
    /// Build the client. `sink` is ignored when notifications are disabled.
    pub fn new(
        config: Config,
        cache: Arc<dyn CredentialCache>,
        sink: Option<Arc<dyn NotificationSink>>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self> {
        let client = Dispatcher::build_client(
            config.http_max_connections,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?;

        let sink: Arc<dyn NotificationSink> = match sink {
            Some(sink) if config.notifications_enabled => sink,
            _ => Arc::new(NoopSink),
        };

        let store = Arc::new(SessionStore::new());
        let terminator = Arc::new(SessionTerminator::new(
            store.clone(),
            cache.clone(),
            sink,
            navigator,
        ));
        let coordinator = RefreshCoordinator::new(
            client.clone(),
            config.base_url.clone(),
            store.clone(),
            cache.clone(),
            terminator.clone(),
            Duration::from_secs(config.refresh_timeout),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            client,
            config.base_url.clone(),
            store.clone(),
        ));
        let pipeline = RequestPipeline::new(
            dispatcher.clone(),
            coordinator,
            store.clone(),
            config.token_refresh_threshold,
        );

        Ok(Self {
            config,
            store,
            cache,
            dispatcher,
            terminator,
            pipeline,
        })
    }

    /// Rehydrate the session from the persistent cache.
    /// On a miss (or unreadable cache) routes to login and returns false.
    pub fn restore(&self) -> bool {
        match self.cache.load().and_then(|p| p.into_session()) {
            Some(session) => {
                tracing::info!(
                    user = session.identity.as_ref().map(|i| i.display_name.as_str()),
                    "Session restored from cache"
                );
                self.store.set(session);
                true
            }
            None => {
                tracing::info!("No cached session, sign-in required");
                self.terminator.terminate(TeardownReason::SignInRequired);
                false
            }
        }
    }

    /// Sign in and store the new session
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, ApiError> {
        let session = auth::login(
            self.dispatcher.client(),
            &self.config.base_url,
            username,
            password,
        )
        .await?;

        let identity = session
            .identity
            .clone()
            .ok_or_else(|| ApiError::Decode("login response has no user".to_string()))?;
        self.cache.wipe();
        self.cache.save(&session.to_persisted());
        self.store.set(session);

        tracing::info!(user = %identity.display_name, "Signed in");
        Ok(identity)
    }

    /// Invalidate the refresh credential on the server (best effort), then
    /// tear down locally
    pub async fn logout(&self) {
        let refresh = self.store.refresh_credential().or_else(|| {
            self.cache
                .load()
                .and_then(|p| p.refresh_credential)
        });

        if let Some(refresh) = refresh {
            auth::logout(
                self.dispatcher.client(),
                &self.config.base_url,
                &refresh,
                Duration::from_secs(self.config.refresh_timeout),
            )
            .await;
        }

        self.terminator.terminate(TeardownReason::LoggedOut);
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn session(&self) -> Option<Session> {
        self.store.get()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.store.identity()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use storage::{Storage, StoredCredentials};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use shared::{
    protocol::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse, RegisterRequest, RegisterResponse},
    UserId, UserProfile,
};

use crate::ClientEvent;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: UserId,
    pub username: String,
    pub access_token: String,
    pub refresh_token: String,
}

impl From<StoredCredentials> for Credentials {
    fn from(value: StoredCredentials) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
            access_token: value.access_token,
            refresh_token: value.refresh_token,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("login rejected: {0}")]
    LoginRejected(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Attaches the bearer token to outgoing requests and owns the token
/// lifecycle: a 401 triggers one refresh and exactly one retry, concurrent
/// 401s share a single refresh, and a rejected refresh tears the session down.
pub struct AuthGateway {
    http: Client,
    server_url: String,
    storage: Storage,
    credentials: RwLock<Option<Credentials>>,
    refresh_gate: Arc<Mutex<()>>,
    events: broadcast::Sender<ClientEvent>,
}

impl AuthGateway {
    pub fn new(
        http: Client,
        server_url: String,
        storage: Storage,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            http,
            server_url,
            storage,
            credentials: RwLock::new(None),
            refresh_gate: Arc::new(Mutex::new(())),
            events,
        }
    }

    /// Loads a previously persisted session so a restarted client comes up
    /// signed in without touching the network.
    pub async fn hydrate(&self) -> Result<Option<UserProfile>, GatewayError> {
        let Some(stored) = self.storage.load_credentials().await? else {
            return Ok(None);
        };
        let profile = UserProfile {
            id: stored.user_id.clone(),
            username: stored.username.clone(),
            status: None,
        };
        *self.credentials.write().await = Some(stored.into());
        debug!(user_id = %profile.id, "hydrated session from credential store");
        Ok(Some(profile))
    }

    pub async fn register(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserProfile, GatewayError> {
        let response = self
            .http
            .post(format!("{}/api/auth/register", self.server_url))
            .json(&RegisterRequest {
                username: username.to_string(),
                password: password.to_string(),
                email: None,
                phone: None,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::LoginRejected(error_message(response).await));
        }
        let body: RegisterResponse = response.json().await?;
        Ok(body.user)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile, GatewayError> {
        let response = self
            .http
            .post(format!("{}/api/auth/login", self.server_url))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::LoginRejected(error_message(response).await));
        }
        let body: LoginResponse = response.json().await?;

        let credentials = Credentials {
            user_id: body.user.id.clone(),
            username: body.user.username.clone(),
            access_token: body.access_token,
            refresh_token: body.refresh_token,
        };
        self.persist(&credentials).await?;
        *self.credentials.write().await = Some(credentials);
        info!(user_id = %body.user.id, "signed in");
        Ok(body.user)
    }

    /// Revokes the refresh token server-side, then drops the local session.
    /// Local state is cleared even when the revocation call fails.
    pub async fn logout(&self) -> Result<(), GatewayError> {
        let refresh_token = {
            self.credentials
                .read()
                .await
                .as_ref()
                .map(|c| c.refresh_token.clone())
        };
        if let Some(refresh_token) = refresh_token {
            let result = self
                .http
                .post(format!("{}/api/auth/logout", self.server_url))
                .json(&RefreshRequest { refresh_token })
                .send()
                .await;
            if let Err(err) = result {
                warn!("logout revocation call failed: {err}");
            }
        }
        self.clear_session().await?;
        Ok(())
    }

    pub async fn current_user(&self) -> Option<(UserId, String)> {
        self.credentials
            .read()
            .await
            .as_ref()
            .map(|c| (c.user_id.clone(), c.username.clone()))
    }

    pub async fn access_token(&self) -> Result<String, GatewayError> {
        self.credentials
            .read()
            .await
            .as_ref()
            .map(|c| c.access_token.clone())
            .ok_or(GatewayError::NotAuthenticated)
    }

    /// Sends an authenticated request. The builder closure is invoked again
    /// for the single post-refresh retry, so it must be repeatable.
    ///
    /// When the refresh itself is rejected the session is invalidated and the
    /// original 401 response is returned so the caller sees the real failure.
    pub async fn send<F>(&self, build: F) -> Result<Response, GatewayError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        match self.refresh_access_token(&token).await {
            Ok(fresh) => {
                debug!("retrying request with refreshed access token");
                Ok(build(&self.http).bearer_auth(&fresh).send().await?)
            }
            Err(err) => {
                warn!("token refresh failed, invalidating session: {err}");
                self.clear_session().await?;
                let _ = self.events.send(ClientEvent::SessionInvalidated);
                Ok(response)
            }
        }
    }

    /// Single-flight refresh. Waiters queue on the gate; whoever held a token
    /// that has already been replaced by the time it gets the lock reuses the
    /// rotated pair instead of burning the refresh token again.
    async fn refresh_access_token(&self, stale_token: &str) -> Result<String, GatewayError> {
        let gate = Arc::clone(&self.refresh_gate);
        let _guard = gate.lock().await;

        let refresh_token = {
            let creds = self.credentials.read().await;
            let Some(creds) = creds.as_ref() else {
                return Err(GatewayError::NotAuthenticated);
            };
            if creds.access_token != stale_token {
                return Ok(creds.access_token.clone());
            }
            creds.refresh_token.clone()
        };

        let response = self
            .http
            .post(format!("{}/api/auth/refresh", self.server_url))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::LoginRejected(error_message(response).await));
        }
        let body: RefreshResponse = response.json().await?;

        let mut creds = self.credentials.write().await;
        let Some(creds) = creds.as_mut() else {
            return Err(GatewayError::NotAuthenticated);
        };
        creds.access_token = body.access_token.clone();
        creds.refresh_token = body.refresh_token;
        self.persist(creds).await?;
        info!("access token refreshed");
        Ok(body.access_token)
    }

    async fn persist(&self, credentials: &Credentials) -> Result<(), GatewayError> {
        self.storage
            .save_credentials(&StoredCredentials {
                user_id: credentials.user_id.clone(),
                username: credentials.username.clone(),
                access_token: credentials.access_token.clone(),
                refresh_token: credentials.refresh_token.clone(),
            })
            .await?;
        Ok(())
    }

    async fn clear_session(&self) -> Result<(), GatewayError> {
        *self.credentials.write().await = None;
        self.storage.clear_credentials().await?;
        Ok(())
    }
}

async fn error_message(response: Response) -> String {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    shared::ApiError::from_response(status, &body).to_string()
}

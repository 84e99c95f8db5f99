//! Google OAuth 2.0 endpoints for the web-server flow.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{AuthError, RemoteError};
use crate::token::{Credentials, EndpointFactory, TokenEndpoint, TokenGrant};

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

/// Full Drive access; Sheets values calls accept the same scope.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    credentials: Credentials,
    http: Client,
    token_url: String,
    revoke_url: String,
}

impl GoogleOAuthClient {
    pub fn new(credentials: Credentials, http: Client) -> Self {
        Self {
            credentials,
            http,
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: GOOGLE_REVOKE_URL.to_string(),
        }
    }

    /// Point the token and revoke calls at another server.
    pub fn with_endpoints(mut self, token_url: impl Into<String>, revoke_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self.revoke_url = revoke_url.into();
        self
    }

    async fn post_token(&self, params: &[(&str, &str)]) -> Result<TokenGrant, AuthError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(params)
            .send()
            .await
            .map_err(|e| AuthError::RefreshDenied(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::RefreshDenied(format!("failed to read token response: {e}")))?;

        if !status.is_success() {
            return Err(classify_token_error(status.as_u16(), &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| AuthError::RefreshDenied(format!("invalid token response: {e}")))
    }
}

/// `invalid_grant` gets its own variant so the settings page can say the code
/// expired; everything else is a denial.
fn classify_token_error(status: u16, body: &str) -> AuthError {
    match serde_json::from_str::<TokenErrorBody>(body) {
        Ok(err) if err.error == "invalid_grant" => {
            AuthError::InvalidGrant(err.error_description.unwrap_or(err.error))
        }
        Ok(err) => AuthError::RefreshDenied(format!(
            "{} ({status}): {}",
            err.error,
            err.error_description.unwrap_or_default()
        )),
        Err(_) => AuthError::RefreshDenied(format!("token endpoint returned {status}: {body}")),
    }
}

pub fn authorization_url(credentials: &Credentials) -> String {
    let params = [
        ("client_id", credentials.client_id.as_str()),
        ("redirect_uri", credentials.redirect_uri.as_str()),
        ("response_type", "code"),
        ("scope", DRIVE_SCOPE),
        ("access_type", "offline"),
        ("prompt", "consent"),
    ];
    match Url::parse_with_params(GOOGLE_AUTH_URL, &params) {
        Ok(url) => url.to_string(),
        Err(_) => GOOGLE_AUTH_URL.to_string(),
    }
}

#[async_trait]
impl TokenEndpoint for GoogleOAuthClient {
    fn authorization_url(&self) -> String {
        authorization_url(&self.credentials)
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
        ];
        let grant = self.post_token(&params).await?;
        info!("exchanged authorization code for tokens");
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let grant = self.post_token(&params).await.map_err(|err| match err {
            AuthError::InvalidGrant(msg) => AuthError::RefreshDenied(msg),
            other => other,
        })?;
        info!("successfully refreshed access token");
        Ok(grant)
    }

    async fn revoke(&self, token: &str) -> Result<(), RemoteError> {
        let response = self
            .http
            .post(&self.revoke_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;
        let status = response.status();
        if status.is_success() {
            debug!("token revoked");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(%status, "token revoke rejected");
        Err(RemoteError::from_status(status.as_u16(), body))
    }
}

/// Builds [`GoogleOAuthClient`]s sharing one HTTP connection pool.
#[derive(Debug, Clone)]
pub struct GoogleOAuthFactory {
    http: Client,
}

impl GoogleOAuthFactory {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

impl EndpointFactory for GoogleOAuthFactory {
    fn build(&self, credentials: &Credentials) -> Arc<dyn TokenEndpoint> {
        Arc::new(GoogleOAuthClient::new(credentials.clone(), self.http.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            client_id: "cid.apps.googleusercontent.com".into(),
            client_secret: "s".into(),
            redirect_uri: "https://forms.example.com/auth/callback".into(),
        }
    }

    #[test]
    fn authorization_url_requests_offline_drive_access() {
        let url = Url::parse(&authorization_url(&creds())).unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("scope".into(), DRIVE_SCOPE.into())));
        assert!(pairs.contains(&("access_type".into(), "offline".into())));
        assert!(pairs.contains(&(
            "redirect_uri".into(),
            "https://forms.example.com/auth/callback".into()
        )));
    }

    #[test]
    fn invalid_grant_is_distinguished() {
        let err = classify_token_error(
            400,
            r#"{"error":"invalid_grant","error_description":"Bad Request"}"#,
        );
        assert_eq!(err, AuthError::InvalidGrant("Bad Request".into()));

        let err = classify_token_error(401, r#"{"error":"invalid_client"}"#);
        assert!(matches!(err, AuthError::RefreshDenied(m) if m.contains("invalid_client")));

        let err = classify_token_error(502, "<html>");
        assert!(matches!(err, AuthError::RefreshDenied(m) if m.contains("502")));
    }
}

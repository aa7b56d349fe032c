//! OAuth 2.0 token acquisition for Salesforce.
//!
//! Supports the two non-interactive grants a headless sync needs:
//! - username-password (`grant_type=password`)
//! - refresh token (`grant_type=refresh_token`)
//!
//! Tokens are held in `SecretString` and never logged.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{error, info};
use url::Url;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// LoginEnvironment
// ─────────────────────────────────────────────────────────────────────────────

const PRODUCTION_LOGIN_URL: &str = "https://login.salesforce.com";
const SANDBOX_LOGIN_URL: &str = "https://test.salesforce.com";

/// Specifies the Salesforce login environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEnvironment {
    /// Production environment (login.salesforce.com)
    Production,
    /// Sandbox environment (test.salesforce.com)
    Sandbox,
    /// My Domain or other custom login host.
    Custom(Url),
}

impl LoginEnvironment {
    /// Parses `production`, `sandbox`, or an https login URL.
    pub fn parse(value: &str) -> Result<Self, AppError> {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(LoginEnvironment::Production),
            "sandbox" | "test" => Ok(LoginEnvironment::Sandbox),
            _ => {
                let url = Url::parse(trimmed).map_err(|_| {
                    AppError::Config(format!(
                        "login environment must be 'production', 'sandbox' or an https URL, got '{}'",
                        trimmed
                    ))
                })?;
                if url.scheme() != "https" {
                    return Err(AppError::Config(
                        "custom login URL must use https".to_string(),
                    ));
                }
                Ok(LoginEnvironment::Custom(url))
            }
        }
    }

    /// Returns the login base URL (no trailing path).
    pub fn login_url(&self) -> String {
        match self {
            LoginEnvironment::Production => PRODUCTION_LOGIN_URL.to_string(),
            LoginEnvironment::Sandbox => SANDBOX_LOGIN_URL.to_string(),
            LoginEnvironment::Custom(url) => url.as_str().trim_end_matches('/').to_string(),
        }
    }

    /// Returns the token endpoint for this environment.
    fn token_url(&self) -> String {
        format!("{}/services/oauth2/token", self.login_url())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// An authenticated Salesforce session.
///
/// The access token is wrapped in `SecretString`; `Debug` redacts it.
#[derive(Clone)]
pub struct Session {
    /// Instance URL (e.g., "https://na1.salesforce.com")
    pub instance_url: Url,
    /// OAuth access token
    pub access_token: SecretString,
}

impl Session {
    pub fn new(instance_url: Url, access_token: SecretString) -> Self {
        Self {
            instance_url,
            access_token,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instance_url", &self.instance_url.as_str())
            .field("access_token", &"[REDACTED]")
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authenticator
// ─────────────────────────────────────────────────────────────────────────────

/// Produces a fresh session. Implemented by the OAuth client and by test fakes.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self) -> Pin<Box<dyn Future<Output = Result<Session, AppError>> + Send + '_>>;
}

/// Credentials for a non-interactive OAuth grant.
#[derive(Clone)]
pub enum Grant {
    Password {
        username: String,
        password: SecretString,
    },
    RefreshToken(SecretString),
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grant::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Grant::RefreshToken(_) => f.debug_tuple("RefreshToken").field(&"[REDACTED]").finish(),
        }
    }
}

/// Response from the token endpoint.
#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
    instance_url: String,
}

/// Error body returned by the token endpoint on 400/401.
#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth client for the password and refresh-token grants.
pub struct OAuthAuthenticator {
    http: Arc<reqwest::Client>,
    environment: LoginEnvironment,
    client_id: String,
    client_secret: Option<SecretString>,
    grant: Grant,
}

impl OAuthAuthenticator {
    pub fn new(
        http: Arc<reqwest::Client>,
        environment: LoginEnvironment,
        client_id: String,
        client_secret: Option<SecretString>,
        grant: Grant,
    ) -> Self {
        Self {
            http,
            environment,
            client_id,
            client_secret,
            grant,
        }
    }

    /// Exchanges the configured grant for an access token.
    ///
    /// # Errors
    ///
    /// - `AppError::AuthenticationFailure` - credentials rejected (400/401)
    /// - `AppError::ConnectionFailed` - network error
    ///
    /// # Security
    ///
    /// Never logs the password, refresh token, or the new access token.
    pub async fn request_token(&self) -> Result<Session, AppError> {
        let token_url = self.environment.token_url();

        let mut params: Vec<(&str, &str)> = vec![("client_id", self.client_id.as_str())];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.expose_secret()));
        }
        match &self.grant {
            Grant::Password { username, password } => {
                info!("[SFDC] Requesting access token (password grant)");
                params.push(("grant_type", "password"));
                params.push(("username", username.as_str()));
                params.push(("password", password.expose_secret()));
            }
            Grant::RefreshToken(token) => {
                info!("[SFDC] Requesting access token (refresh grant)");
                params.push(("grant_type", "refresh_token"));
                params.push(("refresh_token", token.expose_secret()));
            }
        }

        let response = self
            .http
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|_| {
                error!("[SFDC] Token request failed");
                AppError::ConnectionFailed("Failed to connect to the token endpoint".to_string())
            })?;

        let status = response.status();

        if status.is_success() {
            let body: AccessTokenResponse = response.json().await.map_err(|_| {
                error!("[SFDC] Failed to parse token response");
                AppError::AuthenticationFailure("Invalid token response".to_string())
            })?;
            let instance_url = Url::parse(&body.instance_url).map_err(|_| {
                AppError::AuthenticationFailure("Token response has an invalid instance URL".into())
            })?;

            info!("[SFDC] Authentication successful");
            Ok(Session::new(instance_url, SecretString::from(body.access_token)))
        } else if status == reqwest::StatusCode::BAD_REQUEST
            || status == reqwest::StatusCode::UNAUTHORIZED
        {
            let detail = match response.json::<OAuthErrorResponse>().await {
                Ok(err) => match err.error_description {
                    Some(desc) => format!("{}: {}", err.error, desc),
                    None => err.error,
                },
                Err(_) => format!("HTTP {}", status.as_u16()),
            };
            error!("[SFDC] Authentication rejected: {}", status);
            Err(AppError::AuthenticationFailure(detail))
        } else {
            error!("[SFDC] Authentication failed with status: {}", status);
            Err(AppError::AuthenticationFailure(format!(
                "Token endpoint returned HTTP {}",
                status.as_u16()
            )))
        }
    }
}

impl Authenticator for OAuthAuthenticator {
    fn authenticate(&self) -> Pin<Box<dyn Future<Output = Result<Session, AppError>> + Send + '_>> {
        Box::pin(self.request_token())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_environment_urls() {
        assert_eq!(
            LoginEnvironment::Production.login_url(),
            "https://login.salesforce.com"
        );
        assert_eq!(
            LoginEnvironment::Sandbox.token_url(),
            "https://test.salesforce.com/services/oauth2/token"
        );
        let custom = LoginEnvironment::parse("https://acme.my.salesforce.com/").unwrap();
        assert_eq!(custom.login_url(), "https://acme.my.salesforce.com");
    }

    #[test]
    fn login_environment_parse_accepts_names() {
        assert_eq!(
            LoginEnvironment::parse("Production").unwrap(),
            LoginEnvironment::Production
        );
        assert_eq!(
            LoginEnvironment::parse(" sandbox ").unwrap(),
            LoginEnvironment::Sandbox
        );
    }

    #[test]
    fn login_environment_parse_rejects_garbage() {
        assert!(matches!(
            LoginEnvironment::parse("staging"),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            LoginEnvironment::parse("http://insecure.example.com"),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = Session::new(
            Url::parse("https://na1.salesforce.com").unwrap(),
            SecretString::from("super_secret_token_12345".to_string()),
        );
        let debug_output = format!("{:?}", session);
        assert!(debug_output.contains("na1.salesforce.com"));
        assert!(!debug_output.contains("super_secret_token_12345"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn grant_debug_redacts_secrets() {
        let grant = Grant::Password {
            username: "sync@example.com".to_string(),
            password: SecretString::from("hunter2".to_string()),
        };
        let debug_output = format!("{:?}", grant);
        assert!(debug_output.contains("sync@example.com"));
        assert!(!debug_output.contains("hunter2"));
    }
}

//! Credential strategies. Each one hands out bearer tokens for a resource audience on demand;
//! Key Vault and Resource Manager clients only ever see the [`TokenCredential`] trait.

mod default;
mod interactive;
mod managed_identity;

pub use self::default::{AzureCliCredential, DefaultCredential, EnvironmentCredential};
pub use self::interactive::{AuthenticationRecord, InteractiveCredential, DEVELOPER_CLIENT_ID};
pub use self::managed_identity::ManagedIdentityCredential;

use crate::CredentialError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{de, Deserialize, Deserializer};
use std::{collections::HashMap, fmt, future::Future, str::FromStr};
use tokio::sync::Mutex;

/// Audience of Key Vault data-plane tokens.
pub const KEY_VAULT_RESOURCE: &str = "https://vault.azure.net";
/// Audience of Azure Resource Manager tokens.
pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECONDS: i64 = 180;

#[async_trait(?Send)]
pub trait TokenCredential: fmt::Debug + Send + Sync {
    /// Returns a bearer token for `resource`, fetching a new one if needed.
    async fn get_token(&self, resource: &str) -> Result<AccessToken, CredentialError>;

    /// Short name used in logs and chain diagnostics.
    fn name(&self) -> &'static str;

    /// Describes the identity behind the issued tokens, once known.
    fn principal_used(&self) -> Option<String> {
        None
    }
}

/// A bearer token and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: oauth2::AccessToken,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new<S: Into<String>>(secret: S, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: oauth2::AccessToken::new(secret.into()),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        self.token.secret()
    }

    pub fn is_expiring(&self) -> bool {
        self.expires_on - Duration::seconds(EXPIRY_MARGIN_SECONDS) <= Utc::now()
    }
}

/// Which credential strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Interactive,
    Default,
    ManagedIdentity,
}

impl CredentialKind {
    pub const VARIANTS: &'static [&'static str] = &["interactive", "default", "managed-identity"];
}

impl FromStr for CredentialKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Ok(CredentialKind::Interactive),
            "default" => Ok(CredentialKind::Default),
            "managed-identity" | "managedidentity" => Ok(CredentialKind::ManagedIdentity),
            other => Err(format!(
                "unknown credential kind '{}', expected one of: {}",
                other,
                Self::VARIANTS.join(", ")
            )),
        }
    }
}

/// Wraps an already minted token. Used to hand a management token to the resource client as-is.
#[derive(Debug, Clone)]
pub struct StaticTokenCredential {
    token: AccessToken,
}

impl StaticTokenCredential {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

#[async_trait(?Send)]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _resource: &str) -> Result<AccessToken, CredentialError> {
        Ok(self.token.clone())
    }

    fn name(&self) -> &'static str {
        "StaticTokenCredential"
    }
}

/// Per-audience token cache shared by the credentials that mint their own tokens.
#[derive(Debug)]
pub(crate) struct TokenCache {
    tokens: Mutex<HashMap<String, AccessToken>>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached token for `resource`, or runs `fetch` and caches its result.
    /// The lock is held while fetching, so `fetch` must not touch the cache.
    pub(crate) async fn get_or_fetch<F, Fut>(&self, resource: &str, fetch: F) -> Result<AccessToken, CredentialError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken, CredentialError>>,
    {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(resource) {
            if !token.is_expiring() {
                return Ok(token.clone());
            }
        }

        debug!("Token for {} is missing or expires soon, requesting a new one", resource);
        let token = fetch().await?;
        tokens.insert(resource.to_owned(), token.clone());
        Ok(token)
    }
}

/// v2 endpoints take scopes rather than a resource.
pub(crate) fn scope_for(resource: &str) -> String {
    format!("{}/.default", resource.trim_end_matches('/'))
}

/// Identity endpoints disagree on whether numbers are sent as numbers or strings.
pub(crate) fn number_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

/// OAuth2 error payload, shared by the token endpoints.
#[derive(Deserialize, Debug)]
pub(crate) struct IdentityErrorResponse {
    pub(crate) error: String,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

impl From<IdentityErrorResponse> for CredentialError {
    fn from(response: IdentityErrorResponse) -> Self {
        let IdentityErrorResponse { error, error_description } = response;
        CredentialError::Identity {
            description: error_description.unwrap_or_else(|| error.clone()),
            code: error,
        }
    }
}

use super::{number_or_string, AccessToken, IdentityErrorResponse, TokenCache, TokenCredential};
use crate::CredentialError;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{debug, info};
use serde::Deserialize;
use std::{env, time::Duration};
use url::Url;

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const SOURCE_NAME: &str = "ManagedIdentityCredential";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
enum IdentityEndpoint {
    /// Azure instance metadata service, reachable from VMs and containers.
    Imds(Url),
    /// App Service and Functions expose their own endpoint plus a shared secret header.
    AppService { url: Url, header: String },
}

/// Token provider backed by the host's managed identity.
///
/// Acts as the token callback for Key Vault calls and mints management tokens through
/// [`ManagedIdentityCredential::get_access_token`]. The principal is recorded after the first
/// successful token.
#[derive(Debug)]
pub struct ManagedIdentityCredential {
    http_client: reqwest::Client,
    endpoint: IdentityEndpoint,
    client_id: Option<String>,
    principal: std::sync::Mutex<Option<String>>,
    cache: TokenCache,
}

#[derive(Deserialize, Debug)]
struct ManagedIdentityTokenResponse {
    access_token: String,
    #[serde(deserialize_with = "number_or_string")]
    expires_on: i64,
    #[serde(default)]
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    /// Picks the App Service endpoint when `IDENTITY_ENDPOINT`/`IDENTITY_HEADER` are set, the
    /// instance metadata service otherwise. `client_id` selects a user-assigned identity.
    pub fn new(client_id: Option<String>) -> Self {
        let app_service = env::var("IDENTITY_ENDPOINT")
            .ok()
            .and_then(|url| Url::parse(&url).ok())
            .zip(env::var("IDENTITY_HEADER").ok());
        let endpoint = match app_service {
            Some((url, header)) => IdentityEndpoint::AppService { url, header },
            None => IdentityEndpoint::Imds(Url::parse(IMDS_ENDPOINT).expect("constant url is valid")),
        };
        Self::with_endpoint(endpoint, client_id)
    }

    /// Uses the instance metadata protocol against `url`.
    pub fn with_imds_endpoint(url: Url, client_id: Option<String>) -> Self {
        Self::with_endpoint(IdentityEndpoint::Imds(url), client_id)
    }

    fn with_endpoint(endpoint: IdentityEndpoint, client_id: Option<String>) -> Self {
        // Off Azure the metadata address is usually a black hole; fail fast instead of waiting on TCP.
        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            endpoint,
            client_id,
            principal: std::sync::Mutex::new(None),
            cache: TokenCache::new(),
        }
    }

    /// Mints (or reuses) a bearer token for `resource` and returns its raw value.
    pub async fn get_access_token(&self, resource: &str) -> Result<String, CredentialError> {
        let token = self.get_token(resource).await?;
        Ok(token.secret().to_owned())
    }

    async fn request_token(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        let request = match &self.endpoint {
            IdentityEndpoint::Imds(url) => {
                let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
                if let Some(client_id) = &self.client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                self.http_client.get(url.clone()).header("Metadata", "true").query(&query)
            }
            IdentityEndpoint::AppService { url, header } => {
                let mut query = vec![("api-version", APP_SERVICE_API_VERSION), ("resource", resource)];
                if let Some(client_id) = &self.client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                self.http_client
                    .get(url.clone())
                    .header("X-IDENTITY-HEADER", header.as_str())
                    .query(&query)
            }
        };

        debug!("Requesting managed identity token for {}", resource);
        let response = request.send().await.map_err(|e| CredentialError::Unavailable {
            source_name: SOURCE_NAME,
            reason: format!("identity endpoint unreachable: {}", e),
        })?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<IdentityErrorResponse>(&body) {
                Ok(error) => error.into(),
                Err(_) => CredentialError::Unavailable {
                    source_name: SOURCE_NAME,
                    reason: format!("identity endpoint answered {}", status),
                },
            });
        }

        let response: ManagedIdentityTokenResponse =
            serde_json::from_str(&body).map_err(|e| CredentialError::Malformed(e.to_string()))?;
        self.record_principal(&response);
        let expires_on = Utc.timestamp_opt(response.expires_on, 0).single().unwrap_or_else(Utc::now);
        Ok(AccessToken::new(response.access_token, expires_on))
    }

    fn record_principal(&self, response: &ManagedIdentityTokenResponse) {
        let app_id = response
            .client_id
            .as_deref()
            .or_else(|| self.client_id.as_deref())
            .unwrap_or("system-assigned");
        if let Ok(mut principal) = self.principal.lock() {
            if principal.is_none() {
                info!("Managed identity {} issued the first token", app_id);
                *principal = Some(format!("Type:ManagedIdentity AppId:{}", app_id));
            }
        }
    }
}

#[async_trait(?Send)]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        self.cache.get_or_fetch(resource, || self.request_token(resource)).await
    }

    fn name(&self) -> &'static str {
        SOURCE_NAME
    }

    fn principal_used(&self) -> Option<String> {
        self.principal.lock().ok().and_then(|principal| principal.clone())
    }
}

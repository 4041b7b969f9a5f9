use super::{number_or_string, scope_for, AccessToken, IdentityErrorResponse, TokenCache, TokenCredential};
use crate::CredentialError;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use getset::Getters;
use log::{debug, info};
use oauth2::RefreshToken;
use serde::Deserialize;
use std::{fmt, sync::Arc};
use tokio::sync::Mutex;
use url::Url;

/// Public client id of the Azure CLI, usable for delegated sign-in without registering an app.
pub const DEVELOPER_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const SIGN_IN_SCOPES: &str = "offline_access openid profile";
const SLOW_DOWN_STEP_SECONDS: u64 = 5;

/// Who signed in, as reported by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct AuthenticationRecord {
    authority: String,
    tenant_id: String,
    username: String,
    home_account_id: String,
    client_id: String,
}

type PromptFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Delegated sign-in through the device-code flow: the user opens the printed URL in a browser and
/// enters the code. Tokens for further audiences are redeemed with the refresh token from that sign-in.
pub struct InteractiveCredential {
    http_client: reqwest::Client,
    authority: Url,
    tenant_id: String,
    client_id: String,
    prompt: PromptFn,
    record: std::sync::Mutex<Option<AuthenticationRecord>>,
    refresh_token: Mutex<Option<RefreshToken>>,
    cache: TokenCache,
}

impl fmt::Debug for InteractiveCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InteractiveCredential")
            .field("authority", &self.authority.as_str())
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .finish()
    }
}

#[derive(Deserialize, Debug)]
struct DeviceCodeResponse {
    device_code: String,
    message: String,
    #[serde(deserialize_with = "number_or_string")]
    expires_in: i64,
    #[serde(default = "default_interval", deserialize_with = "number_or_string")]
    interval: i64,
}

fn default_interval() -> i64 {
    5
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(deserialize_with = "number_or_string")]
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TokenResponse {
    fn access_token(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone(), Utc::now() + Duration::seconds(self.expires_in))
    }
}

#[derive(Deserialize)]
struct IdTokenClaims {
    tid: String,
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    upn: Option<String>,
}

impl InteractiveCredential {
    pub fn new(authority: Url, tenant_id: &str, client_id: &str) -> Self {
        Self::with_prompt(authority, tenant_id, client_id, |message: &str| println!("{}", message))
    }

    /// Same as `new`, with a custom sink for the sign-in instructions.
    pub fn with_prompt<P>(mut authority: Url, tenant_id: &str, client_id: &str, prompt: P) -> Self
    where
        P: Fn(&str) + Send + Sync + 'static,
    {
        if !authority.path().ends_with('/') {
            let path = format!("{}/", authority.path());
            authority.set_path(&path);
        }
        Self {
            http_client: reqwest::Client::new(),
            authority,
            tenant_id: tenant_id.to_owned(),
            client_id: client_id.to_owned(),
            prompt: Arc::new(prompt),
            record: std::sync::Mutex::new(None),
            refresh_token: Mutex::new(None),
            cache: TokenCache::new(),
        }
    }

    /// Who signed in, once the first token has been issued.
    pub fn record(&self) -> Option<AuthenticationRecord> {
        self.record.lock().ok().and_then(|record| record.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url, CredentialError> {
        self.authority
            .join(&format!("{}/oauth2/v2.0/{}", self.tenant_id, path))
            .map_err(|e| CredentialError::Malformed(format!("invalid authority: {}", e)))
    }

    async fn sign_in(&self, resource: &str) -> Result<(AuthenticationRecord, AccessToken), CredentialError> {
        let scope = format!("{} {}", scope_for(resource), SIGN_IN_SCOPES);
        let device_code = self
            .http_client
            .post(self.endpoint("devicecode")?)
            .form(&[("client_id", self.client_id.as_str()), ("scope", scope.as_str())])
            .send()
            .await?;
        let device_code: DeviceCodeResponse = parse_identity_response(device_code).await?;

        (self.prompt)(device_code.message.as_str());

        let response = self.poll_device_code(&device_code).await?;
        let record = self.record_from(&response)?;
        info!(
            "Signed in as {} (tenant {})",
            record.username(),
            record.tenant_id()
        );

        *self.refresh_token.lock().await = response.refresh_token.clone().map(RefreshToken::new);
        if let Ok(mut slot) = self.record.lock() {
            *slot = Some(record.clone());
        }
        Ok((record, response.access_token()))
    }

    async fn poll_device_code(&self, device_code: &DeviceCodeResponse) -> Result<TokenResponse, CredentialError> {
        let deadline = Utc::now() + Duration::seconds(device_code.expires_in);
        let mut interval = device_code.interval.max(0) as u64;
        let token_url = self.endpoint("token")?;

        loop {
            if Utc::now() > deadline {
                return Err(CredentialError::Expired);
            }
            let response = self
                .http_client
                .post(token_url.clone())
                .form(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", device_code.device_code.as_str()),
                ])
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            if status.is_success() {
                return serde_json::from_str(&body).map_err(|e| CredentialError::Malformed(e.to_string()));
            }

            let error: IdentityErrorResponse =
                serde_json::from_str(&body).map_err(|e| CredentialError::Malformed(e.to_string()))?;
            match error.error.as_str() {
                "authorization_pending" => {}
                "slow_down" => interval += SLOW_DOWN_STEP_SECONDS,
                _ => return Err(error.into()),
            }
            debug!("Waiting {}s for sign-in to complete", interval);
            tokio::time::delay_for(std::time::Duration::from_secs(interval)).await;
        }
    }

    async fn redeem(&self, refresh_token: &RefreshToken, resource: &str) -> Result<AccessToken, CredentialError> {
        let scope = format!("{} offline_access", scope_for(resource));
        let response = self
            .http_client
            .post(self.endpoint("token")?)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token.secret().as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        let response: TokenResponse = parse_identity_response(response).await?;

        if let Some(rotated) = response.refresh_token.clone() {
            *self.refresh_token.lock().await = Some(RefreshToken::new(rotated));
        }
        Ok(response.access_token())
    }

    async fn acquire(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        let refresh_token = self.refresh_token.lock().await.clone();
        match refresh_token {
            Some(refresh_token) => self.redeem(&refresh_token, resource).await,
            None => self.sign_in(resource).await.map(|(_, token)| token),
        }
    }

    fn record_from(&self, response: &TokenResponse) -> Result<AuthenticationRecord, CredentialError> {
        let id_token = response
            .id_token
            .as_deref()
            .ok_or_else(|| CredentialError::Malformed("token response has no id_token".to_owned()))?;
        let claims = decode_claims(id_token)?;
        let username = claims
            .preferred_username
            .or(claims.upn)
            .unwrap_or_else(|| "unknown".to_owned());
        let home_account_id = match claims.oid {
            Some(oid) => format!("{}.{}", oid, claims.tid),
            None => claims.tid.clone(),
        };
        Ok(AuthenticationRecord {
            authority: self.authority.host_str().unwrap_or_default().to_owned(),
            tenant_id: claims.tid,
            username,
            home_account_id,
            client_id: self.client_id.clone(),
        })
    }
}

#[async_trait(?Send)]
impl TokenCredential for InteractiveCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        self.cache.get_or_fetch(resource, || self.acquire(resource)).await
    }

    fn name(&self) -> &'static str {
        "InteractiveCredential"
    }

    fn principal_used(&self) -> Option<String> {
        self.record().map(|record| {
            format!(
                "{} TenantId:{} UserPrincipalName:{}",
                record.authority, record.tenant_id, record.username
            )
        })
    }
}

async fn parse_identity_response<T>(response: reqwest::Response) -> Result<T, CredentialError>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(match serde_json::from_str::<IdentityErrorResponse>(&body) {
            Ok(error) => error.into(),
            Err(_) => CredentialError::Identity {
                code: status.as_u16().to_string(),
                description: body,
            },
        });
    }
    serde_json::from_str(&body).map_err(|e| CredentialError::Malformed(e.to_string()))
}

fn decode_claims(id_token: &str) -> Result<IdTokenClaims, CredentialError> {
    let payload = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| CredentialError::Malformed("id_token is not a JWT".to_owned()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CredentialError::Malformed(format!("id_token payload: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| CredentialError::Malformed(format!("id_token claims: {}", e)))
}

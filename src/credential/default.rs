use super::{AccessToken, ManagedIdentityCredential, TokenCache, TokenCredential};
use crate::CredentialError;
use anyhow::Context;
use async_trait::async_trait;
use azure_sdk_auth_aad::authorize_non_interactive;
use chrono::{Local, NaiveDateTime, TimeZone, Utc};
use log::{debug, info, warn};
use oauth2::{ClientId, ClientSecret};
use serde::Deserialize;
use std::{env, fmt, sync::Arc};
use tokio::process::Command;

const ENVIRONMENT_SOURCE: &str = "EnvironmentCredential";
const AZURE_CLI_SOURCE: &str = "AzureCliCredential";

/// Ambient credential: tries each source in order without user interaction and sticks with the
/// first one that produces a token. Only unavailable sources are skipped; any other failure ends
/// the search.
#[derive(Debug)]
pub struct DefaultCredential {
    sources: Vec<Box<dyn TokenCredential>>,
    selected: std::sync::Mutex<Option<usize>>,
}

impl DefaultCredential {
    /// Environment variables, then the Azure CLI, then managed identity.
    pub fn new(managed_identity_client_id: Option<String>) -> Self {
        Self::with_sources(vec![
            Box::new(EnvironmentCredential::from_env()),
            Box::new(AzureCliCredential::new()),
            Box::new(ManagedIdentityCredential::new(managed_identity_client_id)),
        ])
    }

    pub fn with_sources(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self {
            sources,
            selected: std::sync::Mutex::new(None),
        }
    }

    fn selected_source(&self) -> Option<&dyn TokenCredential> {
        let index = (*self.selected.lock().ok()?)?;
        self.sources.get(index).map(|source| source.as_ref())
    }
}

impl fmt::Display for DefaultCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.selected_source() {
            Some(source) => write!(f, "DefaultCredential({})", source.name()),
            None => write!(f, "DefaultCredential"),
        }
    }
}

#[async_trait(?Send)]
impl TokenCredential for DefaultCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        if let Some(source) = self.selected_source() {
            return source.get_token(resource).await;
        }

        let mut failures = Vec::with_capacity(self.sources.len());
        for (index, source) in self.sources.iter().enumerate() {
            match source.get_token(resource).await {
                Ok(token) => {
                    info!("{} provided a token, using it for the rest of the run", source.name());
                    if let Ok(mut selected) = self.selected.lock() {
                        *selected = Some(index);
                    }
                    return Ok(token);
                }
                Err(err @ CredentialError::Unavailable { .. }) => {
                    debug!("{} skipped: {}", source.name(), err);
                    failures.push(format!("{}: {}", source.name(), err));
                }
                // A configured source that fails must not fall through to another identity.
                Err(err) => {
                    warn!("{} is configured but failed: {}", source.name(), err);
                    return Err(err);
                }
            }
        }
        Err(CredentialError::ChainExhausted(failures.join("; ")))
    }

    fn name(&self) -> &'static str {
        "DefaultCredential"
    }

    fn principal_used(&self) -> Option<String> {
        Some(self.to_string())
    }
}

#[derive(Debug)]
struct EnvironmentSettings {
    tenant_id: String,
    client_id: ClientId,
    client_secret: ClientSecret,
}

/// Service principal from `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`,
/// authenticated with the client-credentials grant.
#[derive(Debug)]
pub struct EnvironmentCredential {
    settings: Result<EnvironmentSettings, String>,
    http_client: Arc<reqwest::Client>,
    cache: TokenCache,
}

impl EnvironmentCredential {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the three settings through `lookup`; missing ones make the credential unavailable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let names = ["AZURE_TENANT_ID", "AZURE_CLIENT_ID", "AZURE_CLIENT_SECRET"];
        let values: Vec<Option<String>> = names
            .iter()
            .map(|name| lookup(*name).filter(|value| !value.is_empty()))
            .collect();

        let settings = match (&values[0], &values[1], &values[2]) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Ok(EnvironmentSettings {
                tenant_id: tenant_id.clone(),
                client_id: ClientId::new(client_id.clone()),
                client_secret: ClientSecret::new(client_secret.clone()),
            }),
            _ => {
                let missing: Vec<&str> = names
                    .iter()
                    .zip(values.iter())
                    .filter(|(_, value)| value.is_none())
                    .map(|(name, _)| *name)
                    .collect();
                Err(format!("environment variables not set: {}", missing.join(", ")))
            }
        };

        Self {
            settings,
            http_client: Arc::new(reqwest::Client::new()),
            cache: TokenCache::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.settings.is_ok()
    }
}

#[async_trait(?Send)]
impl TokenCredential for EnvironmentCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        let settings = self.settings.as_ref().map_err(|reason| CredentialError::Unavailable {
            source_name: ENVIRONMENT_SOURCE,
            reason: reason.clone(),
        })?;

        self.cache
            .get_or_fetch(resource, || async move {
                let token = authorize_non_interactive(
                    self.http_client.clone(),
                    &settings.client_id,
                    &settings.client_secret,
                    resource,
                    &settings.tenant_id,
                )
                .await
                .with_context(|| "Failed to authenticate to Azure Active Directory")
                .map_err(CredentialError::AuthorizationError)?;
                Ok(AccessToken {
                    token: token.access_token().clone(),
                    expires_on: token.expires_on,
                })
            })
            .await
    }

    fn name(&self) -> &'static str {
        ENVIRONMENT_SOURCE
    }
}

/// Reuses the account the developer signed into with `az login`.
#[derive(Debug)]
pub struct AzureCliCredential {
    program: String,
    cache: TokenCache,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CliTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    #[serde(rename = "expires_on", default)]
    expires_on_timestamp: Option<i64>,
}

impl AzureCliCredential {
    pub fn new() -> Self {
        Self::with_program("az")
    }

    pub fn with_program(program: &str) -> Self {
        Self {
            program: program.to_owned(),
            cache: TokenCache::new(),
        }
    }

    async fn request_token(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        let mut command = if cfg!(windows) {
            let mut command = Command::new("cmd");
            command.args(&["/C", self.program.as_str()]);
            command
        } else {
            Command::new(&self.program)
        };
        command.args(&["account", "get-access-token", "--output", "json", "--resource", resource]);

        debug!("Asking the Azure CLI for a token for {}", resource);
        let output = command.output().await.map_err(|e| CredentialError::Unavailable {
            source_name: AZURE_CLI_SOURCE,
            reason: format!("failed to run '{}': {}", self.program, e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("az login") || stderr.contains("not recognized") || stderr.contains("not found") {
                return Err(CredentialError::Unavailable {
                    source_name: AZURE_CLI_SOURCE,
                    reason: "please run 'az login' to set up an account".to_owned(),
                });
            }
            return Err(CredentialError::Identity {
                code: "AzureCliError".to_owned(),
                description: stderr.trim().to_owned(),
            });
        }

        parse_cli_token(&output.stdout)
    }
}

impl Default for AzureCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TokenCredential for AzureCliCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, CredentialError> {
        self.cache.get_or_fetch(resource, || self.request_token(resource)).await
    }

    fn name(&self) -> &'static str {
        AZURE_CLI_SOURCE
    }
}

/// Newer CLI versions add an `expires_on` timestamp; older ones only give local time in `expiresOn`.
fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken, CredentialError> {
    let response: CliTokenResponse =
        serde_json::from_slice(stdout).map_err(|e| CredentialError::Malformed(format!("az output: {}", e)))?;

    let expires_on = match (response.expires_on_timestamp, response.expires_on.as_deref()) {
        (Some(timestamp), _) => Utc.timestamp_opt(timestamp, 0).single(),
        (None, Some(local)) => NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).single())
            .map(|local| local.with_timezone(&Utc)),
        (None, None) => None,
    }
    .ok_or_else(|| CredentialError::Malformed("az output has no usable expiry".to_owned()))?;

    Ok(AccessToken::new(response.access_token, expires_on))
}

use crate::credential::TokenCredential;
use crate::ServiceError;
use log::debug;
use reqwest::Url;
use std::sync::Arc;

pub const PUBLIC_ENDPOINT_SUFFIX: &str = "vault.azure.net";

/// Client for Key Vault operations - getting a secret by name, by version or by its full identifier.
///
/// # Examples
///
/// ```
/// use azure_services_console::KeyVaultClient;
/// use azure_services_console::credential::DefaultCredential;
/// use std::sync::Arc;
///
/// let credential = Arc::new(DefaultCredential::new(None));
/// let client = KeyVaultClient::new("test-keyvault", credential).unwrap();
/// assert_eq!(client.vault_url().as_str(), "https://test-keyvault.vault.azure.net/");
/// ```
#[derive(Debug, Clone)]
pub struct KeyVaultClient {
    pub(crate) vault_url: Url,
    pub(crate) credential: Arc<dyn TokenCredential>,
    pub(crate) http_client: reqwest::Client,
}

impl KeyVaultClient {
    /// Creates a new `KeyVaultClient` with an endpoint suffix. Useful for non-public Azure clouds.
    /// For the default public environment, use `KeyVaultClient::new`.
    ///
    /// # Examples
    ///
    /// ```
    /// use azure_services_console::KeyVaultClient;
    /// use azure_services_console::credential::DefaultCredential;
    /// use std::sync::Arc;
    ///
    /// let credential = Arc::new(DefaultCredential::new(None));
    /// let client = KeyVaultClient::new_with_endpoint_suffix("test-keyvault", "vault.azure.cn", credential).unwrap();
    /// assert_eq!(client.vault_url().as_str(), "https://test-keyvault.vault.azure.cn/");
    /// ```
    pub fn new_with_endpoint_suffix(
        keyvault_name: &str,
        endpoint_suffix: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, ServiceError> {
        let vault_url = vault_url(keyvault_name, endpoint_suffix)?;
        Ok(Self::with_vault_url(vault_url, credential))
    }

    /// Creates a new `KeyVaultClient` for a vault in the public Azure cloud.
    pub fn new(keyvault_name: &str, credential: Arc<dyn TokenCredential>) -> Result<Self, ServiceError> {
        KeyVaultClient::new_with_endpoint_suffix(keyvault_name, PUBLIC_ENDPOINT_SUFFIX, credential)
    }

    pub fn with_vault_url(vault_url: Url, credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            vault_url,
            credential,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn vault_url(&self) -> &Url {
        &self.vault_url
    }

    pub(crate) async fn get_authed(&self, uri: Url) -> Result<String, ServiceError> {
        get_authed(
            &self.http_client,
            self.credential.as_ref(),
            crate::credential::KEY_VAULT_RESOURCE,
            uri,
        )
        .await
    }
}

/// Vault endpoint for a vault name, e.g. `https://myvault.vault.azure.net/`.
/// A full `http(s)://` URL is taken as the endpoint itself.
///
/// Vault names are 3 to 24 letters, digits or dashes; anything else is rejected so a typed name
/// can never point the bearer token at another host.
pub fn vault_url(keyvault_name: &str, endpoint_suffix: &str) -> Result<Url, ServiceError> {
    let keyvault_name = keyvault_name.trim();
    if keyvault_name.is_empty() {
        return Err(ServiceError::InvalidInput("key vault name is empty".to_owned()));
    }

    let mut url = if keyvault_name.contains("://") {
        let url = Url::parse(keyvault_name)?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(ServiceError::InvalidInput(format!(
                "key vault url must use https, got '{}'",
                url.scheme()
            )));
        }
        url
    } else if is_vault_name(keyvault_name) {
        Url::parse(&format!("https://{}.{}/", keyvault_name, endpoint_suffix))?
    } else {
        return Err(ServiceError::InvalidInput(format!(
            "'{}' is not a key vault name (3-24 letters, digits or dashes); pass the full https:// url instead",
            keyvault_name
        )));
    };
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn is_vault_name(name: &str) -> bool {
    (3..=24).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// GETs `uri` with a bearer token for `resource` and returns the body of a successful response.
pub(crate) async fn get_authed(
    http_client: &reqwest::Client,
    credential: &dyn TokenCredential,
    resource: &str,
    uri: Url,
) -> Result<String, ServiceError> {
    let token = credential.get_token(resource).await?;

    debug!("GET {}", uri);
    let resp = http_client.get(uri).bearer_auth(token.secret()).send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        debug!("Request failed with {}", status);
        return Err(ServiceError::from_response(status, &body));
    }
    Ok(body)
}

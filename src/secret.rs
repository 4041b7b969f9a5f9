use crate::KeyVaultClient;
use crate::ServiceError;
use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use getset::Getters;
use log::debug;
use reqwest::Url;
use serde::Deserialize;
use std::sync::Arc;

const API_VERSION: &str = "7.0";

#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct KeyVaultSecret {
    id: String,
    value: String,
    enabled: bool,
    content_type: Option<String>,
    time_created: DateTime<Utc>,
    time_updated: DateTime<Utc>,
}

impl KeyVaultSecret {
    /// Name segment of the secret identifier (`.../secrets/{name}/{version}`).
    pub fn name(&self) -> Option<&str> {
        let mut segments = self.id.split('/').skip_while(|segment| *segment != "secrets");
        segments.next()?;
        segments.next()
    }
}

#[derive(Deserialize, Debug)]
pub(crate) struct KeyVaultGetSecretResponse {
    value: String,
    id: String,
    #[serde(rename = "contentType", default)]
    content_type: Option<String>,
    attributes: KeyVaultGetSecretResponseAttributes,
}

#[derive(Deserialize, Debug)]
pub(crate) struct KeyVaultGetSecretResponseAttributes {
    enabled: bool,
    #[serde(with = "ts_seconds")]
    created: DateTime<Utc>,
    #[serde(with = "ts_seconds")]
    updated: DateTime<Utc>,
    #[serde(rename = "recoveryLevel", default)]
    recovery_level: Option<String>,
}

impl KeyVaultClient {
    /// Creates a client for the vault that owns `secret_id`, e.g.
    /// `https://myvault.vault.azure.net/secrets/secret`.
    pub fn for_secret_id(secret_id: &Url, credential: Arc<dyn crate::credential::TokenCredential>) -> Result<Self, ServiceError> {
        let vault_url = secret_id.join("/")?;
        Ok(KeyVaultClient::with_vault_url(vault_url, credential))
    }

    /// Gets a secret from the Key Vault.
    /// Note that the latest version is fetched. For a specific version, use `get_secret_with_version`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn demo() -> Result<(), azure_services_console::ServiceError> {
    /// use azure_services_console::KeyVaultClient;
    /// use azure_services_console::credential::DefaultCredential;
    /// use std::sync::Arc;
    ///
    /// let client = KeyVaultClient::new("test-keyvault", Arc::new(DefaultCredential::new(None)))?;
    /// let secret = client.get_secret("Secretname").await?;
    /// println!("{}", secret.value());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_secret(&self, secret_name: &str) -> Result<KeyVaultSecret, ServiceError> {
        Ok(self.get_secret_with_version(secret_name, "").await?)
    }

    /// Gets a secret from the Key Vault with a specific version.
    /// If you need the latest version, use `get_secret`.
    pub async fn get_secret_with_version(
        &self,
        secret_name: &str,
        secret_version_name: &str,
    ) -> Result<KeyVaultSecret, ServiceError> {
        if secret_name.trim().is_empty() {
            return Err(ServiceError::InvalidInput("secret name is empty".to_owned()));
        }
        let path = if secret_version_name.is_empty() {
            format!("secrets/{}", secret_name)
        } else {
            format!("secrets/{}/{}", secret_name, secret_version_name)
        };
        let uri = self.vault_url.join(&path)?;
        self.get_secret_at(uri).await
    }

    /// Gets a secret by its full identifier, `https://{vault}.vault.azure.net/secrets/{name}[/{version}]`.
    pub async fn get_secret_by_id(&self, secret_id: &Url) -> Result<KeyVaultSecret, ServiceError> {
        self.get_secret_at(secret_id.clone()).await
    }

    async fn get_secret_at(&self, mut uri: Url) -> Result<KeyVaultSecret, ServiceError> {
        uri.query_pairs_mut().append_pair("api-version", API_VERSION);
        let resp_body = self.get_authed(uri).await?;
        let response = serde_json::from_str::<KeyVaultGetSecretResponse>(&resp_body)?;
        debug!(
            "Fetched secret {} (recovery level {:?})",
            response.id, response.attributes.recovery_level
        );
        Ok(KeyVaultSecret {
            enabled: response.attributes.enabled,
            value: response.value,
            content_type: response.content_type,
            time_created: response.attributes.created,
            time_updated: response.attributes.updated,
            id: response.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{AccessToken, StaticTokenCredential};
    use crate::ErrorKind;
    use chrono::Duration;
    use mockito::{mock, server_url, Matcher};

    fn client(vault: &str) -> KeyVaultClient {
        let credential = StaticTokenCredential::new(AccessToken::new("kv-token", Utc::now() + Duration::hours(1)));
        let vault_url = Url::parse(&format!("{}/{}/", server_url(), vault)).unwrap();
        KeyVaultClient::with_vault_url(vault_url, Arc::new(credential))
    }

    fn secret_body(vault: &str, name: &str, value: &str) -> String {
        format!(
            r#"{{"value":"{value}","id":"https://{vault}.vault.azure.net/secrets/{name}/4387e9f3d6e14c459867679a90fd0f79",
                "attributes":{{"enabled":true,"created":1493938410,"updated":1493938410,"recoveryLevel":"Recoverable+Purgeable"}}}}"#,
            value = value,
            vault = vault,
            name = name
        )
    }

    #[tokio::test]
    async fn get_secret_returns_the_stored_value() {
        let _m = mock("GET", "/kv-get/secrets/Secretname")
            .match_query(Matcher::UrlEncoded("api-version".into(), API_VERSION.into()))
            .match_header("authorization", "Bearer kv-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(secret_body("kv-get", "Secretname", "mysecretvalue").as_str())
            .create();

        let secret = client("kv-get").get_secret("Secretname").await.unwrap();
        assert_eq!(secret.value(), "mysecretvalue");
        assert!(*secret.enabled());
        assert_eq!(secret.name(), Some("Secretname"));
        assert_eq!(secret.time_created().timestamp(), 1493938410);
    }

    #[tokio::test]
    async fn get_secret_with_version_addresses_the_version() {
        let _m = mock("GET", "/kv-version/secrets/Secretname/4387e9f3d6e14c459867679a90fd0f79")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(secret_body("kv-version", "Secretname", "older").as_str())
            .create();

        let secret = client("kv-version")
            .get_secret_with_version("Secretname", "4387e9f3d6e14c459867679a90fd0f79")
            .await
            .unwrap();
        assert_eq!(secret.value(), "older");
    }

    #[tokio::test]
    async fn get_secret_by_id_uses_the_full_uri() {
        let _m = mock("GET", "/kv-by-id/secrets/secret")
            .match_query(Matcher::UrlEncoded("api-version".into(), API_VERSION.into()))
            .with_status(200)
            .with_body(secret_body("kv-by-id", "secret", "from-uri").as_str())
            .create();

        let secret_id = Url::parse(&format!("{}/kv-by-id/secrets/secret", server_url())).unwrap();
        let credential = StaticTokenCredential::new(AccessToken::new("kv-token", Utc::now() + Duration::hours(1)));
        let client = KeyVaultClient::for_secret_id(&secret_id, Arc::new(credential)).unwrap();
        assert_eq!(client.vault_url().as_str(), format!("{}/", server_url()));

        let secret = client.get_secret_by_id(&secret_id).await.unwrap();
        assert_eq!(secret.value(), "from-uri");
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let _m = mock("GET", "/kv-missing/secrets/Secretname")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":{"code":"SecretNotFound","message":"A secret with (name/id) Secretname was not found in this key vault."}}"#)
            .create();

        let err = client("kv-missing").get_secret("Secretname").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("was not found in this key vault"));
    }

    #[tokio::test]
    async fn undecodable_body_is_unknown() {
        let _m = mock("GET", "/kv-garbage/secrets/Secretname")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>proxy login</html>")
            .create();

        let err = client("kv-garbage").get_secret("Secretname").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn empty_secret_name_is_rejected_without_a_request() {
        let err = client("kv-empty").get_secret("").await.unwrap_err();
        assert_eq!(err.to_string(), "secret name is empty");
    }
}

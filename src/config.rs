use crate::client::PUBLIC_ENDPOINT_SUFFIX;
use crate::credential::{
    CredentialKind, DefaultCredential, InteractiveCredential, ManagedIdentityCredential, TokenCredential,
    DEVELOPER_CLIENT_ID,
};
use crate::resource_group::PUBLIC_MANAGEMENT_ENDPOINT;
use anyhow::{Context, Result};
use clap::{App, Arg, ErrorKind};
use std::{ffi::OsString, sync::Arc};
use url::Url;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_TENANT: &str = "organizations";
pub const DEFAULT_SECRET_NAME: &str = "Secretname";

/// Settings of one run, from the command line and the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub credential_kind: CredentialKind,
    pub authority: Url,
    pub tenant_id: String,
    /// Public client for interactive sign-in, or the user-assigned managed identity.
    pub client_id: Option<String>,
    /// Vault name or URL. Prompted for when missing.
    pub vault: Option<String>,
    pub secret_name: String,
    /// Full secret identifier. Takes precedence over `vault` and `secret_name`.
    pub secret_id: Option<Url>,
    /// Prompted for when missing.
    pub subscription_id: Option<String>,
    pub keyvault_suffix: String,
    pub management_endpoint: Url,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            credential_kind: CredentialKind::Interactive,
            authority: Url::parse(DEFAULT_AUTHORITY).expect("constant url is valid"),
            tenant_id: DEFAULT_TENANT.to_owned(),
            client_id: None,
            vault: None,
            secret_name: DEFAULT_SECRET_NAME.to_owned(),
            secret_id: None,
            subscription_id: None,
            keyvault_suffix: PUBLIC_ENDPOINT_SUFFIX.to_owned(),
            management_endpoint: Url::parse(PUBLIC_MANAGEMENT_ENDPOINT).expect("constant url is valid"),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Config>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = App::new(env!("CARGO_PKG_NAME"))
            .version(env!("CARGO_PKG_VERSION"))
            .about(env!("CARGO_PKG_DESCRIPTION"))
            .arg(
                Arg::with_name("credential")
                    .long("credential")
                    .env("AZURE_CREDENTIAL_KIND")
                    .takes_value(true)
                    .possible_values(CredentialKind::VARIANTS)
                    .default_value("interactive")
                    .help("How to authenticate"),
            )
            .arg(
                Arg::with_name("authority")
                    .long("authority")
                    .takes_value(true)
                    .default_value(DEFAULT_AUTHORITY)
                    .help("Identity service host used for interactive sign-in"),
            )
            .arg(
                Arg::with_name("tenant")
                    .long("tenant")
                    .env("AZURE_TENANT_ID")
                    .takes_value(true)
                    .default_value(DEFAULT_TENANT)
                    .help("Tenant to sign in to"),
            )
            .arg(
                Arg::with_name("client_id")
                    .long("client-id")
                    .takes_value(true)
                    .help("Public client id for interactive sign-in, or a user-assigned managed identity"),
            )
            .arg(
                Arg::with_name("vault")
                    .long("vault")
                    .env("AZURE_KEYVAULT_NAME")
                    .takes_value(true)
                    .help("Key Vault name or URL; prompted for when omitted"),
            )
            .arg(
                Arg::with_name("secret_name")
                    .long("secret-name")
                    .takes_value(true)
                    .default_value(DEFAULT_SECRET_NAME)
                    .help("Name of the secret to fetch"),
            )
            .arg(
                Arg::with_name("secret_id")
                    .long("secret-id")
                    .takes_value(true)
                    .help("Full secret identifier, e.g. https://myvault.vault.azure.net/secrets/secret"),
            )
            .arg(
                Arg::with_name("subscription")
                    .long("subscription")
                    .env("AZURE_SUBSCRIPTION_ID")
                    .takes_value(true)
                    .help("Subscription whose resource groups are listed; prompted for when omitted"),
            )
            .arg(
                Arg::with_name("keyvault_suffix")
                    .long("keyvault-suffix")
                    .takes_value(true)
                    .default_value(PUBLIC_ENDPOINT_SUFFIX)
                    .help("DNS suffix of Key Vault endpoints in the target cloud"),
            )
            .arg(
                Arg::with_name("management_endpoint")
                    .long("management-endpoint")
                    .takes_value(true)
                    .default_value(PUBLIC_MANAGEMENT_ENDPOINT)
                    .help("Azure Resource Manager endpoint in the target cloud"),
            )
            .get_matches_from_safe(args)
            .map_err(|err| {
                let kind = err.kind;
                match kind {
                    ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => err.exit(),
                    _ => err,
                }
            })?;

        let credential_kind = matches
            .value_of("credential")
            .unwrap_or("interactive")
            .parse::<CredentialKind>()
            .map_err(anyhow::Error::msg)?;

        let authority = matches.value_of("authority").unwrap_or(DEFAULT_AUTHORITY);
        let management_endpoint = matches
            .value_of("management_endpoint")
            .unwrap_or(PUBLIC_MANAGEMENT_ENDPOINT);
        let secret_id = matches
            .value_of("secret_id")
            .map(Url::parse)
            .transpose()
            .context("Invalid --secret-id")?;

        Ok(Config {
            credential_kind,
            authority: Url::parse(authority).context("Invalid --authority")?,
            tenant_id: matches.value_of("tenant").unwrap_or(DEFAULT_TENANT).to_owned(),
            client_id: matches.value_of("client_id").map(str::to_owned),
            vault: matches.value_of("vault").map(str::to_owned),
            secret_name: matches
                .value_of("secret_name")
                .unwrap_or(DEFAULT_SECRET_NAME)
                .to_owned(),
            secret_id,
            subscription_id: matches.value_of("subscription").map(str::to_owned),
            keyvault_suffix: matches
                .value_of("keyvault_suffix")
                .unwrap_or(PUBLIC_ENDPOINT_SUFFIX)
                .to_owned(),
            management_endpoint: Url::parse(management_endpoint).context("Invalid --management-endpoint")?,
        })
    }

    /// Builds the credential selected by `credential_kind`.
    pub fn credential(&self) -> Arc<dyn TokenCredential> {
        match self.credential_kind {
            CredentialKind::Interactive => Arc::new(InteractiveCredential::new(
                self.authority.clone(),
                &self.tenant_id,
                self.client_id.as_deref().unwrap_or(DEVELOPER_CLIENT_ID),
            )),
            CredentialKind::Default => Arc::new(DefaultCredential::new(self.client_id.clone())),
            CredentialKind::ManagedIdentity => Arc::new(ManagedIdentityCredential::new(self.client_id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_public_cloud() {
        let config = Config::from_args(vec!["azure-services-console", "--tenant", "organizations"]).unwrap();
        assert_eq!(config.authority.as_str(), "https://login.microsoftonline.com/");
        assert_eq!(config.secret_name, "Secretname");
        assert_eq!(config.keyvault_suffix, "vault.azure.net");
        assert_eq!(config.management_endpoint.as_str(), "https://management.azure.com/");
        assert!(config.secret_id.is_none());
    }

    #[test]
    fn credential_and_targets_are_read() {
        let config = Config::from_args(vec![
            "azure-services-console",
            "--credential",
            "managed-identity",
            "--client-id",
            "user-assigned",
            "--vault",
            "myvault",
            "--subscription",
            "00000000-0000-0000-0000-000000000000",
        ])
        .unwrap();
        assert_eq!(config.credential_kind, CredentialKind::ManagedIdentity);
        assert_eq!(config.client_id.as_deref(), Some("user-assigned"));
        assert_eq!(config.vault.as_deref(), Some("myvault"));
        assert_eq!(
            config.subscription_id.as_deref(),
            Some("00000000-0000-0000-0000-000000000000")
        );
        assert_eq!(config.credential().name(), "ManagedIdentityCredential");
    }

    #[test]
    fn secret_id_must_be_a_url() {
        assert!(Config::from_args(vec!["azure-services-console", "--secret-id", "not a url"]).is_err());

        let config = Config::from_args(vec![
            "azure-services-console",
            "--secret-id",
            "https://myvault.vault.azure.net/secrets/secret",
        ])
        .unwrap();
        assert_eq!(
            config.secret_id.unwrap().as_str(),
            "https://myvault.vault.azure.net/secrets/secret"
        );
    }

    #[test]
    fn unknown_credential_kind_is_rejected() {
        assert!(Config::from_args(vec!["azure-services-console", "--credential", "browser"]).is_err());
    }
}

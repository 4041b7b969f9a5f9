//! The console flow: authenticate, fetch one secret, list resource groups, print who was used.
//!
//! Only authentication failures abort the run. Secret and resource group failures are printed and
//! the flow moves on to the next step.

use crate::credential::{CredentialKind, StaticTokenCredential, TokenCredential, KEY_VAULT_RESOURCE, MANAGEMENT_RESOURCE};
use crate::{Config, KeyVaultClient, ResourceManagementClient, ServiceError};
use anyhow::{Context, Result};
use futures::StreamExt;
use log::{info, warn};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Line-oriented console over any reader/writer pair.
pub struct Console<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Console<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.output, "{}", text)?;
        self.output.flush()
    }

    /// Reads one line without its line ending. End of input reads as an empty line.
    pub fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim_end_matches(&['\r', '\n'][..]).to_owned())
    }

    pub fn prompt(&mut self, message: &str) -> io::Result<String> {
        self.line(message)?;
        self.read_line()
    }

    pub fn into_output(self) -> W {
        self.output
    }
}

/// Runs the whole flow. Returns an error only when no credential could be obtained (or the console
/// itself fails).
pub async fn run<R, W>(config: &Config, credential: Arc<dyn TokenCredential>, console: &mut Console<R, W>) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    authenticate(credential.as_ref()).await?;
    fetch_secret(config, &credential, console).await?;
    list_resource_groups(config, &credential, console).await?;
    summarize(credential.as_ref(), console)?;
    console.read_line()?;
    Ok(())
}

/// Acquires a Key Vault token up front so a missing credential stops the run before any call.
async fn authenticate(credential: &dyn TokenCredential) -> Result<()> {
    credential
        .get_token(KEY_VAULT_RESOURCE)
        .await
        .with_context(|| format!("{} could not authenticate", credential.name()))?;
    info!("Authenticated with {}", credential.name());
    Ok(())
}

async fn fetch_secret<R, W>(config: &Config, credential: &Arc<dyn TokenCredential>, console: &mut Console<R, W>) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let result = match &config.secret_id {
        Some(secret_id) => match KeyVaultClient::for_secret_id(secret_id, credential.clone()) {
            Ok(client) => client.get_secret_by_id(secret_id).await,
            Err(err) => Err(err),
        },
        None => {
            let vault = match &config.vault {
                Some(vault) => vault.clone(),
                None => console.prompt("Please enter the key vault name")?,
            };
            match KeyVaultClient::new_with_endpoint_suffix(&vault, &config.keyvault_suffix, credential.clone()) {
                Ok(client) => client.get_secret(&config.secret_name).await,
                Err(err) => Err(err),
            }
        }
    };

    match result {
        Ok(secret) => console.line(&format!("Secret: {}", secret.value()))?,
        Err(err) => report(console, "secret retrieval", &err)?,
    }
    Ok(())
}

async fn list_resource_groups<R, W>(
    config: &Config,
    credential: &Arc<dyn TokenCredential>,
    console: &mut Console<R, W>,
) -> Result<()>
where
    R: BufRead,
    W: Write,
{
    let subscription_id = match &config.subscription_id {
        Some(subscription_id) => subscription_id.clone(),
        None => {
            console.line("")?;
            console.line("")?;
            console.prompt("Please enter the subscription Id")?
        }
    };

    let client = match management_client(config, credential, &subscription_id).await {
        Ok(client) => client,
        Err(err) => {
            report(console, "resource group listing", &err)?;
            return Ok(());
        }
    };

    let mut groups = client.list_resource_groups();
    while let Some(group) = groups.next().await {
        match group {
            Ok(group) => console.line(&format!("Resource group {}", group.name()))?,
            Err(err) => report(console, "resource group listing", &err)?,
        }
    }
    Ok(())
}

/// The managed identity provider mints a management token first and the client uses it as-is;
/// the other credentials are handed to the client directly.
async fn management_client(
    config: &Config,
    credential: &Arc<dyn TokenCredential>,
    subscription_id: &str,
) -> Result<ResourceManagementClient, ServiceError> {
    let credential: Arc<dyn TokenCredential> = match config.credential_kind {
        CredentialKind::ManagedIdentity => {
            let token = credential.get_token(MANAGEMENT_RESOURCE).await?;
            Arc::new(StaticTokenCredential::new(token))
        }
        CredentialKind::Interactive | CredentialKind::Default => credential.clone(),
    };
    ResourceManagementClient::new_with_endpoint(config.management_endpoint.clone(), subscription_id, credential)
}

fn summarize<R, W>(credential: &dyn TokenCredential, console: &mut Console<R, W>) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    if let Some(principal) = credential.principal_used() {
        console.line("")?;
        console.line(&format!("Principal used:{}", principal))?;
    }
    Ok(())
}

fn report<R, W>(console: &mut Console<R, W>, step: &str, err: &ServiceError) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    warn!("{} failed ({:?}): {}", step, err.kind(), err);
    console.line(&format!("Something went wrong: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_reads_lines_without_endings() {
        let mut console = Console::new(&b"myvault\r\nsub\n"[..], Vec::new());
        assert_eq!(console.prompt("Vault?").unwrap(), "myvault");
        assert_eq!(console.read_line().unwrap(), "sub");
        assert_eq!(console.read_line().unwrap(), "");
        assert_eq!(String::from_utf8(console.into_output()).unwrap(), "Vault?\n");
    }
}

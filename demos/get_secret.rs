use azure_services_console::credential::DefaultCredential;
use azure_services_console::KeyVaultClient;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let keyvault_name = "...";

    let credential = Arc::new(DefaultCredential::new(None));
    let client = KeyVaultClient::new(keyvault_name, credential)?;

    let secret = client.get_secret("Secretname").await?;
    dbg!(&secret.value());

    Ok(())
}

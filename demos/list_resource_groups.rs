use azure_services_console::credential::DefaultCredential;
use azure_services_console::ResourceManagementClient;
use futures::StreamExt;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscription_id = "...";

    let credential = Arc::new(DefaultCredential::new(None));
    let client = ResourceManagementClient::new(subscription_id, credential)?;

    let mut groups = client.list_resource_groups();
    while let Some(group) = groups.next().await {
        dbg!(group?.name());
    }

    Ok(())
}

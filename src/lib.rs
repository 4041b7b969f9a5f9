//! Sign in to Azure, read a Key Vault secret and list the resource groups of a subscription.
//!
//! The credential strategy (interactive sign-in, ambient chain or managed identity) is picked at
//! runtime; the Key Vault and Resource Manager clients only depend on [`credential::TokenCredential`].

mod client;
mod error;
mod resource_group;
mod secret;

pub mod app;
pub mod config;
pub mod credential;

pub use client::{vault_url, KeyVaultClient, PUBLIC_ENDPOINT_SUFFIX};
pub use config::Config;
pub use error::{CredentialError, ErrorKind, ServiceError};
pub use resource_group::{ResourceGroup, ResourceGroupPage, ResourceManagementClient, PUBLIC_MANAGEMENT_ENDPOINT};
pub use secret::KeyVaultSecret;

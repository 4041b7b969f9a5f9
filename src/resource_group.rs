use crate::client::get_authed;
use crate::credential::{TokenCredential, MANAGEMENT_RESOURCE};
use crate::ServiceError;
use futures::stream::{self, LocalBoxStream, StreamExt};
use getset::Getters;
use log::debug;
use reqwest::Url;
use serde::Deserialize;
use std::{collections::HashMap, collections::VecDeque, sync::Arc};

const API_VERSION: &str = "2021-04-01";

pub const PUBLIC_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com/";

#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct ResourceGroup {
    id: String,
    name: String,
    location: String,
    provisioning_state: Option<String>,
    tags: HashMap<String, String>,
}

#[derive(Deserialize, Debug)]
struct ResourceGroupRaw {
    id: String,
    name: String,
    location: String,
    #[serde(default)]
    properties: Option<ResourceGroupProperties>,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Debug)]
struct ResourceGroupProperties {
    #[serde(rename = "provisioningState", default)]
    provisioning_state: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResourceGroupListResponse {
    #[serde(default)]
    value: Vec<ResourceGroupRaw>,
    #[serde(rename = "nextLink", default)]
    next_link: Option<String>,
}

impl From<ResourceGroupRaw> for ResourceGroup {
    fn from(raw: ResourceGroupRaw) -> Self {
        ResourceGroup {
            id: raw.id,
            name: raw.name,
            location: raw.location,
            provisioning_state: raw.properties.and_then(|p| p.provisioning_state),
            tags: raw.tags.unwrap_or_default(),
        }
    }
}

/// One page of a resource group listing.
#[derive(Debug)]
pub struct ResourceGroupPage {
    pub groups: Vec<ResourceGroup>,
    pub next_link: Option<Url>,
}

struct Cursor {
    pending: VecDeque<ResourceGroup>,
    next_page: Option<Url>,
}

/// Client for Azure Resource Manager calls scoped to one subscription.
#[derive(Debug, Clone)]
pub struct ResourceManagementClient {
    subscription_id: String,
    list_url: Url,
    credential: Arc<dyn TokenCredential>,
    http_client: reqwest::Client,
}

impl ResourceManagementClient {
    pub fn new(subscription_id: &str, credential: Arc<dyn TokenCredential>) -> Result<Self, ServiceError> {
        let endpoint = Url::parse(PUBLIC_MANAGEMENT_ENDPOINT)?;
        Self::new_with_endpoint(endpoint, subscription_id, credential)
    }

    /// Creates a client against a specific Resource Manager endpoint. Useful for non-public Azure clouds.
    pub fn new_with_endpoint(
        endpoint: Url,
        subscription_id: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, ServiceError> {
        let subscription_id = subscription_id.trim();
        if subscription_id.is_empty() {
            return Err(ServiceError::InvalidInput("subscription id is empty".to_owned()));
        }
        // Joined into the request path, so only GUID characters are allowed.
        if !subscription_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ServiceError::InvalidInput(format!(
                "'{}' is not a subscription id",
                subscription_id
            )));
        }

        let mut list_url = endpoint.join(&format!("subscriptions/{}/resourcegroups", subscription_id))?;
        list_url.query_pairs_mut().append_pair("api-version", API_VERSION);

        Ok(Self {
            subscription_id: subscription_id.to_owned(),
            list_url,
            credential,
            http_client: reqwest::Client::new(),
        })
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Fetches a single page. Pass `None` for the first page, then each page's `next_link`.
    pub async fn list_resource_groups_page(&self, page: Option<Url>) -> Result<ResourceGroupPage, ServiceError> {
        let uri = page.unwrap_or_else(|| self.list_url.clone());
        let body = get_authed(&self.http_client, self.credential.as_ref(), MANAGEMENT_RESOURCE, uri).await?;
        let response = serde_json::from_str::<ResourceGroupListResponse>(&body)?;
        let next_link = response
            .next_link
            .filter(|link| !link.is_empty())
            .map(|link| Url::parse(&link))
            .transpose()?;

        debug!(
            "Received {} resource groups, more pages: {}",
            response.value.len(),
            next_link.is_some()
        );
        Ok(ResourceGroupPage {
            groups: response.value.into_iter().map(ResourceGroup::from).collect(),
            next_link,
        })
    }

    /// Lists every resource group of the subscription, one at a time.
    ///
    /// Pages are fetched lazily as the stream is polled. An error ends the stream after being yielded.
    pub fn list_resource_groups(&self) -> LocalBoxStream<'_, Result<ResourceGroup, ServiceError>> {
        let cursor = Cursor {
            pending: VecDeque::new(),
            next_page: Some(self.list_url.clone()),
        };

        stream::unfold(Some(cursor), move |cursor| async move {
            let mut cursor = cursor?;
            loop {
                if let Some(group) = cursor.pending.pop_front() {
                    return Some((Ok(group), Some(cursor)));
                }
                let page = cursor.next_page.take()?;
                match self.list_resource_groups_page(Some(page)).await {
                    Ok(page) => {
                        cursor.pending.extend(page.groups);
                        cursor.next_page = page.next_link;
                    }
                    Err(err) => return Some((Err(err), None)),
                }
            }
        })
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{AccessToken, StaticTokenCredential};
    use crate::ErrorKind;
    use chrono::{Duration, Utc};
    use futures::TryStreamExt;
    use mockito::{mock, server_url, Matcher};

    fn client(subscription: &str) -> ResourceManagementClient {
        let credential = StaticTokenCredential::new(AccessToken::new("mgmt-token", Utc::now() + Duration::hours(1)));
        let endpoint = Url::parse(&server_url()).unwrap();
        ResourceManagementClient::new_with_endpoint(endpoint, subscription, Arc::new(credential)).unwrap()
    }

    fn group(subscription: &str, name: &str) -> String {
        format!(
            r#"{{"id":"/subscriptions/{sub}/resourceGroups/{name}","name":"{name}","type":"Microsoft.Resources/resourceGroups",
                "location":"westeurope","tags":{{"env":"dev"}},"properties":{{"provisioningState":"Succeeded"}}}}"#,
            sub = subscription,
            name = name
        )
    }

    #[test]
    fn empty_subscription_is_rejected() {
        let credential = StaticTokenCredential::new(AccessToken::new("t", Utc::now()));
        let err = ResourceManagementClient::new(" ", Arc::new(credential)).unwrap_err();
        assert_eq!(err.to_string(), "subscription id is empty");
    }

    #[test]
    fn subscription_ids_cannot_rewrite_the_request_path() {
        for subscription in &["../../providers?x=", "sub/../other", "sub#frag", "sub%2F.."] {
            let credential = StaticTokenCredential::new(AccessToken::new("t", Utc::now()));
            match ResourceManagementClient::new(subscription, Arc::new(credential)) {
                Err(ServiceError::InvalidInput(message)) => assert!(message.contains("is not a subscription id")),
                other => panic!("'{}' was accepted: {:?}", subscription, other.map(|c| c.list_url)),
            }
        }

        let credential = StaticTokenCredential::new(AccessToken::new("t", Utc::now()));
        let client =
            ResourceManagementClient::new("00000000-1111-2222-3333-444444444444", Arc::new(credential)).unwrap();
        assert_eq!(
            client.list_url.as_str(),
            "https://management.azure.com/subscriptions/00000000-1111-2222-3333-444444444444/resourcegroups?api-version=2021-04-01"
        );
    }

    #[tokio::test]
    async fn pages_are_followed_in_order() {
        let first = format!(
            r#"{{"value":[{}],"nextLink":"{}/subscriptions/sub-pages/resourcegroups?api-version=2021-04-01&%24skiptoken=page2"}}"#,
            group("sub-pages", "rg-a"),
            server_url()
        );
        let second = format!(r#"{{"value":[{}]}}"#, group("sub-pages", "rg-b"));

        let _first = mock("GET", "/subscriptions/sub-pages/resourcegroups")
            .match_query(Matcher::Regex("^api-version=2021-04-01$".to_owned()))
            .match_header("authorization", "Bearer mgmt-token")
            .with_status(200)
            .with_body(first.as_str())
            .expect(1)
            .create();
        let _second = mock("GET", "/subscriptions/sub-pages/resourcegroups")
            .match_query(Matcher::UrlEncoded("$skiptoken".into(), "page2".into()))
            .with_status(200)
            .with_body(second.as_str())
            .expect(1)
            .create();

        let client = client("sub-pages");
        let groups: Vec<ResourceGroup> = client.list_resource_groups().try_collect().await.unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name().as_str()).collect();
        assert_eq!(names, vec!["rg-a", "rg-b"]);
        assert_eq!(groups[0].location(), "westeurope");
        assert_eq!(groups[0].provisioning_state().as_deref(), Some("Succeeded"));
        assert_eq!(groups[1].tags().get("env").map(String::as_str), Some("dev"));
        _first.assert();
        _second.assert();
    }

    #[tokio::test]
    async fn empty_listing_yields_nothing() {
        let _m = mock("GET", "/subscriptions/sub-empty/resourcegroups")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"value":[]}"#)
            .create();

        let groups: Vec<ResourceGroup> = client("sub-empty").list_resource_groups().try_collect().await.unwrap();
        assert!(groups.is_empty());
    }

    #[tokio::test]
    async fn failure_is_yielded_once_and_ends_the_stream() {
        let _m = mock("GET", "/subscriptions/sub-denied/resourcegroups")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"code":"AuthorizationFailed","message":"The client does not have authorization to perform action."}}"#)
            .create();

        let client = client("sub-denied");
        let items: Vec<Result<ResourceGroup, ServiceError>> = client.list_resource_groups().collect().await;
        assert_eq!(items.len(), 1);
        let err = items.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(err.to_string().contains("AuthorizationFailed"));
    }

    #[tokio::test]
    async fn single_page_can_be_fetched_directly() {
        let body = format!(r#"{{"value":[{}],"nextLink":""}}"#, group("sub-single", "rg-only"));
        let _m = mock("GET", "/subscriptions/sub-single/resourcegroups")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body.as_str())
            .create();

        let page = client("sub-single").list_resource_groups_page(None).await.unwrap();
        assert_eq!(page.groups.len(), 1);
        assert!(page.next_link.is_none());
    }
}

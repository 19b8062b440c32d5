//! Reqwest-backed [`DropletApi`] implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::CloudError;

use super::api::{
    CreateDropletRequest, DoLoadBalancer, DoSshKey, DoTag, Droplet, DropletApi,
    LoadBalancerRequest,
};

const BASE_URL: &str = "https://api.digitalocean.com/v2";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct DoClient {
    http: Client,
    token: String,
    base_url: String,
}

#[derive(Deserialize)]
struct SshKeyEnvelope {
    ssh_key: DoSshKey,
}

#[derive(Deserialize)]
struct TagEnvelope {
    tag: DoTag,
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct DropletsEnvelope {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Deserialize)]
struct LoadBalancersEnvelope {
    #[serde(default)]
    load_balancers: Vec<DoLoadBalancer>,
}

#[derive(Deserialize)]
struct LoadBalancerEnvelope {
    load_balancer: DoLoadBalancer,
}

impl DoClient {
    pub fn new(token: impl Into<String>) -> Result<DoClient, CloudError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(DoClient {
            http,
            token: token.into(),
            base_url: BASE_URL.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        Err(api_error(status, response).await)
    }

    /// GET where a 404 means "does not exist" rather than failure.
    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, CloudError> {
        tracing::debug!(path, "GET");
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(self.check(response).await?))
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, CloudError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        tracing::debug!(path, "POST");
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        self.check(response).await
    }

    async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, CloudError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        tracing::debug!(path, "PUT");
        let response = self
            .http
            .put(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        self.check(response).await
    }

    /// DELETE treating 404 as success.
    async fn delete(&self, path: &str) -> Result<(), CloudError> {
        tracing::debug!(path, "DELETE");
        let response = self
            .http
            .delete(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(api_error(status, response).await)
    }
}

async fn api_error(status: StatusCode, response: Response) -> CloudError {
    let message = response.text().await.unwrap_or_default();
    CloudError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl DropletApi for DoClient {
    async fn get_ssh_key(&self, fingerprint: &str) -> Result<Option<DoSshKey>, CloudError> {
        Ok(self
            .get_optional::<SshKeyEnvelope>(&format!("/account/keys/{fingerprint}"))
            .await?
            .map(|e| e.ssh_key))
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<DoSshKey, CloudError> {
        let envelope: SshKeyEnvelope = self
            .post(
                "/account/keys",
                &json!({ "name": name, "public_key": public_key }),
            )
            .await?;
        Ok(envelope.ssh_key)
    }

    async fn delete_ssh_key(&self, fingerprint: &str) -> Result<(), CloudError> {
        self.delete(&format!("/account/keys/{fingerprint}")).await
    }

    async fn get_tag(&self, name: &str) -> Result<Option<DoTag>, CloudError> {
        Ok(self
            .get_optional::<TagEnvelope>(&format!("/tags/{name}"))
            .await?
            .map(|e| e.tag))
    }

    async fn create_tag(&self, name: &str) -> Result<DoTag, CloudError> {
        let envelope: TagEnvelope = self.post("/tags", &json!({ "name": name })).await?;
        Ok(envelope.tag)
    }

    async fn get_droplet(&self, id: i64) -> Result<Option<Droplet>, CloudError> {
        Ok(self
            .get_optional::<DropletEnvelope>(&format!("/droplets/{id}"))
            .await?
            .map(|e| e.droplet))
    }

    async fn find_droplet(&self, name: &str) -> Result<Option<Droplet>, CloudError> {
        // The droplet list endpoint has no name filter; page through and
        // match client-side.
        let mut page = 1;
        loop {
            let listing: Option<DropletsEnvelope> = self
                .get_optional(&format!("/droplets?page={page}&per_page=200"))
                .await?;
            let droplets = listing.map(|l| l.droplets).unwrap_or_default();
            if droplets.is_empty() {
                return Ok(None);
            }
            if let Some(d) = droplets.into_iter().find(|d| d.name == name) {
                return Ok(Some(d));
            }
            page += 1;
        }
    }

    async fn create_droplet(&self, req: &CreateDropletRequest) -> Result<Droplet, CloudError> {
        let envelope: DropletEnvelope = self.post("/droplets", req).await?;
        Ok(envelope.droplet)
    }

    async fn delete_droplet(&self, id: i64) -> Result<(), CloudError> {
        self.delete(&format!("/droplets/{id}")).await
    }

    async fn list_droplets_by_tag(&self, tag: &str) -> Result<Vec<Droplet>, CloudError> {
        let listing: Option<DropletsEnvelope> = self
            .get_optional(&format!("/droplets?tag_name={tag}&per_page=200"))
            .await?;
        Ok(listing.map(|l| l.droplets).unwrap_or_default())
    }

    async fn delete_droplets_by_tag(&self, tag: &str) -> Result<(), CloudError> {
        self.delete(&format!("/droplets?tag_name={tag}")).await
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<DoLoadBalancer>, CloudError> {
        let listing: Option<LoadBalancersEnvelope> =
            self.get_optional("/load_balancers?per_page=200").await?;
        Ok(listing
            .map(|l| l.load_balancers)
            .unwrap_or_default()
            .into_iter()
            .find(|lb| lb.name == name))
    }

    async fn create_load_balancer(
        &self,
        req: &LoadBalancerRequest,
    ) -> Result<DoLoadBalancer, CloudError> {
        let envelope: LoadBalancerEnvelope = self.post("/load_balancers", req).await?;
        Ok(envelope.load_balancer)
    }

    async fn update_load_balancer(
        &self,
        id: &str,
        req: &LoadBalancerRequest,
    ) -> Result<DoLoadBalancer, CloudError> {
        let envelope: LoadBalancerEnvelope =
            self.put(&format!("/load_balancers/{id}"), req).await?;
        Ok(envelope.load_balancer)
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<(), CloudError> {
        self.delete(&format!("/load_balancers/{id}")).await
    }
}

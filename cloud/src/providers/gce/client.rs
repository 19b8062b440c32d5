//! Reqwest-backed [`ComputeApi`] implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::CloudError;

use super::api::{
    ComputeApi, GceAddress, GceDisk, GceFirewall, GceForwardingRule, GceHealthCheck,
    GceInstance, GceNetwork, GceOperation, GceRoute, GceTargetPool, MetadataItem, OpScope,
};

const BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct GceClient {
    http: Client,
    access_token: String,
    base_url: String,
    project: String,
    region: String,
    zone: String,
}

#[derive(Deserialize)]
struct ListEnvelope<T> {
    #[serde(default)]
    items: Vec<T>,
}

impl GceClient {
    pub fn new(
        access_token: impl Into<String>,
        project: impl Into<String>,
        region: impl Into<String>,
        zone: impl Into<String>,
    ) -> Result<GceClient, CloudError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(GceClient {
            http,
            access_token: access_token.into(),
            base_url: BASE_URL.to_string(),
            project: project.into(),
            region: region.into(),
            zone: zone.into(),
        })
    }

    fn global(&self, collection: &str) -> String {
        format!("{}/projects/{}/global/{collection}", self.base_url, self.project)
    }

    fn regional(&self, collection: &str) -> String {
        format!(
            "{}/projects/{}/regions/{}/{collection}",
            self.base_url, self.project, self.region
        )
    }

    fn zonal(&self, collection: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/{collection}",
            self.base_url, self.project, self.zone
        )
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = response.text().await.unwrap_or_default();
        Err(CloudError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, CloudError> {
        tracing::debug!(url, "GET");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(self.check(response).await?))
    }

    async fn list<T: serde::de::DeserializeOwned + Default>(
        &self,
        url: &str,
    ) -> Result<Vec<T>, CloudError> {
        tracing::debug!(url, "GET (list)");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let envelope: ListEnvelope<T> = self.check(response).await?;
        Ok(envelope.items)
    }

    async fn post<B: serde::Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<GceOperation, CloudError> {
        tracing::debug!(url, "POST");
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        self.check(response).await
    }

    async fn delete(&self, url: &str) -> Result<GceOperation, CloudError> {
        tracing::debug!(url, "DELETE");
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            // Treated as an already-done operation by delete pollers.
            return Ok(GceOperation {
                name: String::new(),
                status: "DONE".to_string(),
                error: None,
            });
        }
        self.check(response).await
    }
}

#[async_trait]
impl ComputeApi for GceClient {
    async fn get_operation(
        &self,
        scope: OpScope,
        name: &str,
    ) -> Result<GceOperation, CloudError> {
        let url = match scope {
            OpScope::Global => format!("{}/{}", self.global("operations"), name),
            OpScope::Region => format!("{}/{}", self.regional("operations"), name),
            OpScope::Zone => format!("{}/{}", self.zonal("operations"), name),
        };
        self.get_optional(&url)
            .await?
            .ok_or_else(|| CloudError::not_found("operation", name))
    }

    async fn get_network(&self, name: &str) -> Result<Option<GceNetwork>, CloudError> {
        self.get_optional(&format!("{}/{}", self.global("networks"), name))
            .await
    }

    async fn insert_network(&self, network: &GceNetwork) -> Result<GceOperation, CloudError> {
        self.post(&self.global("networks"), network).await
    }

    async fn get_firewall(&self, name: &str) -> Result<Option<GceFirewall>, CloudError> {
        self.get_optional(&format!("{}/{}", self.global("firewalls"), name))
            .await
    }

    async fn insert_firewall(&self, firewall: &GceFirewall) -> Result<GceOperation, CloudError> {
        self.post(&self.global("firewalls"), firewall).await
    }

    async fn delete_firewall(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.global("firewalls"), name))
            .await
    }

    async fn list_firewalls(&self) -> Result<Vec<GceFirewall>, CloudError> {
        self.list(&self.global("firewalls")).await
    }

    async fn get_address(&self, name: &str) -> Result<Option<GceAddress>, CloudError> {
        self.get_optional(&format!("{}/{}", self.regional("addresses"), name))
            .await
    }

    async fn insert_address(&self, address: &GceAddress) -> Result<GceOperation, CloudError> {
        self.post(&self.regional("addresses"), address).await
    }

    async fn delete_address(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.regional("addresses"), name))
            .await
    }

    async fn get_disk(&self, name: &str) -> Result<Option<GceDisk>, CloudError> {
        self.get_optional(&format!("{}/{}", self.zonal("disks"), name))
            .await
    }

    async fn insert_disk(&self, disk: &GceDisk) -> Result<GceOperation, CloudError> {
        self.post(&self.zonal("disks"), disk).await
    }

    async fn delete_disk(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.zonal("disks"), name))
            .await
    }

    async fn list_disks(&self) -> Result<Vec<GceDisk>, CloudError> {
        self.list(&self.zonal("disks")).await
    }

    async fn get_instance(&self, name: &str) -> Result<Option<GceInstance>, CloudError> {
        self.get_optional(&format!("{}/{}", self.zonal("instances"), name))
            .await
    }

    async fn insert_instance(&self, instance: &GceInstance) -> Result<GceOperation, CloudError> {
        self.post(&self.zonal("instances"), instance).await
    }

    async fn delete_instance(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.zonal("instances"), name))
            .await
    }

    async fn list_instances(&self) -> Result<Vec<GceInstance>, CloudError> {
        self.list(&self.zonal("instances")).await
    }

    async fn get_health_check(&self, name: &str) -> Result<Option<GceHealthCheck>, CloudError> {
        self.get_optional(&format!("{}/{}", self.global("httpHealthChecks"), name))
            .await
    }

    async fn insert_health_check(
        &self,
        check: &GceHealthCheck,
    ) -> Result<GceOperation, CloudError> {
        self.post(&self.global("httpHealthChecks"), check).await
    }

    async fn delete_health_check(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.global("httpHealthChecks"), name))
            .await
    }

    async fn get_target_pool(&self, name: &str) -> Result<Option<GceTargetPool>, CloudError> {
        self.get_optional(&format!("{}/{}", self.regional("targetPools"), name))
            .await
    }

    async fn insert_target_pool(&self, pool: &GceTargetPool) -> Result<GceOperation, CloudError> {
        self.post(&self.regional("targetPools"), pool).await
    }

    async fn delete_target_pool(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.regional("targetPools"), name))
            .await
    }

    async fn get_forwarding_rule(
        &self,
        name: &str,
    ) -> Result<Option<GceForwardingRule>, CloudError> {
        self.get_optional(&format!("{}/{}", self.regional("forwardingRules"), name))
            .await
    }

    async fn insert_forwarding_rule(
        &self,
        rule: &GceForwardingRule,
    ) -> Result<GceOperation, CloudError> {
        self.post(&self.regional("forwardingRules"), rule).await
    }

    async fn delete_forwarding_rule(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.regional("forwardingRules"), name))
            .await
    }

    async fn list_routes(&self) -> Result<Vec<GceRoute>, CloudError> {
        self.list(&self.global("routes")).await
    }

    async fn delete_route(&self, name: &str) -> Result<GceOperation, CloudError> {
        self.delete(&format!("{}/{}", self.global("routes"), name))
            .await
    }

    async fn set_common_instance_metadata(
        &self,
        item: &MetadataItem,
    ) -> Result<GceOperation, CloudError> {
        let url = format!(
            "{}/projects/{}/setCommonInstanceMetadata",
            self.base_url, self.project
        );
        self.post(
            &url,
            &serde_json::json!({ "items": [ { "key": item.key, "value": item.value } ] }),
        )
        .await
    }
}

//! Runtime API client
//!
//! [`RemoteRuntime`] speaks the REST API served by
//! [`RuntimeRouter`](super::RuntimeRouter) and implements [`Runtime`] on top
//! of it.

use super::server::{ApiErrorResponse, ExpandRequest};
use crate::crd::{ResourceKind, ResourceList};
use crate::domain::ports::{
    ClassInfo, ClassStatus, EventFilter, ListFilter, PoolTarget, Runtime, RuntimeEvent, RuntimeObject,
};
use crate::error::{Error, Result};
use crate::store::format_selector;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};

/// Client for a runtime served over HTTP
#[derive(Debug, Clone)]
pub struct RemoteRuntime {
    base_url: String,
    kind: ResourceKind,
    client: reqwest::Client,
}

impl RemoteRuntime {
    pub fn new(base_url: &str, kind: ResourceKind, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            kind,
            client,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/v1/{}", self.base_url, self.kind.plural())
    }

    fn item_url(&self, id: &str) -> String {
        format!("{}/{}", self.collection_url(), urlencoding::encode(id))
    }

    /// Map a non-success response to an error; 404 on an item is `ResourceNotFound`
    async fn check(&self, response: reqwest::Response, id: Option<&str>) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await?;
        let message = serde_json::from_str::<ApiErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        debug!(status = status.as_u16(), message = %message, "Runtime request failed");

        match id {
            Some(id) if status == reqwest::StatusCode::NOT_FOUND => {
                Err(Error::not_found(self.kind.to_string(), id))
            }
            _ => Err(Error::RuntimeApi {
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn parse<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.check(response, None).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Runtime for RemoteRuntime {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[instrument(skip_all, fields(kind = %self.kind, class = %object.spec.class))]
    async fn create(&self, object: RuntimeObject) -> Result<RuntimeObject> {
        let response = self.client.post(self.collection_url()).json(&object).send().await?;
        self.parse(response).await
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeObject>> {
        let mut query = Vec::new();
        if let Some(id) = &filter.id {
            query.push(("id", id.clone()));
        }
        if !filter.label_selector.is_empty() {
            query.push(("labelSelector", format_selector(&filter.label_selector)));
        }
        let response = self.client.get(self.collection_url()).query(&query).send().await?;
        self.parse(response).await
    }

    #[instrument(skip(self), fields(kind = %self.kind))]
    async fn delete(&self, id: &str) -> Result<()> {
        let response = self.client.delete(self.item_url(id)).send().await?;
        self.check(response, Some(id)).await?;
        Ok(())
    }

    #[instrument(skip(self, resources), fields(kind = %self.kind))]
    async fn update_resources(&self, id: &str, resources: ResourceList) -> Result<()> {
        let response = self
            .client
            .patch(self.item_url(id))
            .json(&ExpandRequest { resources })
            .send()
            .await?;
        self.check(response, Some(id)).await?;
        Ok(())
    }

    async fn status(&self, target: &PoolTarget) -> Result<Vec<ClassStatus>> {
        let mut query = Vec::new();
        if !target.names.is_empty() {
            query.push(("pool", target.names.join(",")));
        }
        if !target.selector.is_empty() {
            query.push(("selector", format_selector(&target.selector)));
        }
        let response = self
            .client
            .get(format!("{}/v1/status", self.base_url))
            .query(&query)
            .send()
            .await?;
        self.parse(response).await
    }

    async fn list_classes(&self) -> Result<Vec<ClassInfo>> {
        let response = self.client.get(format!("{}/v1/classes", self.base_url)).send().await?;
        self.parse(response).await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<RuntimeEvent>> {
        let mut query = Vec::new();
        if !filter.label_selector.is_empty() {
            query.push(("labelSelector", format_selector(&filter.label_selector)));
        }
        if let Some(from) = filter.from {
            query.push(("from", from.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
        }
        if let Some(to) = filter.to {
            query.push(("to", to.to_rfc3339_opts(SecondsFormat::AutoSi, true)));
        }
        let response = self
            .client
            .get(format!("{}/v1/events", self.base_url))
            .query(&query)
            .send()
            .await?;
        self.parse(response).await
    }
}

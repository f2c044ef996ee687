use std::sync::Arc;

use serde::Deserialize;

use super::client::{UpstreamClient, UpstreamError};
use super::{ExplainRequest, Explainer, ValidateRequest, ValidationPayload, Validator};

#[derive(Deserialize)]
struct MessageBody<T> {
    message: T,
}

/// An explainer reached through the backend's `POST {path}` endpoint.
pub struct BackendExplainer {
    client: Arc<UpstreamClient>,
    name: String,
    url: String,
}

impl BackendExplainer {
    pub fn new(client: Arc<UpstreamClient>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Explainer for BackendExplainer {
    async fn explain(&self, req: &ExplainRequest) -> Result<String, UpstreamError> {
        let call = format!("explainer.{}", self.name);
        let body: MessageBody<String> = self.client.post_json(&call, &self.url, req).await?;
        Ok(body.message)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct BackendValidator {
    client: Arc<UpstreamClient>,
    url: String,
}

impl BackendValidator {
    pub fn new(client: Arc<UpstreamClient>, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Validator for BackendValidator {
    async fn validate(&self, req: &ValidateRequest) -> Result<ValidationPayload, UpstreamError> {
        let body: MessageBody<ValidationPayload> = self
            .client
            .post_json("validator.contextual", &self.url, req)
            .await?;
        Ok(body.message)
    }
}

pub mod backend;
pub mod client;
pub mod geocoder;
pub mod imagery;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use backend::{BackendExplainer, BackendValidator};
pub use client::{UpstreamClient, UpstreamError, UpstreamOptions};
pub use geocoder::{Address, NominatimClient, ReverseGeocode};
pub use imagery::{ImagePosition, MapillaryClient};

/// Body sent to both explainer backends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExplainRequest {
    #[serde(rename = "imageId")]
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Body sent to the validator backend. Field names are fixed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidateRequest {
    pub image_id: String,
    pub gemini_output: String,
    pub llama_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Validator output. Structured payloads are passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationPayload {
    Text(String),
    Structured(serde_json::Value),
}

impl ValidationPayload {
    /// User-facing rendering: text verbatim, anything else as a formatted JSON dump.
    pub fn render(&self) -> String {
        match self {
            ValidationPayload::Text(text) => text.clone(),
            ValidationPayload::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("no image id to locate")]
    MissingImageId,

    #[error("imagery provider access token is not configured")]
    MissingAccessToken,

    #[error("image has no computed geometry")]
    MissingGeometry,

    #[error("invalid provider url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[async_trait::async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(&self, req: &ExplainRequest) -> Result<String, UpstreamError>;
    fn name(&self) -> &str;
}

#[async_trait::async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, req: &ValidateRequest) -> Result<ValidationPayload, UpstreamError>;
}

#[async_trait::async_trait]
pub trait ImageryProvider: Send + Sync {
    async fn locate(&self, image_id: &str) -> Result<ImagePosition, EnrichmentError>;
}

#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse(&self, point: GeoPoint) -> Result<ReverseGeocode, EnrichmentError>;
}

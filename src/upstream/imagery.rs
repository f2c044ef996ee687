use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::client::UpstreamClient;
use super::{EnrichmentError, GeoPoint, ImageryProvider};

const IMAGE_FIELDS: &str = "computed_geometry,computed_compass_angle";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImagePosition {
    pub point: GeoPoint,
    pub compass_angle: Option<f64>,
}

#[derive(Deserialize)]
struct ImageFields {
    computed_geometry: Option<Geometry>,
    computed_compass_angle: Option<f64>,
}

#[derive(Deserialize)]
struct Geometry {
    /// GeoJSON order: `[longitude, latitude]`.
    coordinates: Vec<f64>,
}

/// Mapillary Graph API image lookup.
pub struct MapillaryClient {
    client: Arc<UpstreamClient>,
    base_url: String,
    access_token: Option<String>,
}

impl MapillaryClient {
    pub fn new(
        client: Arc<UpstreamClient>,
        base_url: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            access_token,
        }
    }

    fn image_url(&self, image_id: &str) -> Result<Url, EnrichmentError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| EnrichmentError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| EnrichmentError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(image_id);
        Ok(url)
    }
}

#[async_trait::async_trait]
impl ImageryProvider for MapillaryClient {
    async fn locate(&self, image_id: &str) -> Result<ImagePosition, EnrichmentError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or(EnrichmentError::MissingAccessToken)?;
        let url = self.image_url(image_id)?;

        let fields: ImageFields = self
            .client
            .get_json(
                "imagery.mapillary",
                url.as_str(),
                &[("fields", IMAGE_FIELDS), ("access_token", token)],
            )
            .await?;

        let point = match fields.computed_geometry.as_ref().map(|g| g.coordinates.as_slice()) {
            Some([longitude, latitude, ..]) => GeoPoint {
                latitude: *latitude,
                longitude: *longitude,
            },
            _ => return Err(EnrichmentError::MissingGeometry),
        };

        Ok(ImagePosition {
            point,
            compass_angle: fields.computed_compass_angle,
        })
    }
}

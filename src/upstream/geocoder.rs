use std::sync::Arc;

use serde::Deserialize;

use super::client::UpstreamClient;
use super::{EnrichmentError, GeoPoint, Geocoder};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Address {
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub municipality: Option<String>,
    pub suburb: Option<String>,
    pub state: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

/// The subset of a Nominatim `/reverse` response the location descriptor uses.
/// Nominatim answers an ungeocodable point with `200 {"error": ...}`, which
/// lands here with both fields empty.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReverseGeocode {
    pub display_name: Option<String>,
    pub address: Option<Address>,
}

pub struct NominatimClient {
    client: Arc<UpstreamClient>,
    base_url: String,
}

impl NominatimClient {
    /// `client` must be built with an identifying user agent; Nominatim rejects anonymous traffic.
    pub fn new(client: Arc<UpstreamClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Geocoder for NominatimClient {
    async fn reverse(&self, point: GeoPoint) -> Result<ReverseGeocode, EnrichmentError> {
        let url = format!("{}/reverse", self.base_url.trim_end_matches('/'));
        let lat = point.latitude.to_string();
        let lon = point.longitude.to_string();

        let geocode = self
            .client
            .get_json(
                "geocoder.nominatim",
                &url,
                &[
                    ("format", "json"),
                    ("lat", lat.as_str()),
                    ("lon", lon.as_str()),
                    ("zoom", "14"),
                    ("addressdetails", "1"),
                ],
            )
            .await?;

        Ok(geocode)
    }
}

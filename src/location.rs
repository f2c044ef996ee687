use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::session::{LocationTicket, Session};
use crate::telemetry::metrics::LOCATION_RESOLUTIONS;
use crate::upstream::{EnrichmentError, GeoPoint, Geocoder, ImageryProvider, ReverseGeocode};

pub const LOCATION_UNAVAILABLE: &str = "Location unavailable";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "descriptor", rename_all = "snake_case")]
pub enum LocationStatus {
    Pending,
    Resolved(String),
    Unavailable,
}

impl LocationStatus {
    /// The descriptor to send upstream, if one is known.
    pub fn descriptor(&self) -> Option<&str> {
        match self {
            LocationStatus::Resolved(descriptor) => Some(descriptor),
            LocationStatus::Pending | LocationStatus::Unavailable => None,
        }
    }

    pub fn display_text(&self) -> &str {
        match self {
            LocationStatus::Pending => "",
            LocationStatus::Resolved(descriptor) => descriptor,
            LocationStatus::Unavailable => LOCATION_UNAVAILABLE,
        }
    }
}

/// Builds "Locality, Region, Country" from a reverse-geocode answer, falling
/// back to the display name and finally to the raw coordinates.
pub fn describe(geocode: &ReverseGeocode, point: GeoPoint) -> String {
    if let Some(address) = &geocode.address {
        let locality = first_present(&[
            &address.city,
            &address.town,
            &address.village,
            &address.municipality,
            &address.suburb,
        ]);
        let region = first_present(&[&address.state, &address.region]);
        let country = first_present(&[&address.country]);

        let parts: Vec<&str> = [locality, region, country].into_iter().flatten().collect();
        if !parts.is_empty() {
            return parts.join(", ");
        }
    }

    if let Some(name) = geocode.display_name.as_deref().map(str::trim)
        && !name.is_empty()
    {
        return name.to_string();
    }

    format!("{:.4}, {:.4}", point.latitude, point.longitude)
}

fn first_present<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .filter_map(Option::as_deref)
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// Image id to human-readable place. Never fails: every problem on the way
/// degrades to [`LocationStatus::Unavailable`].
#[derive(Clone)]
pub struct LocationResolver {
    imagery: Arc<dyn ImageryProvider>,
    geocoder: Arc<dyn Geocoder>,
}

impl LocationResolver {
    pub fn new(imagery: Arc<dyn ImageryProvider>, geocoder: Arc<dyn Geocoder>) -> Self {
        Self { imagery, geocoder }
    }

    #[tracing::instrument(name = "location resolve", skip(self), fields(location.outcome))]
    pub async fn resolve(&self, image_id: &str) -> LocationStatus {
        let status = match self.try_resolve(image_id).await {
            Ok(descriptor) => LocationStatus::Resolved(descriptor),
            Err(err) => {
                tracing::warn!(image_id = %image_id, error = %err, "Location lookup failed");
                LocationStatus::Unavailable
            }
        };

        let outcome = match &status {
            LocationStatus::Resolved(_) => "resolved",
            _ => "unavailable",
        };
        tracing::Span::current().record("location.outcome", outcome);
        LOCATION_RESOLUTIONS.add(1, &[KeyValue::new("location.outcome", outcome)]);

        status
    }

    async fn try_resolve(&self, image_id: &str) -> Result<String, EnrichmentError> {
        let image_id = image_id.trim();
        if image_id.is_empty() {
            return Err(EnrichmentError::MissingImageId);
        }

        let position = self.imagery.locate(image_id).await?;
        let geocode = self.geocoder.reverse(position.point).await?;

        Ok(describe(&geocode, position.point))
    }

    /// Resolves in the background and stores the answer on `session`, unless
    /// the session has moved on to another image in the meantime.
    pub fn spawn_for(&self, session: Arc<Session>, ticket: LocationTicket) -> JoinHandle<()> {
        let resolver = self.clone();

        tokio::spawn(
            async move {
                let status = resolver.resolve(&ticket.image_id).await;
                if !session.apply_location(ticket.generation, status) {
                    tracing::debug!(
                        session.id = %session.id(),
                        generation = ticket.generation,
                        "Discarding location for a superseded image"
                    );
                }
            }
            .in_current_span(),
        )
    }
}

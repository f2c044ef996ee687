pub mod app;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod location;
pub mod routes;
pub mod session;
pub mod telemetry;
pub mod upstream;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use config::Config;

use coordinator::Coordinator;
use location::LocationResolver;
use session::SessionStore;
use upstream::{
    BackendExplainer, BackendValidator, MapillaryClient, NominatimClient, UpstreamClient,
    UpstreamOptions,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionStore>,
    pub coordinator: Coordinator,
    pub locator: LocationResolver,
}

impl AppState {
    pub fn new(config: Config, coordinator: Coordinator, locator: LocationResolver) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            coordinator,
            locator,
        }
    }

    /// Wires the real HTTP collaborators described by `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let backend = Arc::new(UpstreamClient::new(&UpstreamOptions {
            timeout: config.upstream_timeout,
            max_attempts: config.upstream_max_attempts,
            user_agent: config.geocoder_user_agent.clone(),
        })?);
        let enrichment = Arc::new(UpstreamClient::new(&UpstreamOptions {
            timeout: config.enrichment_timeout,
            max_attempts: config.upstream_max_attempts,
            user_agent: config.geocoder_user_agent.clone(),
        })?);

        let coordinator = Coordinator::new(
            Arc::new(BackendExplainer::new(
                backend.clone(),
                config.primary_explainer_path.trim_matches('/'),
                config.primary_explainer_url(),
            )),
            Arc::new(BackendExplainer::new(
                backend.clone(),
                config.secondary_explainer_path.trim_matches('/'),
                config.secondary_explainer_url(),
            )),
            Arc::new(BackendValidator::new(backend, config.validator_url())),
        );

        let locator = LocationResolver::new(
            Arc::new(MapillaryClient::new(
                enrichment.clone(),
                config.mapillary_api_url.clone(),
                config.mapillary_access_token.clone(),
            )),
            Arc::new(NominatimClient::new(enrichment, config.geocoder_url.clone())),
        );

        if config.mapillary_access_token.is_none() {
            tracing::warn!("MAPILLARY_ACCESS_TOKEN is not set; locations will be unavailable");
        }

        Ok(Self::new(config, coordinator, locator))
    }
}

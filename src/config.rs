use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::upstream::client::MAX_RETRY_DELAY;

// headroom for routing, serialization and scheduling on top of upstream time
const REQUEST_SLACK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub explainer_base_url: String,
    pub primary_explainer_path: String,
    pub secondary_explainer_path: String,
    pub validator_path: String,
    pub mapillary_api_url: String,
    pub mapillary_access_token: Option<String>,
    pub geocoder_url: String,
    pub geocoder_user_agent: String,
    pub upstream_timeout: Duration,
    pub enrichment_timeout: Duration,
    pub upstream_max_attempts: u32,
    pub default_image_id: String,
    pub session_idle_ttl: Duration,
    pub session_sweep_interval: Duration,
    pub otel_service_name: String,
    pub otel_exporter_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            environment: "development".to_string(),
            explainer_base_url: "http://localhost:5000".to_string(),
            primary_explainer_path: "/gemini".to_string(),
            secondary_explainer_path: "/llama".to_string(),
            validator_path: "/contextual-validation".to_string(),
            mapillary_api_url: "https://graph.mapillary.com".to_string(),
            mapillary_access_token: None,
            geocoder_url: "https://nominatim.openstreetmap.org".to_string(),
            geocoder_user_agent: "signage-explainer/1.0".to_string(),
            upstream_timeout: Duration::from_secs(60),
            enrichment_timeout: Duration::from_secs(10),
            upstream_max_attempts: 2,
            default_image_id: "515418514324302".to_string(),
            session_idle_ttl: Duration::from_secs(30 * 60),
            session_sweep_interval: Duration::from_secs(60),
            otel_service_name: "signage-explainer".to_string(),
            otel_exporter_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

// The access token must never reach logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("environment", &self.environment)
            .field("explainer_base_url", &self.explainer_base_url)
            .field("primary_explainer_path", &self.primary_explainer_path)
            .field("secondary_explainer_path", &self.secondary_explainer_path)
            .field("validator_path", &self.validator_path)
            .field("mapillary_api_url", &self.mapillary_api_url)
            .field(
                "mapillary_access_token",
                &self.mapillary_access_token.as_ref().map(|_| "<redacted>"),
            )
            .field("geocoder_url", &self.geocoder_url)
            .field("geocoder_user_agent", &self.geocoder_user_agent)
            .field("upstream_timeout", &self.upstream_timeout)
            .field("enrichment_timeout", &self.enrichment_timeout)
            .field("upstream_max_attempts", &self.upstream_max_attempts)
            .field("default_image_id", &self.default_image_id)
            .field("session_idle_ttl", &self.session_idle_ttl)
            .field("session_sweep_interval", &self.session_sweep_interval)
            .field("otel_service_name", &self.otel_service_name)
            .field("otel_exporter_endpoint", &self.otel_exporter_endpoint)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        Ok(Self {
            port: parse_var("APP_PORT", defaults.port)?,
            environment: env::var("APP_ENVIRONMENT").unwrap_or(defaults.environment),
            explainer_base_url: env::var("EXPLAINER_BASE_URL")
                .unwrap_or(defaults.explainer_base_url),
            primary_explainer_path: env::var("PRIMARY_EXPLAINER_PATH")
                .unwrap_or(defaults.primary_explainer_path),
            secondary_explainer_path: env::var("SECONDARY_EXPLAINER_PATH")
                .unwrap_or(defaults.secondary_explainer_path),
            validator_path: env::var("VALIDATOR_PATH").unwrap_or(defaults.validator_path),
            mapillary_api_url: env::var("MAPILLARY_API_URL").unwrap_or(defaults.mapillary_api_url),
            mapillary_access_token: env::var("MAPILLARY_ACCESS_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            geocoder_url: env::var("GEOCODER_URL").unwrap_or(defaults.geocoder_url),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or(defaults.geocoder_user_agent),
            upstream_timeout: Duration::from_secs(parse_var(
                "UPSTREAM_TIMEOUT_SECS",
                defaults.upstream_timeout.as_secs(),
            )?),
            enrichment_timeout: Duration::from_secs(parse_var(
                "ENRICHMENT_TIMEOUT_SECS",
                defaults.enrichment_timeout.as_secs(),
            )?),
            upstream_max_attempts: parse_var(
                "UPSTREAM_MAX_ATTEMPTS",
                defaults.upstream_max_attempts,
            )?
            .max(1),
            default_image_id: env::var("DEFAULT_IMAGE_ID").unwrap_or(defaults.default_image_id),
            session_idle_ttl: Duration::from_secs(parse_var(
                "SESSION_IDLE_TTL_SECS",
                defaults.session_idle_ttl.as_secs(),
            )?),
            session_sweep_interval: Duration::from_secs(
                parse_var(
                    "SESSION_SWEEP_INTERVAL_SECS",
                    defaults.session_sweep_interval.as_secs(),
                )?
                .max(1),
            ),
            otel_service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or(defaults.otel_service_name),
            otel_exporter_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or(defaults.otel_exporter_endpoint),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn primary_explainer_url(&self) -> String {
        join_url(&self.explainer_base_url, &self.primary_explainer_path)
    }

    pub fn secondary_explainer_url(&self) -> String {
        join_url(&self.explainer_base_url, &self.secondary_explainer_path)
    }

    pub fn validator_url(&self) -> String {
        join_url(&self.explainer_base_url, &self.validator_path)
    }

    /// Upper bound for one HTTP request. The slowest path is a one-shot
    /// analysis: imagery lookup, reverse geocode, the explainer round and the
    /// validator call run one after another, each with every retry spent.
    pub fn request_timeout(&self) -> Duration {
        let attempts = self.upstream_max_attempts.max(1);
        let enrichment = call_budget(self.enrichment_timeout, attempts);
        let upstream = call_budget(self.upstream_timeout, attempts);

        enrichment * 2 + upstream * 2 + REQUEST_SLACK
    }
}

/// Worst case for one logical upstream call: every attempt times out and
/// every retry waits the longest backoff.
fn call_budget(timeout: Duration, attempts: u32) -> Duration {
    timeout * attempts + MAX_RETRY_DELAY * (attempts - 1)
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

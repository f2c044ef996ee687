//! Shared fakes and helpers for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::upstream::{
    EnrichmentError, ExplainRequest, Explainer, GeoPoint, Geocoder, ImagePosition,
    ImageryProvider, ReverseGeocode, UpstreamError, ValidateRequest, ValidationPayload, Validator,
};

/// Serves `app` on an ephemeral local port and returns its base url.
pub async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

enum Script {
    Succeed(String),
    Fail(String),
    Panic,
}

pub struct FakeExplainer {
    name: String,
    script: Script,
    gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
    pub last_request: std::sync::Mutex<Option<ExplainRequest>>,
}

impl FakeExplainer {
    pub fn succeeding(name: &str, message: &str) -> Arc<Self> {
        Arc::new(Self::with_script(name, Script::Succeed(message.to_string()), None))
    }

    pub fn failing(name: &str, reason: &str) -> Arc<Self> {
        Arc::new(Self::with_script(
            name,
            Script::Fail(reason.to_string()),
            None,
        ))
    }

    pub fn panicking(name: &str) -> Arc<Self> {
        Arc::new(Self::with_script(name, Script::Panic, None))
    }

    /// Succeeds only after `gate` is notified.
    pub fn gated(name: &str, message: &str, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self::with_script(
            name,
            Script::Succeed(message.to_string()),
            Some(gate),
        ))
    }

    fn with_script(name: &str, script: Script, gate: Option<Arc<Notify>>) -> Self {
        Self {
            name: name.to_string(),
            script,
            gate,
            calls: AtomicUsize::new(0),
            last_request: std::sync::Mutex::new(None),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Explainer for FakeExplainer {
    async fn explain(&self, req: &ExplainRequest) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.script {
            Script::Succeed(message) => Ok(message.clone()),
            Script::Fail(reason) => Err(UpstreamError::Status {
                status: 500,
                reason: reason.clone(),
            }),
            Script::Panic => panic!("explainer {} blew up", self.name),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct FakeValidator {
    outcome: Result<ValidationPayload, u16>,
    pub calls: AtomicUsize,
    pub last_request: std::sync::Mutex<Option<ValidateRequest>>,
}

impl FakeValidator {
    pub fn succeeding(payload: ValidationPayload) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(payload),
            calls: AtomicUsize::new(0),
            last_request: std::sync::Mutex::new(None),
        })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(status),
            calls: AtomicUsize::new(0),
            last_request: std::sync::Mutex::new(None),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Validator for FakeValidator {
    async fn validate(&self, req: &ValidateRequest) -> Result<ValidationPayload, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req.clone());
        match &self.outcome {
            Ok(payload) => Ok(payload.clone()),
            Err(status) => Err(UpstreamError::Status {
                status: *status,
                reason: "validator unavailable".to_string(),
            }),
        }
    }
}

/// Imagery provider that knows a fixed set of image positions.
pub struct FakeImagery {
    pub positions: Vec<(String, GeoPoint)>,
    gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
}

impl FakeImagery {
    pub fn new(positions: &[(&str, f64, f64)]) -> Arc<Self> {
        Arc::new(Self::build(positions, None))
    }

    /// Lookups for the first listed image wait for `gate` before answering.
    pub fn gated(positions: &[(&str, f64, f64)], gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self::build(positions, Some(gate)))
    }

    fn build(positions: &[(&str, f64, f64)], gate: Option<Arc<Notify>>) -> Self {
        Self {
            positions: positions
                .iter()
                .map(|(id, latitude, longitude)| {
                    (
                        id.to_string(),
                        GeoPoint {
                            latitude: *latitude,
                            longitude: *longitude,
                        },
                    )
                })
                .collect(),
            gate,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ImageryProvider for FakeImagery {
    async fn locate(&self, image_id: &str) -> Result<ImagePosition, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate
            && image_id == self.positions.first().map(|(id, _)| id.as_str()).unwrap_or("")
        {
            gate.notified().await;
        }
        self.positions
            .iter()
            .find(|(id, _)| id == image_id)
            .map(|(_, point)| ImagePosition {
                point: *point,
                compass_angle: None,
            })
            .ok_or(EnrichmentError::MissingGeometry)
    }
}

pub struct FakeGeocoder {
    pub answer: Result<ReverseGeocode, u16>,
}

impl FakeGeocoder {
    pub fn answering(geocode: ReverseGeocode) -> Arc<Self> {
        Arc::new(Self { answer: Ok(geocode) })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self { answer: Err(status) })
    }
}

#[async_trait::async_trait]
impl Geocoder for FakeGeocoder {
    async fn reverse(&self, _point: GeoPoint) -> Result<ReverseGeocode, EnrichmentError> {
        match &self.answer {
            Ok(geocode) => Ok(geocode.clone()),
            Err(status) => Err(EnrichmentError::Upstream(UpstreamError::Status {
                status: *status,
                reason: "geocoder down".to_string(),
            })),
        }
    }
}

pub mod state;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::session::{CycleTicket, Session, SessionError};
use crate::telemetry::metrics::{ANALYSIS_CYCLE_DURATION, ANALYSIS_CYCLES};
use crate::upstream::{ExplainRequest, Explainer, ValidateRequest, ValidationPayload, Validator};

pub use state::{
    Activity, AnalysisState, Call, CallGuard, EXPLAINER_FAILURE_MESSAGE, GENERIC_FAILURE_MESSAGE,
    VALIDATION_FAILURE_MESSAGE,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExplanationResult {
    Explained { message: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub image_id: String,
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<ExplanationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secondary: Option<ExplanationResult>,
    pub state: AnalysisState,
    pub result: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

struct Settled {
    primary: ExplanationResult,
    secondary: ExplanationResult,
    state: AnalysisState,
}

/// Forces a cycle that ends without settling (panic, dropped task) into
/// `Aborted`, so the session never stays busy.
struct CycleGuard {
    session: Arc<Session>,
    cycle_id: Uuid,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let aborted = AnalysisState::Aborted {
            cycle_id: self.cycle_id,
        };
        if self.session.advance(self.cycle_id, aborted) {
            tracing::error!(cycle.id = %self.cycle_id, "Analysis cycle ended without settling");
        }
    }
}

/// Fans one image out to both explainers, then reconciles through the validator.
#[derive(Clone)]
pub struct Coordinator {
    primary: Arc<dyn Explainer>,
    secondary: Arc<dyn Explainer>,
    validator: Arc<dyn Validator>,
}

impl Coordinator {
    pub fn new(
        primary: Arc<dyn Explainer>,
        secondary: Arc<dyn Explainer>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            primary,
            secondary,
            validator,
        }
    }

    /// Runs one analysis cycle for `session`.
    ///
    /// Only [`SessionError`] escapes: upstream failures, and anything that
    /// goes wrong inside the cycle, end up in the report's state and text.
    #[tracing::instrument(
        name = "analysis cycle",
        skip(self, session),
        fields(
            session.id = %session.id(),
            cycle.id,
            image.id,
            analysis.outcome,
        )
    )]
    pub async fn analyze(&self, session: Arc<Session>) -> Result<CycleReport, SessionError> {
        let ticket = session.begin_cycle()?;
        let started_at = Utc::now();
        let start = Instant::now();

        let span = tracing::Span::current();
        span.record("cycle.id", ticket.cycle_id.to_string());
        span.record("image.id", ticket.image_id.as_str());

        tracing::info!(
            location = ticket.location.as_deref().unwrap_or(""),
            "Dispatching explainers"
        );

        let guard = CycleGuard {
            session: session.clone(),
            cycle_id: ticket.cycle_id,
        };
        let coordinator = self.clone();
        let task_ticket = ticket.clone();

        let task = tokio::spawn(
            async move {
                let settled = coordinator.run_cycle(&guard.session, &task_ticket).await;
                drop(guard);
                settled
            }
            .in_current_span(),
        );

        let (primary, secondary, state) = match task.await {
            Ok(settled) => (Some(settled.primary), Some(settled.secondary), settled.state),
            Err(err) => {
                tracing::error!(error = %err, "Analysis cycle failed");
                (
                    None,
                    None,
                    AnalysisState::Aborted {
                        cycle_id: ticket.cycle_id,
                    },
                )
            }
        };

        let result = state
            .result_text()
            .unwrap_or_else(|| GENERIC_FAILURE_MESSAGE.to_string());
        let duration = start.elapsed();

        span.record("analysis.outcome", state.phase());
        ANALYSIS_CYCLES.add(1, &[KeyValue::new("analysis.outcome", state.phase())]);
        ANALYSIS_CYCLE_DURATION.record(
            duration.as_secs_f64(),
            &[KeyValue::new("analysis.outcome", state.phase())],
        );

        tracing::info!(
            outcome = state.phase(),
            duration_ms = duration.as_millis() as u64,
            "Analysis cycle finished"
        );

        Ok(CycleReport {
            cycle_id: ticket.cycle_id,
            image_id: ticket.image_id,
            location: ticket.location,
            primary,
            secondary,
            state,
            result,
            started_at,
            finished_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        })
    }

    async fn run_cycle(&self, session: &Session, ticket: &CycleTicket) -> Settled {
        let request = ExplainRequest {
            image_id: ticket.image_id.clone(),
            location: ticket.location.clone(),
        };

        // all-settle: a failure on one side never cancels the other
        let (primary, secondary) = tokio::join!(
            self.explain(session, Call::PrimaryExplainer, self.primary.as_ref(), &request),
            self.explain(session, Call::SecondaryExplainer, self.secondary.as_ref(), &request),
        );

        let state = match (&primary, &secondary) {
            (
                ExplanationResult::Explained { message: first },
                ExplanationResult::Explained { message: second },
            ) => {
                session.advance(
                    ticket.cycle_id,
                    AnalysisState::Validating {
                        cycle_id: ticket.cycle_id,
                    },
                );

                let request = ValidateRequest {
                    image_id: ticket.image_id.clone(),
                    gemini_output: first.clone(),
                    llama_output: second.clone(),
                    location: ticket.location.clone(),
                };

                match self.validate(session, &request).await {
                    Ok(payload) => AnalysisState::Validated {
                        cycle_id: ticket.cycle_id,
                        payload,
                    },
                    Err(reason) => AnalysisState::ValidationFailed {
                        cycle_id: ticket.cycle_id,
                        reason,
                    },
                }
            }
            _ => AnalysisState::ExplainersFailed {
                cycle_id: ticket.cycle_id,
            },
        };

        session.advance(ticket.cycle_id, state.clone());

        Settled {
            primary,
            secondary,
            state,
        }
    }

    async fn explain(
        &self,
        session: &Session,
        call: Call,
        explainer: &dyn Explainer,
        request: &ExplainRequest,
    ) -> ExplanationResult {
        let _indicator = CallGuard::raise(session.activity_sender(), call);

        match explainer.explain(request).await {
            Ok(message) => ExplanationResult::Explained { message },
            Err(err) => {
                tracing::warn!(
                    explainer = explainer.name(),
                    error = %err,
                    "Explainer call failed"
                );
                ExplanationResult::Failed {
                    reason: err.reason(),
                }
            }
        }
    }

    async fn validate(
        &self,
        session: &Session,
        request: &ValidateRequest,
    ) -> Result<ValidationPayload, String> {
        let _indicator = CallGuard::raise(session.activity_sender(), Call::Validator);

        self.validator.validate(request).await.map_err(|err| {
            tracing::warn!(error = %err, "Validator call failed");
            err.reason()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Notify;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::location::LocationStatus;
    use crate::test_support::{FakeExplainer, FakeValidator};

    fn consensus() -> ValidationPayload {
        ValidationPayload::Text("Consensus: stop sign confirmed".to_string())
    }

    fn assert_quiet(session: &Session) {
        assert!(!session.activity().any(), "indicators left raised");
        assert!(!session.is_busy(), "session left in flight");
    }

    #[tokio::test]
    async fn test_end_to_end_consensus() {
        let primary = FakeExplainer::succeeding("gemini", "Stop sign ahead");
        let secondary = FakeExplainer::succeeding("llama", "Yield sign detected");
        let validator = FakeValidator::succeeding(consensus());
        let coordinator = Coordinator::new(primary.clone(), secondary.clone(), validator.clone());
        let session = Arc::new(Session::with_location(
            "515418514324302",
            LocationStatus::Resolved("Springfield, Illinois, USA".to_string()),
        ));

        let report = assert_ok!(coordinator.analyze(session.clone()).await);

        assert_eq!(report.result, "Consensus: stop sign confirmed");
        assert_eq!(
            report.state,
            AnalysisState::Validated {
                cycle_id: report.cycle_id,
                payload: consensus(),
            }
        );
        assert_eq!(
            report.primary,
            Some(ExplanationResult::Explained {
                message: "Stop sign ahead".to_string()
            })
        );
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
        assert_eq!(validator.call_count(), 1);

        let sent = validator.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.image_id, "515418514324302");
        assert_eq!(sent.gemini_output, "Stop sign ahead");
        assert_eq!(sent.llama_output, "Yield sign detected");
        assert_eq!(sent.location.as_deref(), Some("Springfield, Illinois, USA"));

        let explained = primary.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(explained.location.as_deref(), Some("Springfield, Illinois, USA"));

        assert_eq!(session.state(), report.state);
        assert_quiet(&session);
    }

    #[tokio::test]
    async fn test_structured_payload_is_preserved() {
        let payload = ValidationPayload::Structured(json!({
            "agreement": "partial",
            "signs": [{"code": "B1", "meaning": "Give way"}],
        }));
        let coordinator = Coordinator::new(
            FakeExplainer::succeeding("gemini", "a"),
            FakeExplainer::succeeding("llama", "b"),
            FakeValidator::succeeding(payload.clone()),
        );
        let session = Arc::new(Session::new("1"));

        let report = coordinator.analyze(session.clone()).await.unwrap();

        match &report.state {
            AnalysisState::Validated { payload: got, .. } => assert_eq!(got, &payload),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(report.result, payload.render());
        assert!(report.result.contains("\"agreement\": \"partial\""));
        assert_quiet(&session);
    }

    #[tokio::test]
    async fn test_any_explainer_failure_skips_validation() {
        let cases = [(false, true), (true, false), (false, false)];

        for (first_ok, second_ok) in cases {
            let primary = if first_ok {
                FakeExplainer::succeeding("gemini", "Stop sign ahead")
            } else {
                FakeExplainer::failing("gemini", "quota exceeded")
            };
            let secondary = if second_ok {
                FakeExplainer::succeeding("llama", "Yield sign detected")
            } else {
                FakeExplainer::failing("llama", "model unavailable")
            };
            let validator = FakeValidator::succeeding(consensus());
            let coordinator =
                Coordinator::new(primary.clone(), secondary.clone(), validator.clone());
            let session = Arc::new(Session::new("515418514324302"));

            let report = coordinator.analyze(session.clone()).await.unwrap();

            assert_eq!(report.result, EXPLAINER_FAILURE_MESSAGE);
            assert!(matches!(report.state, AnalysisState::ExplainersFailed { .. }));
            assert_eq!(validator.call_count(), 0, "case {first_ok}/{second_ok}");
            // the sibling call still ran to completion
            assert_eq!(primary.call_count(), 1);
            assert_eq!(secondary.call_count(), 1);
            if !first_ok {
                assert_eq!(
                    report.primary,
                    Some(ExplanationResult::Failed {
                        reason: "quota exceeded".to_string()
                    })
                );
            }
            assert_quiet(&session);
        }
    }

    #[tokio::test]
    async fn test_validator_failure_message() {
        let coordinator = Coordinator::new(
            FakeExplainer::succeeding("gemini", "Stop sign ahead"),
            FakeExplainer::succeeding("llama", "Yield sign detected"),
            FakeValidator::failing(502),
        );
        let session = Arc::new(Session::new("515418514324302"));

        let report = coordinator.analyze(session.clone()).await.unwrap();

        assert_eq!(report.result, VALIDATION_FAILURE_MESSAGE);
        assert_ne!(report.result, EXPLAINER_FAILURE_MESSAGE);
        assert_eq!(
            report.state,
            AnalysisState::ValidationFailed {
                cycle_id: report.cycle_id,
                reason: "validator unavailable".to_string(),
            }
        );
        assert_quiet(&session);
    }

    #[tokio::test]
    async fn test_blank_image_makes_no_calls() {
        for blank in ["", " ", "\t"] {
            let primary = FakeExplainer::succeeding("gemini", "a");
            let secondary = FakeExplainer::succeeding("llama", "b");
            let validator = FakeValidator::succeeding(consensus());
            let coordinator =
                Coordinator::new(primary.clone(), secondary.clone(), validator.clone());
            let session = Arc::new(Session::new(blank));

            let err = assert_err!(coordinator.analyze(session.clone()).await);

            assert_eq!(err, SessionError::MissingImageId);
            assert_eq!(primary.call_count(), 0);
            assert_eq!(secondary.call_count(), 0);
            assert_eq!(validator.call_count(), 0);
            assert_eq!(session.state(), AnalysisState::Idle);
        }
    }

    #[tokio::test]
    async fn test_pending_location_is_omitted() {
        let primary = FakeExplainer::succeeding("gemini", "a");
        let validator = FakeValidator::succeeding(consensus());
        let coordinator = Coordinator::new(
            primary.clone(),
            FakeExplainer::succeeding("llama", "b"),
            validator.clone(),
        );
        let session = Arc::new(Session::new("1"));

        let report = coordinator.analyze(session).await.unwrap();

        assert_eq!(report.location, None);
        assert_eq!(primary.last_request.lock().unwrap().clone().unwrap().location, None);
        assert_eq!(validator.last_request.lock().unwrap().clone().unwrap().location, None);
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_rejected() {
        let gate = Arc::new(Notify::new());
        let primary = FakeExplainer::gated("gemini", "Stop sign ahead", gate.clone());
        let secondary = FakeExplainer::succeeding("llama", "Yield sign detected");
        let validator = FakeValidator::succeeding(consensus());
        let coordinator = Coordinator::new(primary.clone(), secondary.clone(), validator.clone());
        let session = Arc::new(Session::new("515418514324302"));

        let mut activity = session.subscribe_activity();
        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            let session = session.clone();
            async move { coordinator.analyze(session).await }
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            activity.wait_for(|a| a.primary_explainer),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(session.is_busy());

        let second = coordinator.analyze(session.clone()).await;
        assert_eq!(second.unwrap_err(), SessionError::Busy);
        assert_eq!(secondary.call_count(), 1);

        gate.notify_one();
        let report = first.await.unwrap().unwrap();

        assert_eq!(report.result, "Consensus: stop sign confirmed");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(validator.call_count(), 1);
        assert_quiet(&session);
    }

    #[tokio::test]
    async fn test_panic_in_cycle_is_contained() {
        let validator = FakeValidator::succeeding(consensus());
        let coordinator = Coordinator::new(
            FakeExplainer::panicking("gemini"),
            FakeExplainer::succeeding("llama", "Yield sign detected"),
            validator.clone(),
        );
        let session = Arc::new(Session::new("515418514324302"));

        let report = coordinator.analyze(session.clone()).await.unwrap();

        assert_eq!(report.result, GENERIC_FAILURE_MESSAGE);
        assert_eq!(
            report.state,
            AnalysisState::Aborted {
                cycle_id: report.cycle_id
            }
        );
        assert_eq!(report.primary, None);
        assert_eq!(session.state(), report.state);
        assert_eq!(validator.call_count(), 0);
        assert_quiet(&session);

        // the session accepts a new trigger afterwards
        let retry = Coordinator::new(
            FakeExplainer::succeeding("gemini", "Stop sign ahead"),
            FakeExplainer::succeeding("llama", "Yield sign detected"),
            FakeValidator::succeeding(consensus()),
        );
        let report = retry.analyze(session.clone()).await.unwrap();
        assert_eq!(report.result, "Consensus: stop sign confirmed");
    }

    #[tokio::test]
    async fn test_new_cycle_resets_previous_result() {
        let gate = Arc::new(Notify::new());
        let session = Arc::new(Session::new("1"));

        let first = Coordinator::new(
            FakeExplainer::succeeding("gemini", "a"),
            FakeExplainer::succeeding("llama", "b"),
            FakeValidator::succeeding(consensus()),
        );
        first.analyze(session.clone()).await.unwrap();
        assert!(session.snapshot().result.is_some());

        let second = Coordinator::new(
            FakeExplainer::gated("gemini", "a", gate.clone()),
            FakeExplainer::succeeding("llama", "b"),
            FakeValidator::failing(500),
        );
        let mut activity = session.subscribe_activity();
        let running = tokio::spawn({
            let session = session.clone();
            async move { second.analyze(session).await }
        });
        activity.wait_for(|a| a.primary_explainer).await.unwrap();

        let snapshot = session.snapshot();
        assert!(snapshot.busy);
        assert_eq!(snapshot.result, None);
        assert_eq!(snapshot.state.phase(), "dispatched");

        gate.notify_one();
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.result, VALIDATION_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn test_report_serialization() {
        let coordinator = Coordinator::new(
            FakeExplainer::succeeding("gemini", "Stop sign ahead"),
            FakeExplainer::failing("llama", "model unavailable"),
            FakeValidator::succeeding(consensus()),
        );
        let report = coordinator
            .analyze(Arc::new(Session::new("515418514324302")))
            .await
            .unwrap();

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["imageId"], "515418514324302");
        assert_eq!(value["state"]["phase"], "explainers_failed");
        assert_eq!(value["primary"]["status"], "explained");
        assert_eq!(value["secondary"]["status"], "failed");
        assert_eq!(value["secondary"]["reason"], "model unavailable");
        assert_eq!(value["result"], EXPLAINER_FAILURE_MESSAGE);
    }
}

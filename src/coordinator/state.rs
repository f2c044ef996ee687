use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::upstream::ValidationPayload;

pub const EXPLAINER_FAILURE_MESSAGE: &str =
    "Could not get explanations from both models. Please try again.";
pub const VALIDATION_FAILURE_MESSAGE: &str =
    "The explanations could not be validated. Please try again.";
pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong while analyzing this image.";

/// Where a session's analysis stands. `Dispatched` and `Validating` are the
/// in-flight phases; every other phase accepts a new trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AnalysisState {
    Idle,
    Dispatched {
        cycle_id: Uuid,
    },
    ExplainersFailed {
        cycle_id: Uuid,
    },
    Validating {
        cycle_id: Uuid,
    },
    Validated {
        cycle_id: Uuid,
        payload: ValidationPayload,
    },
    ValidationFailed {
        cycle_id: Uuid,
        reason: String,
    },
    Aborted {
        cycle_id: Uuid,
    },
}

impl AnalysisState {
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            AnalysisState::Dispatched { .. } | AnalysisState::Validating { .. }
        )
    }

    pub fn cycle_id(&self) -> Option<Uuid> {
        match self {
            AnalysisState::Idle => None,
            AnalysisState::Dispatched { cycle_id }
            | AnalysisState::ExplainersFailed { cycle_id }
            | AnalysisState::Validating { cycle_id }
            | AnalysisState::Validated { cycle_id, .. }
            | AnalysisState::ValidationFailed { cycle_id, .. }
            | AnalysisState::Aborted { cycle_id } => Some(*cycle_id),
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            AnalysisState::Idle => "idle",
            AnalysisState::Dispatched { .. } => "dispatched",
            AnalysisState::ExplainersFailed { .. } => "explainers_failed",
            AnalysisState::Validating { .. } => "validating",
            AnalysisState::Validated { .. } => "validated",
            AnalysisState::ValidationFailed { .. } => "validation_failed",
            AnalysisState::Aborted { .. } => "aborted",
        }
    }

    /// The text shown to the user once a cycle has settled.
    pub fn result_text(&self) -> Option<String> {
        match self {
            AnalysisState::Idle
            | AnalysisState::Dispatched { .. }
            | AnalysisState::Validating { .. } => None,
            AnalysisState::ExplainersFailed { .. } => Some(EXPLAINER_FAILURE_MESSAGE.to_string()),
            AnalysisState::Validated { payload, .. } => Some(payload.render()),
            AnalysisState::ValidationFailed { .. } => Some(VALIDATION_FAILURE_MESSAGE.to_string()),
            AnalysisState::Aborted { .. } => Some(GENERIC_FAILURE_MESSAGE.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    PrimaryExplainer,
    SecondaryExplainer,
    Validator,
}

/// Per-call progress indicators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub primary_explainer: bool,
    pub secondary_explainer: bool,
    pub validator: bool,
}

impl Activity {
    pub fn any(&self) -> bool {
        self.primary_explainer || self.secondary_explainer || self.validator
    }

    fn flag(&mut self, call: Call) -> &mut bool {
        match call {
            Call::PrimaryExplainer => &mut self.primary_explainer,
            Call::SecondaryExplainer => &mut self.secondary_explainer,
            Call::Validator => &mut self.validator,
        }
    }
}

/// Holds one indicator up for as long as it lives.
pub struct CallGuard<'a> {
    activity: &'a watch::Sender<Activity>,
    call: Call,
}

impl<'a> CallGuard<'a> {
    pub fn raise(activity: &'a watch::Sender<Activity>, call: Call) -> Self {
        activity.send_modify(|state| *state.flag(call) = true);
        Self { activity, call }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let call = self.call;
        self.activity.send_modify(|state| *state.flag(call) = false);
    }
}

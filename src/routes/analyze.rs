use std::sync::Arc;

use axum::{Json, extract::State};
use serde::Deserialize;

use crate::AppState;
use crate::coordinator::CycleReport;
use crate::error::AppResult;
use crate::location::LocationStatus;
use crate::session::{Session, SessionError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeBody {
    #[serde(default)]
    pub image_id: String,
    pub location: Option<String>,
}

/// One-shot analysis outside any stored session. Without a caller-supplied
/// location the image is located first; a failed lookup only drops the
/// location from the upstream requests.
pub async fn analyze_once(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeBody>,
) -> AppResult<Json<CycleReport>> {
    let image_id = body.image_id.trim();
    if image_id.is_empty() {
        return Err(SessionError::MissingImageId.into());
    }

    let location = match body
        .location
        .as_deref()
        .map(str::trim)
        .filter(|location| !location.is_empty())
    {
        Some(location) => LocationStatus::Resolved(location.to_string()),
        None => state.locator.resolve(image_id).await,
    };

    let session = Arc::new(Session::with_location(image_id, location));
    let report = state.coordinator.analyze(session).await?;

    Ok(Json(report))
}

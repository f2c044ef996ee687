use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::coordinator::CycleReport;
use crate::error::{AppError, AppResult};
use crate::session::{Session, SessionSnapshot};

use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub image_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectImageBody {
    pub image_id: String,
}

fn find_session(state: &AppState, id: Uuid) -> AppResult<Arc<Session>> {
    state
        .sessions
        .get(id)
        .ok_or_else(|| AppError::NotFound(format!("Session {id} not found")))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> (StatusCode, Json<SessionSnapshot>) {
    let image_id = body
        .image_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.config.default_image_id.clone());

    let session = state.sessions.create(image_id);
    if let Some(ticket) = session.location_ticket() {
        state.locator.spawn_for(session.clone(), ticket);
    }

    tracing::info!(session.id = %session.id(), image_id = %session.image_id(), "Session created");

    (StatusCode::CREATED, Json(session.snapshot()))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SessionSnapshot>> {
    let session = find_session(&state, id)?;
    Ok(Json(session.snapshot()))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state
        .sessions
        .remove(id)
        .ok_or_else(|| AppError::NotFound(format!("Session {id} not found")))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn select_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SelectImageBody>,
) -> AppResult<Json<SessionSnapshot>> {
    let session = find_session(&state, id)?;

    if let Some(ticket) = session.select_image(&body.image_id)? {
        state.locator.spawn_for(session.clone(), ticket);
    }

    Ok(Json(session.snapshot()))
}

pub async fn analyze_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CycleReport>> {
    let session = find_session(&state, id)?;
    let report = state.coordinator.analyze(session).await?;
    Ok(Json(report))
}

use super::blocking;
use crate::error::ApiError;
use crate::server::Server;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use wiki_core::PageSummary;

/// Newline-separated page titles, in display order.
#[derive(Debug, Deserialize)]
pub struct KeypagesRequest {
    pub titles: String,
}

pub async fn get_keypages(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
) -> Result<Json<Vec<PageSummary>>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || Ok(group.keypages())).await?))
}

pub async fn set_keypages(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
    Json(request): Json<KeypagesRequest>,
) -> Result<Json<Vec<PageSummary>>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || group.set_keypages(&request.titles)).await?))
}

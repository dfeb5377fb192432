use super::blocking;
use crate::error::ApiError;
use crate::server::Server;
use axum::extract::{Path, Query, State};
use axum::Json;
use std::sync::Arc;
use wiki_core::{Paginated, SearchHit, SearchRequest};

pub async fn search(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
    Query(request): Query<SearchRequest>,
) -> Result<Json<Paginated<SearchHit>>, ApiError> {
    let group = server.group(&group)?;
    tracing::debug!(group = %group.name(), keyword = ?request.keyword, "Search");
    Ok(Json(blocking(move || group.search(&request)).await?))
}

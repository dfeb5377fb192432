use super::{blocking, PageQuery};
use crate::error::ApiError;
use crate::server::Server;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use wiki_core::revision::RevisionSummary;
use wiki_core::{
    EditOutcome, Page, PageId, PageSummary, PageVersion, Paginated, WikiError, HOME_PAGE_ID,
};

#[derive(Debug, Deserialize)]
pub struct CreatePageRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub current_version: u64,
    pub markup: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub new_title: String,
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Serialize)]
pub struct DiffResponse {
    pub from: u64,
    pub to: u64,
    pub patch: String,
}

#[derive(Debug, Serialize)]
pub struct Sidebar {
    pub keypages: Vec<PageSummary>,
    pub recent_changes: Vec<PageSummary>,
    pub latest_change: Option<String>,
}

fn home_path(group: &str) -> String {
    format!("/{}/page/{}", group, HOME_PAGE_ID)
}

pub async fn home(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
) -> Result<Redirect, ApiError> {
    server.group(&group)?;
    Ok(Redirect::to(&home_path(&group)))
}

pub async fn get_page(
    State(server): State<Arc<Server>>,
    Path((group, page_id)): Path<(String, PageId)>,
) -> Result<Json<Page>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || group.page(page_id)).await?))
}

pub async fn create_page(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
    Json(request): Json<CreatePageRequest>,
) -> Result<(StatusCode, Json<Page>), ApiError> {
    let group = server.group(&group)?;
    let page = blocking(move || group.create_page(&request.title)).await?;
    Ok((StatusCode::CREATED, Json(page)))
}

pub async fn edit_page(
    State(server): State<Arc<Server>>,
    Path((group, page_id)): Path<(String, PageId)>,
    Json(request): Json<EditRequest>,
) -> Result<Json<EditOutcome>, ApiError> {
    let group = server.group(&group)?;
    let outcome =
        blocking(move || group.edit_page(page_id, request.current_version, &request.markup)).await?;
    Ok(Json(outcome))
}

/// Renaming the home page is refused by sending the client back home.
pub async fn rename_page(
    State(server): State<Arc<Server>>,
    Path((group_name, page_id)): Path<(String, PageId)>,
    Json(request): Json<RenameRequest>,
) -> Result<Response, ApiError> {
    let group = server.group(&group_name)?;
    match blocking(move || group.rename_page(page_id, &request.new_title)).await {
        Ok(outcome) => Ok(Json(outcome).into_response()),
        Err(ApiError::Wiki(WikiError::HomePageRename)) => {
            Ok(Redirect::to(&home_path(&group_name)).into_response())
        }
        Err(e) => Err(e),
    }
}

pub async fn references(
    State(server): State<Arc<Server>>,
    Path((group, page_id)): Path<(String, PageId)>,
) -> Result<Json<Vec<PageSummary>>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || group.references(page_id)).await?))
}

pub async fn history(
    State(server): State<Arc<Server>>,
    Path((group, page_id)): Path<(String, PageId)>,
) -> Result<Json<Vec<RevisionSummary>>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || group.history(page_id)).await?))
}

pub async fn page_version(
    State(server): State<Arc<Server>>,
    Path((group, page_id, version)): Path<(String, PageId, u64)>,
) -> Result<Json<PageVersion>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || group.page_at(page_id, version)).await?))
}

pub async fn diff(
    State(server): State<Arc<Server>>,
    Path((group, page_id)): Path<(String, PageId)>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<DiffResponse>, ApiError> {
    let group = server.group(&group)?;
    let DiffQuery { from, to } = query;
    let patch = blocking(move || group.diff_versions(page_id, from, to)).await?;
    Ok(Json(DiffResponse { from, to, patch }))
}

pub async fn recent_changes(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
) -> Result<Json<Vec<PageSummary>>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || Ok(group.recent_changes())).await?))
}

pub async fn sidebar(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
) -> Result<Json<Sidebar>, ApiError> {
    let group = server.group(&group)?;
    let sidebar = blocking(move || {
        Ok(Sidebar {
            keypages: group.keypages(),
            recent_changes: group.sidebar_changes(),
            latest_change: group.latest_change_label(Utc::now())?,
        })
    })
    .await?;
    Ok(Json(sidebar))
}

pub async fn all_pages(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<PageSummary>>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || Ok(group.all_pages(query.number()))).await?))
}

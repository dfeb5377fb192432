use super::{blocking, PageQuery};
use crate::error::ApiError;
use crate::server::Server;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use wiki_core::{AppendOutcome, Attachment, FileId, PageId, Paginated, Upload, UploadOutcome};

/// Multipart field carrying uploaded files. May repeat.
const FILE_FIELD: &str = "wiki_file";

#[derive(Debug, Default, Deserialize)]
pub struct AppendQuery {
    pub current_version: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileQuery {
    pub filename: Option<String>,
}

async fn read_uploads(mut multipart: Multipart) -> Result<Vec<Upload>, ApiError> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ApiError::BadRequest("uploaded file has no name".into()))?;
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await?.to_vec();
        uploads.push(Upload {
            filename,
            mime_type,
            bytes,
        });
    }
    if uploads.is_empty() {
        return Err(ApiError::BadRequest(format!("no `{}` field in upload", FILE_FIELD)));
    }
    Ok(uploads)
}

pub async fn upload(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
    multipart: Multipart,
) -> Result<Json<UploadOutcome>, ApiError> {
    let group = server.group(&group)?;
    let uploads = read_uploads(multipart).await?;
    Ok(Json(blocking(move || group.upload_files(uploads)).await?))
}

pub async fn upload_to_page(
    State(server): State<Arc<Server>>,
    Path((group, page_id)): Path<(String, PageId)>,
    Query(query): Query<AppendQuery>,
    multipart: Multipart,
) -> Result<Json<AppendOutcome>, ApiError> {
    let group = server.group(&group)?;
    let uploads = read_uploads(multipart).await?;
    let outcome =
        blocking(move || group.append_uploads(page_id, query.current_version, uploads)).await?;
    Ok(Json(outcome))
}

/// `attachment` disposition with an ASCII fallback name and the exact name
/// percent-encoded per RFC 5987.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    )
}

pub async fn download(
    State(server): State<Arc<Server>>,
    Path((group, file_id)): Path<(String, FileId)>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let group = server.group(&group)?;
    let file = blocking(move || group.file(file_id, query.filename.as_deref())).await?;
    Ok((
        [
            (CONTENT_TYPE, file.mime_type),
            (CONTENT_DISPOSITION, content_disposition(&file.name)),
        ],
        file.bytes,
    )
        .into_response())
}

pub async fn all_files(
    State(server): State<Arc<Server>>,
    Path(group): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<Attachment>>, ApiError> {
    let group = server.group(&group)?;
    Ok(Json(blocking(move || Ok(group.all_files(query.number()))).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_server;
    use axum::http::StatusCode;

    fn seed_file(server: &Arc<Server>, name: &str) -> FileId {
        let group = server.group("main").unwrap();
        let outcome = group
            .upload_files(vec![Upload {
                filename: name.to_string(),
                mime_type: "text/plain".into(),
                bytes: b"contents".to_vec(),
            }])
            .unwrap();
        outcome.attachments[0].id
    }

    #[test]
    fn disposition_escapes_names() {
        assert_eq!(
            content_disposition("notes.txt"),
            "attachment; filename=\"notes.txt\"; filename*=UTF-8''notes.txt"
        );
        assert_eq!(
            content_disposition("résumé \"v2\".pdf"),
            "attachment; filename=\"r_sum_ _v2_.pdf\"; \
             filename*=UTF-8''r%C3%A9sum%C3%A9%20%22v2%22.pdf"
        );
    }

    #[tokio::test]
    async fn download_serves_bytes_and_headers() {
        let server = test_server();
        let id = seed_file(&server, "notes.txt");

        let response = download(
            State(server.clone()),
            Path(("main".into(), id)),
            Query(FileQuery {
                filename: Some("renamed.txt".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert!(response.headers()[CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("renamed.txt"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"contents");
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let server = test_server();
        let err = download(
            State(server),
            Path(("main".into(), 5)),
            Query(FileQuery::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn files_are_listed_per_group() {
        let server = test_server();
        seed_file(&server, "a.txt");
        seed_file(&server, "b.txt");

        let query = || Query(PageQuery::default());
        let Json(listing) = all_files(State(server.clone()), Path("main".into()), query())
            .await
            .unwrap();
        assert_eq!(listing.total, 2);

        let Json(other) = all_files(State(server), Path("physics".into()), query())
            .await
            .unwrap();
        assert_eq!(other.total, 0);
    }
}

use crate::api::{files, keypages, pages, search};
use crate::error::ApiError;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use wiki_core::{Group, Wiki};

pub struct Server {
    wiki: Wiki,
}

impl Server {
    pub fn new(wiki: Wiki) -> Self {
        Server { wiki }
    }

    pub fn group(&self, name: &str) -> Result<Arc<Group>, ApiError> {
        Ok(self.wiki.group(name)?)
    }

    pub fn routes(self: &Arc<Self>) -> Router {
        let upload_limit = DefaultBodyLimit::max(self.wiki.config().max_upload_bytes);
        Router::new()
            .route("/:group/home", get(pages::home))
            .route("/:group/page/:page_id", get(pages::get_page))
            .route("/:group/pages", post(pages::create_page))
            .route("/:group/edit/:page_id", post(pages::edit_page))
            .route("/:group/rename/:page_id", post(pages::rename_page))
            .route("/:group/reference/:page_id", get(pages::references))
            .route("/:group/history/:page_id", get(pages::history))
            .route("/:group/history/:page_id/:version", get(pages::page_version))
            .route("/:group/diff/:page_id", get(pages::diff))
            .route("/:group/changes", get(pages::recent_changes))
            .route("/:group/sidebar", get(pages::sidebar))
            .route("/:group/all-pages", get(pages::all_pages))
            .route("/:group/upload", post(files::upload).layer(upload_limit))
            .route(
                "/:group/upload/:page_id",
                post(files::upload_to_page).layer(upload_limit),
            )
            .route("/:group/file/:file_id", get(files::download))
            .route("/:group/all-files", get(files::all_files))
            .route("/:group/search", get(search::search))
            .route(
                "/:group/keypages",
                get(keypages::get_keypages).post(keypages::set_keypages),
            )
            .with_state(self.clone())
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, groups = ?self.wiki.group_names(), "Listening");
        axum::serve(listener, self.routes())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutting down");
}

#[cfg(test)]
pub(crate) fn test_config() -> wiki_core::WikiConfig {
    wiki_core::WikiConfig {
        groups: vec!["main".into(), "physics".into()],
        ..wiki_core::WikiConfig::default()
    }
}

#[cfg(test)]
pub(crate) fn test_server() -> Arc<Server> {
    test_server_with(test_config())
}

#[cfg(test)]
pub(crate) fn test_server_with(config: wiki_core::WikiConfig) -> Arc<Server> {
    Arc::new(Server::new(Wiki::in_memory(config).unwrap()))
}

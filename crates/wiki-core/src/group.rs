//! One wiki group: its state, snapshot, search index and file blobs.

use crate::blob_store::{BlobStore, FsBlobStore, MemoryBlobStore};
use crate::config::WikiConfig;
use crate::error::{Result, WikiError};
use crate::link_indexer;
use crate::render::{RenderContext, Renderer, TocEntry};
use crate::revision::RevisionSummary;
use crate::search_index::{IndexEntry, SearchIndex};
use crate::store::{
    Attachment, FileId, GroupState, GroupStore, Page, PageId, PageSummary, Paginated, HOME_PAGE_ID,
};
use crate::title_resolver::TitleResolver;
use crate::transaction::WikiTxn;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, RwLock, RwLockReadGuard};

pub struct Group {
    pub(crate) name: String,
    pub(crate) config: Arc<WikiConfig>,
    pub(crate) state: RwLock<GroupState>,
    /// `None` for in-memory groups.
    pub(crate) store: Option<GroupStore>,
    pub(crate) index: SearchIndex,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) renderer: Arc<dyn Renderer>,
}

/// A page as it was at an earlier version, rendered with today's titles.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PageVersion {
    pub page_id: PageId,
    pub title: String,
    pub version: u64,
    pub markup: String,
    pub html: String,
    pub toc: Vec<TocEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReindexSummary {
    pub pages: usize,
    /// Pages whose stored edges no longer matched their markup.
    pub relinked: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileDownload {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Group {
    /// Open a group under `config.data_dir`, seeding it on first use.
    pub fn open(name: &str, config: Arc<WikiConfig>, renderer: Arc<dyn Renderer>) -> Result<Self> {
        let dir = config.data_dir.join(name);
        let store = GroupStore::new(&dir)?;
        let state = match store.load()? {
            Some(state) => state,
            None => {
                let state = seed(name, &config, renderer.as_ref());
                store.save(&state)?;
                tracing::info!(group = name, dir = %dir.display(), "Seeded new group");
                state
            }
        };
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.join("files"))?);
        let index = SearchIndex::open(&dir.join("index"), config.index_memory_budget)?
            .with_weights(config.title_weight, config.body_weight);

        let group = Group {
            name: name.to_string(),
            config,
            state: RwLock::new(state),
            store: Some(store),
            index,
            blobs,
            renderer,
        };
        group.ensure_index_current()?;
        Ok(group)
    }

    /// A group that lives only in memory.
    pub fn in_memory(
        name: &str,
        config: Arc<WikiConfig>,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self> {
        let state = seed(name, &config, renderer.as_ref());
        let index = SearchIndex::new_in_memory()?
            .with_weights(config.title_weight, config.body_weight);
        let group = Group {
            name: name.to_string(),
            config,
            state: RwLock::new(state),
            store: None,
            index,
            blobs: Arc::new(MemoryBlobStore::new()),
            renderer,
        };
        group.ensure_index_current()?;
        Ok(group)
    }

    #[cfg(test)]
    pub(crate) fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WikiConfig {
        &self.config
    }

    /// Consistent read view of the committed state.
    pub fn read(&self) -> RwLockReadGuard<'_, GroupState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn transact(&self) -> WikiTxn<'_> {
        WikiTxn::begin(self)
    }

    /// Rebuild the search index when its last commit does not match the
    /// snapshot generation.
    fn ensure_index_current(&self) -> Result<()> {
        let state = self.read();
        let indexed = self.index.committed_generation()?;
        if indexed == Some(state.generation()) {
            return Ok(());
        }
        tracing::warn!(
            group = %self.name,
            indexed = ?indexed,
            generation = state.generation(),
            "Search index out of step with snapshot, rebuilding"
        );
        let entries: Vec<IndexEntry> = state.pages().map(IndexEntry::from).collect();
        self.index.rebuild(&entries, state.generation())?;
        Ok(())
    }

    /// Re-derive every page's reference edges from its markup, then rebuild
    /// the search index from the committed pages.
    pub fn reindex(&self) -> Result<ReindexSummary> {
        let mut txn = self.transact();
        let mut refreshed = txn.state().clone();
        let relinked = link_indexer::reindex_all_references(&mut refreshed, Utc::now());
        if relinked > 0 {
            *txn.state_mut() = refreshed;
        }
        txn.commit()?;

        let state = self.read();
        let entries: Vec<IndexEntry> = state.pages().map(IndexEntry::from).collect();
        self.index.rebuild(&entries, state.generation())?;
        Ok(ReindexSummary {
            pages: entries.len(),
            relinked,
        })
    }

    pub fn page(&self, id: PageId) -> Result<Page> {
        self.read().page(id).cloned()
    }

    pub fn page_by_title(&self, title: &str) -> Result<Page> {
        self.read().page_by_title(title).cloned()
    }

    pub fn references(&self, id: PageId) -> Result<Vec<PageSummary>> {
        self.read().referencing_pages(id)
    }

    pub fn history(&self, id: PageId) -> Result<Vec<RevisionSummary>> {
        let state = self.read();
        let page = state.page(id)?;
        Ok(state.revisions().history(page))
    }

    pub fn page_at(&self, id: PageId, version: u64) -> Result<PageVersion> {
        let state = self.read();
        let page = state.page(id)?;
        let markup = state.revisions().reconstruct(page, version)?;
        let rendered = self.renderer.render(
            &markup,
            &RenderContext {
                group: &self.name,
                titles: state.titles(),
                files: state.files(),
            },
        );
        Ok(PageVersion {
            page_id: id,
            title: page.title.clone(),
            version,
            markup,
            html: rendered.html,
            toc: rendered.toc,
        })
    }

    /// Unified diff text between two versions, empty when they are identical.
    pub fn diff_versions(&self, id: PageId, from: u64, to: u64) -> Result<String> {
        let state = self.read();
        let page = state.page(id)?;
        Ok(state
            .revisions()
            .diff_versions(page, from, to)?
            .map(|patch| patch.to_string())
            .unwrap_or_default())
    }

    pub fn recent_changes(&self) -> Vec<PageSummary> {
        self.read().recent_changes(self.config.changes_limit)
    }

    pub fn sidebar_changes(&self) -> Vec<PageSummary> {
        self.read().recent_changes(self.config.sidebar_changes)
    }

    pub fn keypages(&self) -> Vec<PageSummary> {
        self.read().keypages()
    }

    pub fn all_pages(&self, page: usize) -> Paginated<PageSummary> {
        self.read().all_pages(page, self.config.listing_page_size)
    }

    pub fn all_files(&self, page: usize) -> Paginated<Attachment> {
        self.read().all_files(page, self.config.listing_page_size)
    }

    /// Bytes of an attachment. `filename` overrides the stored name.
    pub fn file(&self, id: FileId, filename: Option<&str>) -> Result<FileDownload> {
        let attachment = self.read().file(id)?.clone();
        let bytes = self.blobs.get(&id.to_string()).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => WikiError::FileNotFound(id),
            _ => WikiError::Storage(e),
        })?;
        let name = filename
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or(attachment.name);
        Ok(FileDownload {
            name,
            mime_type: attachment.mime_type,
            bytes,
        })
    }

    /// Short label for the most recent change: `[HH:MM]` if it happened on
    /// the same local day as `now`, otherwise `[Mon DD]`.
    pub fn latest_change_label(&self, now: DateTime<Utc>) -> Result<Option<String>> {
        let offset = self.config.local_offset()?;
        let Some(latest) = self.read().recent_changes(1).into_iter().next() else {
            return Ok(None);
        };
        let changed = latest.modified_on.with_timezone(&offset);
        let today = now.with_timezone(&offset);
        let label = if changed.date_naive() == today.date_naive() {
            changed.format("[%H:%M]").to_string()
        } else {
            changed.format("[%b %d]").to_string()
        };
        Ok(Some(label))
    }
}

fn seed(name: &str, config: &WikiConfig, renderer: &dyn Renderer) -> GroupState {
    let rendered = renderer.render(
        "",
        &RenderContext {
            group: name,
            titles: &TitleResolver::new(),
            files: &BTreeMap::new(),
        },
    );
    GroupState::seeded(Page {
        id: HOME_PAGE_ID,
        title: config.home_title.clone(),
        markup: String::new(),
        html: rendered.html,
        toc: rendered.toc,
        current_version: 1,
        modified_on: Utc::now(),
    })
}

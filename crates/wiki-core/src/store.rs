//! Per-group state and its on-disk snapshot.
//!
//! A group's durable state is one [`GroupState`] value. Mutations clone it,
//! stage their changes on the clone and swap it in on commit; persistence
//! writes the whole snapshot to a temp file first and renames it into place
//! once every other step of the commit has succeeded.

use crate::error::{Result, WikiError};
use crate::link_indexer::ReferenceGraph;
use crate::link_parser::{FileKind, FileMarker};
use crate::render::TocEntry;
use crate::revision::RevisionStore;
use crate::title_resolver::TitleResolver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;

pub type PageId = u64;
pub type FileId = u64;

/// The page every group is seeded with. It can be edited but never renamed.
pub const HOME_PAGE_ID: PageId = 1;

const SNAPSHOT_FILE: &str = "wiki.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub title: String,
    pub markup: String,
    pub html: String,
    pub toc: Vec<TocEntry>,
    pub current_version: u64,
    pub modified_on: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: FileId,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub uploaded_on: DateTime<Utc>,
}

impl Attachment {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mime(&self.mime_type)
    }

    /// The token that embeds this attachment in page markup.
    pub fn marker(&self) -> FileMarker {
        FileMarker {
            kind: self.kind(),
            file_id: self.id,
        }
    }
}

/// Title plus timestamp, the shape used by listings and sidebars.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PageSummary {
    pub id: PageId,
    pub title: String,
    pub modified_on: DateTime<Utc>,
}

impl From<&Page> for PageSummary {
    fn from(page: &Page) -> Self {
        PageSummary {
            id: page.id,
            title: page.title.clone(),
            modified_on: page.modified_on,
        }
    }
}

/// One page of a listing. `page` is 1-based.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub page_count: usize,
}

impl<T> Paginated<T> {
    pub fn empty(page: usize, per_page: usize) -> Self {
        Paginated {
            items: Vec::new(),
            page: page.max(1),
            per_page,
            total: 0,
            page_count: 0,
        }
    }
}

/// Slice `items` into the requested page. Page numbers below 1 are treated as 1
/// and pages past the end come back empty with the real totals.
pub fn paginate<T>(items: Vec<T>, page: usize, per_page: usize) -> Paginated<T> {
    let page = page.max(1);
    let per_page = per_page.max(1);
    let total = items.len();
    let page_count = total.div_ceil(per_page);
    let items = items
        .into_iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .collect();
    Paginated {
        items,
        page,
        per_page,
        total,
        page_count,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub(crate) pages: BTreeMap<PageId, Page>,
    pub(crate) revisions: RevisionStore,
    pub(crate) references: ReferenceGraph,
    pub(crate) files: BTreeMap<FileId, Attachment>,
    pub(crate) keypages: Vec<PageId>,
    pub(crate) next_page_id: PageId,
    pub(crate) next_file_id: FileId,
    /// Bumped by every committed mutation; mirrored into the search index
    /// commit payload so drift between the two can be detected on open.
    pub(crate) generation: u64,
    #[serde(skip)]
    pub(crate) titles: TitleResolver,
}

impl GroupState {
    /// A fresh group holding only the home page.
    pub fn seeded(home: Page) -> Self {
        let mut state = GroupState {
            next_page_id: home.id + 1,
            next_file_id: 1,
            ..GroupState::default()
        };
        state.pages.insert(home.id, home);
        state.rebuild_derived();
        state
    }

    /// Recompute the maps that are not part of the snapshot.
    pub fn rebuild_derived(&mut self) {
        self.titles.rebuild(&self.pages);
        self.references.rebuild_backlinks();
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn page(&self, id: PageId) -> Result<&Page> {
        self.pages.get(&id).ok_or(WikiError::PageNotFound(id))
    }

    pub fn page_by_title(&self, title: &str) -> Result<&Page> {
        self.titles
            .resolve(title)
            .and_then(|id| self.pages.get(&id))
            .ok_or_else(|| WikiError::TitleNotFound(title.to_string()))
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn titles(&self) -> &TitleResolver {
        &self.titles
    }

    pub fn references(&self) -> &ReferenceGraph {
        &self.references
    }

    pub fn revisions(&self) -> &RevisionStore {
        &self.revisions
    }

    pub fn file(&self, id: FileId) -> Result<&Attachment> {
        self.files.get(&id).ok_or(WikiError::FileNotFound(id))
    }

    pub fn files(&self) -> &BTreeMap<FileId, Attachment> {
        &self.files
    }

    pub fn keypages(&self) -> Vec<PageSummary> {
        self.keypages
            .iter()
            .filter_map(|id| self.pages.get(id))
            .map(PageSummary::from)
            .collect()
    }

    /// Pages whose markup currently links to `id`, ordered by title.
    pub fn referencing_pages(&self, id: PageId) -> Result<Vec<PageSummary>> {
        self.page(id)?;
        let mut pages: Vec<PageSummary> = self
            .references
            .in_edges(id)
            .into_iter()
            .filter_map(|source| self.pages.get(&source))
            .map(PageSummary::from)
            .collect();
        pages.sort_by(|a, b| a.title.cmp(&b.title));
        Ok(pages)
    }

    /// The most recently modified pages, newest first.
    pub fn recent_changes(&self, limit: usize) -> Vec<PageSummary> {
        let mut pages: Vec<&Page> = self.pages.values().collect();
        pages.sort_by(|a, b| b.modified_on.cmp(&a.modified_on).then(b.id.cmp(&a.id)));
        pages.into_iter().take(limit).map(PageSummary::from).collect()
    }

    /// Every page in creation (id) order.
    pub fn all_pages(&self, page: usize, per_page: usize) -> Paginated<PageSummary> {
        let pages: Vec<PageSummary> = self.pages.values().map(PageSummary::from).collect();
        paginate(pages, page, per_page)
    }

    /// Every attachment in upload (id) order.
    pub fn all_files(&self, page: usize, per_page: usize) -> Paginated<Attachment> {
        paginate(self.files.values().cloned().collect(), page, per_page)
    }

    /// Markup of `id` as it was at `version`, replayed from the revision log.
    pub fn reconstruct(&self, id: PageId, version: u64) -> Result<String> {
        self.revisions.reconstruct(self.page(id)?, version)
    }
}

/// Snapshot file of one group.
#[derive(Debug, Clone)]
pub struct GroupStore {
    dir: PathBuf,
}

/// A snapshot written to a temp file next to its destination, not yet visible.
pub struct PreparedSnapshot {
    file: NamedTempFile,
}

impl GroupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(GroupStore { dir })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Load the last committed snapshot, or `None` for a group never written.
    pub fn load(&self) -> Result<Option<GroupState>> {
        let file = match fs::File::open(self.snapshot_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut state: GroupState = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        state.rebuild_derived();
        tracing::debug!(
            dir = %self.dir.display(),
            pages = state.pages.len(),
            generation = state.generation,
            "Loaded group snapshot"
        );
        Ok(Some(state))
    }

    pub fn prepare(&self, state: &GroupState) -> Result<PreparedSnapshot> {
        let file = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(file.as_file());
            serde_json::to_writer(&mut writer, state)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer.flush()?;
        }
        file.as_file().sync_all()?;
        Ok(PreparedSnapshot { file })
    }

    /// Write `state` in one step, for seeding and offline maintenance.
    pub fn save(&self, state: &GroupState) -> Result<()> {
        self.prepare(state)?.persist(self)
    }
}

impl PreparedSnapshot {
    /// Atomically replace the group's snapshot with this one.
    pub fn persist(self, store: &GroupStore) -> Result<()> {
        self.file
            .persist(store.snapshot_path())
            .map_err(|e| WikiError::Storage(e.error))?;
        Ok(())
    }
}

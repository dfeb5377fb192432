//! Staged, all-or-nothing mutation of one group.
//!
//! A [`WikiTxn`] holds the group's write lock for its whole life and works on
//! a private copy of the state. Nothing is visible to readers until
//! [`WikiTxn::commit`] has written the snapshot, committed the search index
//! and swapped the copy in. Dropping an uncommitted transaction discards the
//! copy and removes any blobs it uploaded.

use crate::error::{Result, WikiError};
use crate::group::Group;
use crate::render::{RenderContext, Rendered};
use crate::search_index::IndexEntry;
use crate::store::{FileId, GroupState, PageId};
use std::collections::BTreeSet;
use std::sync::RwLockWriteGuard;

/// How far a mutation got. Reported by [`WikiError::TransactionAborted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MutationStep {
    Start,
    PatchComputed,
    RevisionArchived,
    EdgesRefreshed,
    IndexSynced,
    PageCommitted,
}

pub struct WikiTxn<'g> {
    group: &'g Group,
    committed: RwLockWriteGuard<'g, GroupState>,
    staged: GroupState,
    reindex: BTreeSet<PageId>,
    new_blobs: Vec<FileId>,
    step: MutationStep,
    dirty: bool,
    finished: bool,
}

impl<'g> WikiTxn<'g> {
    pub(crate) fn begin(group: &'g Group) -> Self {
        let committed = group.state.write().unwrap_or_else(|e| e.into_inner());
        let staged = committed.clone();
        WikiTxn {
            group,
            committed,
            staged,
            reindex: BTreeSet::new(),
            new_blobs: Vec::new(),
            step: MutationStep::Start,
            dirty: false,
            finished: false,
        }
    }

    pub fn state(&self) -> &GroupState {
        &self.staged
    }

    pub(crate) fn state_mut(&mut self) -> &mut GroupState {
        self.dirty = true;
        &mut self.staged
    }

    pub fn step(&self) -> MutationStep {
        self.step
    }

    pub(crate) fn advance(&mut self, step: MutationStep) {
        self.step = self.step.max(step);
    }

    /// Queue `page_id` for re-indexing at commit.
    pub(crate) fn reindex(&mut self, page_id: PageId) {
        self.reindex.insert(page_id);
    }

    pub(crate) fn render(&self, markup: &str) -> Rendered {
        let ctx = RenderContext {
            group: &self.group.name,
            titles: &self.staged.titles,
            files: &self.staged.files,
        };
        self.group.renderer.render(markup, &ctx)
    }

    /// Re-render a staged page from its current markup.
    pub(crate) fn rerender(&mut self, page_id: PageId) -> Result<()> {
        let markup = self.staged.page(page_id)?.markup.clone();
        let rendered = self.render(&markup);
        if let Some(page) = self.state_mut().pages.get_mut(&page_id) {
            page.html = rendered.html;
            page.toc = rendered.toc;
        }
        Ok(())
    }

    /// Store uploaded bytes. Removed again if the transaction does not commit.
    pub(crate) fn put_blob(&mut self, id: FileId, bytes: &[u8]) -> Result<()> {
        self.group
            .blobs
            .put(&id.to_string(), bytes)
            .map_err(|e| WikiError::aborted(self.step, e))?;
        self.new_blobs.push(id);
        self.dirty = true;
        Ok(())
    }

    /// Make the staged state durable and visible.
    ///
    /// Order: snapshot to a temp file, commit the search index, rename the
    /// snapshot into place, swap the in-memory state. A failure before the
    /// rename leaves the previous snapshot and index in force.
    pub fn commit(mut self) -> Result<()> {
        if !self.dirty {
            self.finished = true;
            return Ok(());
        }

        let generation = self.committed.generation + 1;
        self.staged.generation = generation;

        let prepared = match &self.group.store {
            Some(store) => Some(
                store
                    .prepare(&self.staged)
                    .map_err(|e| WikiError::aborted(self.step, e))?,
            ),
            None => None,
        };

        let entries: Vec<IndexEntry> = self
            .reindex
            .iter()
            .filter_map(|id| self.staged.pages.get(id))
            .map(IndexEntry::from)
            .collect();
        self.group
            .index
            .sync(&entries, &[], generation)
            .map_err(|e| WikiError::aborted(self.step, e))?;
        self.advance(MutationStep::IndexSynced);

        if let (Some(prepared), Some(store)) = (prepared, &self.group.store) {
            if let Err(e) = prepared.persist(store) {
                self.restore_index();
                return Err(WikiError::aborted(self.step, e));
            }
        }

        *self.committed = std::mem::take(&mut self.staged);
        self.advance(MutationStep::PageCommitted);
        self.finished = true;
        tracing::debug!(
            group = %self.group.name,
            generation,
            reindexed = self.reindex.len(),
            blobs = self.new_blobs.len(),
            "Committed transaction"
        );
        Ok(())
    }

    /// Put the index entries touched by this transaction back to their
    /// committed contents.
    fn restore_index(&self) {
        let previous: Vec<IndexEntry> = self
            .reindex
            .iter()
            .filter_map(|id| self.committed.pages.get(id))
            .map(IndexEntry::from)
            .collect();
        let created: Vec<PageId> = self
            .reindex
            .iter()
            .filter(|id| !self.committed.pages.contains_key(id))
            .copied()
            .collect();
        if let Err(e) = self
            .group
            .index
            .sync(&previous, &created, self.committed.generation)
        {
            // Caught on the next open: the index generation will not match.
            tracing::error!(group = %self.group.name, error = %e, "Failed to restore search index");
        }
    }
}

impl Drop for WikiTxn<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        for id in &self.new_blobs {
            if let Err(e) = self.group.blobs.remove(&id.to_string()) {
                tracing::warn!(
                    group = %self.group.name,
                    file = id,
                    error = %e,
                    "Failed to remove orphaned blob"
                );
            }
        }
        if self.dirty {
            tracing::info!(group = %self.group.name, step = ?self.step, "Rolled back transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, MemoryBlobStore};
    use crate::config::WikiConfig;
    use crate::mutation::Upload;
    use crate::render::BasicRenderer;
    use crate::store::HOME_PAGE_ID;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    fn group_with_blobs() -> (Group, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let config = Arc::new(WikiConfig::default());
        let group = Group::in_memory("main", config, Arc::new(BasicRenderer))
            .unwrap()
            .with_blob_store(blobs.clone());
        (group, blobs)
    }

    #[test]
    fn clean_commit_keeps_generation() {
        let (group, _) = group_with_blobs();
        let before = group.read().generation();
        group.transact().commit().unwrap();
        assert_eq!(group.read().generation(), before);
    }

    #[test]
    fn commit_bumps_generation_and_index_payload() {
        let (group, _) = group_with_blobs();
        let mut txn = group.transact();
        txn.state_mut().keypages = vec![1];
        txn.commit().unwrap();

        let generation = group.read().generation();
        assert_eq!(generation, 1);
        assert_eq!(group.index.committed_generation().unwrap(), Some(generation));
    }

    #[test]
    fn dropped_transaction_discards_state_and_blobs() {
        let (group, blobs) = group_with_blobs();
        let before = group.read().clone();
        {
            let mut txn = group.transact();
            txn.put_blob(9, b"bytes").unwrap();
            txn.state_mut().next_file_id = 10;
            assert_eq!(blobs.len(), 1);
        }
        assert!(blobs.is_empty());
        assert_eq!(*group.read(), before);
    }

    fn upload(name: &str) -> Upload {
        Upload {
            filename: name.to_string(),
            mime_type: "text/plain".to_string(),
            bytes: name.as_bytes().to_vec(),
        }
    }

    fn search_ids(group: &Group, query: &str) -> Vec<PageId> {
        group
            .index
            .search(query, 10)
            .unwrap()
            .into_iter()
            .map(|hit| hit.page_id)
            .collect()
    }

    fn on_disk(dir: &Path) -> Group {
        let config = WikiConfig {
            data_dir: dir.to_path_buf(),
            ..WikiConfig::default()
        };
        Group::open("main", Arc::new(config), Arc::new(BasicRenderer)).unwrap()
    }

    /// Put a non-empty directory where the snapshot goes, so the final
    /// rename of a commit fails.
    fn block_snapshot(group: &Group) {
        let path = group.store.as_ref().unwrap().snapshot_path();
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("occupied"), b"x").unwrap();
    }

    #[test]
    fn index_failure_leaves_state_blobs_and_index() {
        let (group, blobs) = group_with_blobs();
        group.edit_page(HOME_PAGE_ID, 1, "aurora").unwrap();
        let before = group.read().clone();
        let generation = group.index.committed_generation().unwrap();

        group.index.refuse_commits(true);
        let err = group
            .append_uploads(HOME_PAGE_ID, Some(2), vec![upload("borealis.txt")])
            .unwrap_err();
        assert!(matches!(
            err,
            WikiError::TransactionAborted {
                step: MutationStep::EdgesRefreshed,
                ..
            }
        ));
        assert_eq!(*group.read(), before);
        assert!(blobs.is_empty());
        assert_eq!(group.index.committed_generation().unwrap(), generation);

        group.index.refuse_commits(false);
        assert_eq!(search_ids(&group, "aurora"), vec![HOME_PAGE_ID]);
        assert!(search_ids(&group, "borealis").is_empty());
        group.edit_page(HOME_PAGE_ID, 2, "aurora again").unwrap();
        assert_eq!(group.read().generation(), before.generation() + 1);
    }

    #[test]
    fn snapshot_failure_restores_index() {
        let dir = tempfile::tempdir().unwrap();
        let group = on_disk(dir.path());
        let beta = group.create_page("Beta").unwrap();
        group.edit_page(beta.id, 1, "nebula").unwrap();
        let before = group.read().clone();
        let generation = group.index.committed_generation().unwrap();

        block_snapshot(&group);
        let err = group.edit_page(beta.id, 2, "quasar").unwrap_err();
        assert!(matches!(
            err,
            WikiError::TransactionAborted {
                step: MutationStep::IndexSynced,
                ..
            }
        ));
        assert_eq!(*group.read(), before);
        assert_eq!(search_ids(&group, "nebula"), vec![beta.id]);
        assert!(search_ids(&group, "quasar").is_empty());
        assert_eq!(group.index.committed_generation().unwrap(), generation);
    }

    #[test]
    fn snapshot_failure_drops_new_pages_from_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let group = on_disk(dir.path());
        let docs = group.index.num_docs();

        block_snapshot(&group);
        assert!(group.create_page("Pulsar").is_err());
        assert!(group.read().page_by_title("Pulsar").is_err());
        assert!(search_ids(&group, "pulsar").is_empty());
        assert_eq!(group.index.num_docs(), docs);
    }

    #[test]
    fn snapshot_failure_removes_uploaded_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let group = on_disk(dir.path());
        let before = group.read().clone();

        block_snapshot(&group);
        assert!(group.upload_files(vec![upload("a.txt"), upload("b.txt")]).is_err());
        assert_eq!(*group.read(), before);
        assert!(group.blobs.get("1").is_err());
        assert!(group.blobs.get("2").is_err());
        assert!(fs::read_dir(dir.path().join("main").join("files"))
            .unwrap()
            .next()
            .is_none());
    }

    #[test]
    fn steps_only_move_forward() {
        let (group, _) = group_with_blobs();
        let mut txn = group.transact();
        txn.advance(MutationStep::RevisionArchived);
        txn.advance(MutationStep::PatchComputed);
        assert_eq!(txn.step(), MutationStep::RevisionArchived);
    }
}

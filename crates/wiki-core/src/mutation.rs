//! Page mutations. Each one runs inside a single [`WikiTxn`]: either every
//! effect (page row, revision, edges, index entry, blobs) lands, or none does.

use crate::diff::compute_patch;
use crate::error::{Result, WikiError};
use crate::group::Group;
use crate::link_indexer::{cascade_rename, index_page, relink_mentions};
use crate::link_parser::{extract_file_markers, validate_title};
use crate::store::{Attachment, FileId, Page, PageId, PageSummary, HOME_PAGE_ID};
use crate::transaction::{MutationStep, WikiTxn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// One uploaded file as received from the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EditOutcome {
    pub page: Page,
    /// False when the submitted markup equalled the stored markup.
    pub changed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub attachments: Vec<Attachment>,
    /// Markers for the uploaded files, ready to paste into a page.
    pub markup_snippet: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AppendOutcome {
    pub page: Page,
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RenameOutcome {
    pub page: Page,
    pub rewritten_pages: Vec<PageId>,
    pub rewritten_revisions: usize,
}

impl WikiTxn<'_> {
    /// Replace a page's markup: archive the outgoing version, refresh its
    /// edges, re-render and advance the version by `bump`.
    ///
    /// Returns false, touching nothing, when the markup is unchanged.
    fn commit_markup(
        &mut self,
        page_id: PageId,
        markup: String,
        bump: u64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let page = self.state().page(page_id)?;
        let (version, modified_on) = (page.current_version, page.modified_on);
        let Some(patch) = compute_patch(&page.markup, &markup) else {
            return Ok(false);
        };
        self.advance(MutationStep::PatchComputed);

        self.state_mut()
            .revisions
            .archive(page_id, version, &patch, modified_on)?;
        self.advance(MutationStep::RevisionArchived);

        let rendered = self.render(&markup);
        if let Some(page) = self.state_mut().pages.get_mut(&page_id) {
            page.markup = markup;
            page.html = rendered.html;
            page.toc = rendered.toc;
            page.current_version = version + bump;
            page.modified_on = now;
        }
        self.reindex(page_id);

        index_page(self.state_mut(), page_id, now);
        self.advance(MutationStep::EdgesRefreshed);
        Ok(true)
    }

    /// Register an upload: allocate its id, store its bytes and record it.
    fn store_upload(&mut self, upload: Upload, now: DateTime<Utc>) -> Result<Attachment> {
        let id = self.state().next_file_id;
        self.put_blob(id, &upload.bytes)?;
        let attachment = Attachment {
            id,
            name: upload.filename,
            mime_type: upload.mime_type,
            size: upload.bytes.len() as u64,
            uploaded_on: now,
        };
        let state = self.state_mut();
        state.next_file_id = id + 1;
        state.files.insert(id, attachment.clone());
        Ok(attachment)
    }

    /// Re-render pages whose markup already carries a marker for one of
    /// `files`, so a `[file:N]` written before the upload stops rendering as
    /// missing.
    fn rerender_file_mentions(&mut self, files: &BTreeSet<FileId>) -> Result<Vec<PageId>> {
        let mentioning: Vec<PageId> = self
            .state()
            .pages()
            .filter(|page| {
                extract_file_markers(&page.markup)
                    .iter()
                    .any(|found| files.contains(&found.marker.file_id))
            })
            .map(|page| page.id)
            .collect();
        for id in &mentioning {
            self.rerender(*id)?;
        }
        Ok(mentioning)
    }

    /// Link earlier mentions of a page that just got `title`, and re-render
    /// the pages that gained a link.
    fn link_new_title(
        &mut self,
        page_id: PageId,
        title: &str,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<PageId>> {
        let gained = relink_mentions(self.state_mut(), page_id, title, now);
        for source in &gained {
            self.rerender(*source)?;
        }
        Ok(gained)
    }
}

fn markers_snippet(attachments: &[Attachment]) -> String {
    attachments
        .iter()
        .map(|a| format!("\n\n{}", a.marker()))
        .collect()
}

impl Group {
    /// Create an empty page titled `title` at version 1.
    pub fn create_page(&self, title: &str) -> Result<Page> {
        let title = validate_title(title)?;
        let mut txn = self.transact();
        if txn.state().titles.contains_title(title) {
            return Err(WikiError::DuplicateTitle(title.to_string()));
        }

        let now = Utc::now();
        let id = txn.state().next_page_id;
        let rendered = txn.render("");
        let page = Page {
            id,
            title: title.to_string(),
            markup: String::new(),
            html: rendered.html,
            toc: rendered.toc,
            current_version: 1,
            modified_on: now,
        };
        let state = txn.state_mut();
        state.next_page_id = id + 1;
        state.pages.insert(id, page.clone());
        state.titles.upsert(id, title);
        txn.reindex(id);
        txn.link_new_title(id, title, now)?;
        txn.commit()?;

        tracing::info!(group = %self.name, page = id, title, "Created page");
        Ok(page)
    }

    /// Replace a page's markup, provided nobody committed since `expected_version`.
    pub fn edit_page(
        &self,
        page_id: PageId,
        expected_version: u64,
        markup: &str,
    ) -> Result<EditOutcome> {
        let mut txn = self.transact();
        let current = txn.state().page(page_id)?.current_version;
        if current != expected_version {
            tracing::warn!(
                group = %self.name,
                page = page_id,
                expected = expected_version,
                current,
                "Rejected stale edit"
            );
            return Err(WikiError::VersionConflict {
                page: page_id,
                expected: expected_version,
                current,
            });
        }

        let changed = txn.commit_markup(page_id, markup.to_string(), 1, Utc::now())?;
        let page = txn.state().page(page_id)?.clone();
        txn.commit()?;

        if changed {
            tracing::info!(
                group = %self.name,
                page = page_id,
                version = page.current_version,
                "Edited page"
            );
        } else {
            tracing::debug!(group = %self.name, page = page_id, "Edit left markup unchanged");
        }
        Ok(EditOutcome { page, changed })
    }

    /// Store files without attaching them to a page.
    pub fn upload_files(&self, uploads: Vec<Upload>) -> Result<UploadOutcome> {
        let mut txn = self.transact();
        let now = Utc::now();
        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in uploads {
            attachments.push(txn.store_upload(upload, now)?);
        }
        let ids: BTreeSet<FileId> = attachments.iter().map(|a| a.id).collect();
        let rerendered = txn.rerender_file_mentions(&ids)?;
        txn.commit()?;

        tracing::info!(
            group = %self.name,
            files = attachments.len(),
            rerendered = rerendered.len(),
            "Uploaded files"
        );
        Ok(UploadOutcome {
            markup_snippet: markers_snippet(&attachments),
            attachments,
        })
    }

    /// Store files and append their markers to a page.
    ///
    /// `expected_version`, when given, is checked like an edit. How far the
    /// version advances follows the configured upload policy.
    pub fn append_uploads(
        &self,
        page_id: PageId,
        expected_version: Option<u64>,
        uploads: Vec<Upload>,
    ) -> Result<AppendOutcome> {
        let mut txn = self.transact();
        let page = txn.state().page(page_id)?;
        let current = page.current_version;
        if let Some(expected) = expected_version.filter(|v| *v != current) {
            return Err(WikiError::VersionConflict {
                page: page_id,
                expected,
                current,
            });
        }
        if uploads.is_empty() {
            return Ok(AppendOutcome {
                page: page.clone(),
                attachments: Vec::new(),
            });
        }

        let now = Utc::now();
        let count = uploads.len();
        let mut attachments = Vec::with_capacity(count);
        for upload in uploads {
            attachments.push(txn.store_upload(upload, now)?);
        }
        let ids: BTreeSet<FileId> = attachments.iter().map(|a| a.id).collect();
        txn.rerender_file_mentions(&ids)?;
        let previous = &txn.state().page(page_id)?.markup;
        let markup = format!("{}{}", previous, markers_snippet(&attachments));
        let bump = self.config.upload_version_policy.increment(count);
        txn.commit_markup(page_id, markup, bump, now)?;
        let page = txn.state().page(page_id)?.clone();
        txn.commit()?;

        tracing::info!(
            group = %self.name,
            page = page_id,
            files = count,
            version = page.current_version,
            "Appended uploads to page"
        );
        Ok(AppendOutcome { page, attachments })
    }

    /// Give a page a new title and rewrite every link to it.
    pub fn rename_page(&self, page_id: PageId, new_title: &str) -> Result<RenameOutcome> {
        let new_title = validate_title(new_title)?;
        let mut txn = self.transact();
        let old_title = txn.state().page(page_id)?.title.clone();
        if page_id == HOME_PAGE_ID {
            return Err(WikiError::HomePageRename);
        }
        if old_title == new_title {
            return Err(WikiError::TitleUnchanged);
        }
        if txn.state().titles.contains_title(new_title) {
            return Err(WikiError::DuplicateTitle(new_title.to_string()));
        }

        let now = Utc::now();
        let referencing = txn.state().references.in_edges(page_id);
        let strategy = self.config.rename_strategy;
        let cascade = cascade_rename(txn.state_mut(), page_id, &old_title, new_title, strategy)?;
        txn.advance(MutationStep::RevisionArchived);

        let state = txn.state_mut();
        if let Some(page) = state.pages.get_mut(&page_id) {
            page.title = new_title.to_string();
        }
        state.titles.upsert(page_id, new_title);
        txn.reindex(page_id);

        // Referencing pages the cascade left alone now point at a title that
        // no longer exists, so they need their edges and html refreshed too.
        for id in &cascade.rewritten_pages {
            txn.reindex(*id);
        }
        for id in referencing.union(&cascade.rewritten_pages) {
            index_page(txn.state_mut(), *id, now);
            txn.rerender(*id)?;
        }
        txn.link_new_title(page_id, new_title, now)?;
        txn.advance(MutationStep::EdgesRefreshed);

        let page = txn.state().page(page_id)?.clone();
        txn.commit()?;

        tracing::info!(
            group = %self.name,
            page = page_id,
            old_title = %old_title,
            new_title,
            rewritten_pages = cascade.rewritten_pages.len(),
            rewritten_revisions = cascade.rewritten_revisions,
            "Renamed page"
        );
        Ok(RenameOutcome {
            page,
            rewritten_pages: cascade.rewritten_pages.into_iter().collect(),
            rewritten_revisions: cascade.rewritten_revisions,
        })
    }

    /// Replace the key page list from newline-separated titles.
    ///
    /// Unknown titles are skipped and repeats keep their first position.
    pub fn set_keypages(&self, titles: &str) -> Result<Vec<PageSummary>> {
        let mut txn = self.transact();
        let mut ids: Vec<PageId> = Vec::new();
        for line in titles.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match txn.state().titles.resolve(line) {
                Some(id) if !ids.contains(&id) => ids.push(id),
                Some(_) => {}
                None => {
                    tracing::debug!(group = %self.name, title = line, "Skipping unknown key page")
                }
            }
        }
        if txn.state().keypages != ids {
            txn.state_mut().keypages = ids;
        }
        let keypages = txn.state().keypages();
        txn.commit()?;
        Ok(keypages)
    }
}

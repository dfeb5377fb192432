//! Append-only revision log.
//!
//! Revision `v` of a page stores the patch that turns the page's markup at
//! version `v` into its markup at the next archived version. Every page
//! starts at version 1 with empty markup, so replaying the log forward from
//! `""` reconstructs any archived version, and replaying all of it yields the
//! current markup.

use crate::diff::{apply_patch, compute_patch, Patch};
use crate::error::{Result, WikiError};
use crate::store::{Page, PageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub page_id: PageId,
    pub version: u64,
    /// Unified diff text, see [`Patch`]. Empty for a no-op step.
    pub patch: String,
    /// When `version` was committed.
    pub modified_on: DateTime<Utc>,
}

impl Revision {
    fn parse_patch(&self) -> Result<Option<Patch>> {
        if self.patch.is_empty() {
            return Ok(None);
        }
        self.patch
            .parse::<Patch>()
            .map(Some)
            .map_err(|_| WikiError::HistoryCorrupt {
                page: self.page_id,
                version: self.version,
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RevisionSummary {
    pub version: u64,
    pub modified_on: DateTime<Utc>,
    pub lines_added: usize,
    pub lines_removed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionStore {
    by_page: BTreeMap<PageId, Vec<Revision>>,
}

impl RevisionStore {
    /// Record the patch that moved `page_id` off `version`.
    ///
    /// Versions must be appended in increasing order.
    pub fn archive(
        &mut self,
        page_id: PageId,
        version: u64,
        patch: &Patch,
        modified_on: DateTime<Utc>,
    ) -> Result<()> {
        let log = self.by_page.entry(page_id).or_default();
        if log.last().is_some_and(|last| last.version >= version) {
            return Err(WikiError::HistoryCorrupt {
                page: page_id,
                version,
            });
        }
        log.push(Revision {
            page_id,
            version,
            patch: patch.to_string(),
            modified_on,
        });
        Ok(())
    }

    pub fn revisions(&self, page_id: PageId) -> &[Revision] {
        self.by_page.get(&page_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_page.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Archived versions of a page plus its current one, newest first.
    pub fn history(&self, page: &Page) -> Vec<RevisionSummary> {
        let mut summaries = vec![RevisionSummary {
            version: page.current_version,
            modified_on: page.modified_on,
            lines_added: 0,
            lines_removed: 0,
        }];
        for rev in self.revisions(page.id).iter().rev() {
            // Stats describe the change that produced the next version.
            let (added, removed) = rev
                .parse_patch()
                .ok()
                .flatten()
                .map(|p| p.line_stats())
                .unwrap_or_default();
            if let Some(newer) = summaries.last_mut() {
                newer.lines_added = added;
                newer.lines_removed = removed;
            }
            summaries.push(RevisionSummary {
                version: rev.version,
                modified_on: rev.modified_on,
                lines_added: 0,
                lines_removed: 0,
            });
        }
        summaries
    }

    /// Markup of `page` at `version`.
    ///
    /// Fails with `RevisionNotFound` for versions that were never archived
    /// (including the gaps left by multi-file uploads) and with
    /// `HistoryCorrupt` when a patch no longer applies or the replay does not
    /// land on the current markup.
    pub fn reconstruct(&self, page: &Page, version: u64) -> Result<String> {
        let mut body = String::new();
        for rev in self.revisions(page.id) {
            if rev.version == version {
                return Ok(body);
            }
            if rev.version > version {
                break;
            }
            body = self.step(&body, rev)?;
        }
        if version != page.current_version {
            return Err(WikiError::RevisionNotFound {
                page: page.id,
                version,
            });
        }
        if body != page.markup {
            return Err(WikiError::HistoryCorrupt {
                page: page.id,
                version,
            });
        }
        Ok(body)
    }

    /// Markup at every archived version followed by the current markup.
    pub fn reconstruct_all(&self, page: &Page) -> Result<Vec<String>> {
        let log = self.revisions(page.id);
        let mut bodies = Vec::with_capacity(log.len() + 1);
        let mut body = String::new();
        for rev in log {
            let next = self.step(&body, rev)?;
            bodies.push(std::mem::replace(&mut body, next));
        }
        if body != page.markup {
            return Err(WikiError::HistoryCorrupt {
                page: page.id,
                version: page.current_version,
            });
        }
        bodies.push(body);
        Ok(bodies)
    }

    /// Patch between two versions of a page, `None` when they are identical.
    pub fn diff_versions(&self, page: &Page, from: u64, to: u64) -> Result<Option<Patch>> {
        let old = self.reconstruct(page, from)?;
        let new = self.reconstruct(page, to)?;
        Ok(compute_patch(&old, &new))
    }

    /// Substitute `old` with `new` in every stored patch. Returns the pages
    /// whose history changed and how many revisions were touched.
    pub fn rewrite_text(&mut self, old: &str, new: &str) -> (BTreeSet<PageId>, usize) {
        let mut pages = BTreeSet::new();
        let mut count = 0;
        for (page_id, log) in self.by_page.iter_mut() {
            for rev in log.iter_mut().filter(|rev| rev.patch.contains(old)) {
                rev.patch = rev.patch.replace(old, new);
                pages.insert(*page_id);
                count += 1;
            }
        }
        (pages, count)
    }

    /// Re-diff a page's history from a new sequence of bodies.
    ///
    /// `bodies` holds one entry per archived version followed by the current
    /// markup, as returned by [`reconstruct_all`](Self::reconstruct_all).
    /// Version numbers and timestamps are kept. Returns how many patches changed.
    pub fn replace_history(&mut self, page_id: PageId, bodies: &[String]) -> usize {
        let Some(log) = self.by_page.get_mut(&page_id) else {
            return 0;
        };
        let mut changed = 0;
        for (rev, pair) in log.iter_mut().zip(bodies.windows(2)) {
            let patch = compute_patch(&pair[0], &pair[1])
                .map(|p| p.to_string())
                .unwrap_or_default();
            if patch != rev.patch {
                rev.patch = patch;
                changed += 1;
            }
        }
        changed
    }

    fn step(&self, body: &str, rev: &Revision) -> Result<String> {
        match rev.parse_patch()? {
            None => Ok(body.to_string()),
            Some(patch) => apply_patch(body, &patch).map_err(|e| {
                tracing::warn!(
                    page = rev.page_id,
                    version = rev.version,
                    error = %e,
                    "Patch does not apply"
                );
                WikiError::HistoryCorrupt {
                    page: rev.page_id,
                    version: rev.version,
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    /// Build a page and its log by committing each body in turn.
    fn page_with_history(bodies: &[&str]) -> (Page, RevisionStore) {
        let mut store = RevisionStore::default();
        let mut page = Page {
            id: 2,
            title: "Beta".into(),
            markup: String::new(),
            html: String::new(),
            toc: Vec::new(),
            current_version: 1,
            modified_on: at(0),
        };
        for (i, body) in bodies.iter().enumerate() {
            let patch = compute_patch(&page.markup, body).unwrap();
            store
                .archive(page.id, page.current_version, &patch, page.modified_on)
                .unwrap();
            page.markup = body.to_string();
            page.current_version += 1;
            page.modified_on = at(i as i64 + 1);
        }
        (page, store)
    }

    #[test]
    fn reconstructs_every_version() {
        let (page, store) = page_with_history(&["one", "one\ntwo", "two\nthree\n"]);
        assert_eq!(page.current_version, 4);
        assert_eq!(store.reconstruct(&page, 1).unwrap(), "");
        assert_eq!(store.reconstruct(&page, 2).unwrap(), "one");
        assert_eq!(store.reconstruct(&page, 3).unwrap(), "one\ntwo");
        assert_eq!(store.reconstruct(&page, 4).unwrap(), "two\nthree\n");
    }

    #[test]
    fn unknown_versions_are_not_found() {
        let (page, store) = page_with_history(&["one"]);
        assert!(matches!(
            store.reconstruct(&page, 9),
            Err(WikiError::RevisionNotFound { version: 9, .. })
        ));
        assert!(matches!(
            store.reconstruct(&page, 0),
            Err(WikiError::RevisionNotFound { version: 0, .. })
        ));
    }

    #[test]
    fn version_gaps_are_not_found() {
        let (mut page, mut store) = page_with_history(&["one"]);
        // An upload of three files bumps the version by three.
        let patch = compute_patch("one", "one\n[file:1]").unwrap();
        store
            .archive(page.id, page.current_version, &patch, page.modified_on)
            .unwrap();
        page.markup = "one\n[file:1]".into();
        page.current_version += 3;

        assert_eq!(store.reconstruct(&page, 5).unwrap(), "one\n[file:1]");
        assert!(matches!(
            store.reconstruct(&page, 3),
            Err(WikiError::RevisionNotFound { version: 3, .. })
        ));
    }

    #[test]
    fn out_of_order_archive_is_rejected() {
        let (page, mut store) = page_with_history(&["one", "two"]);
        let patch = compute_patch("two", "three").unwrap();
        assert!(matches!(
            store.archive(page.id, 1, &patch, at(9)),
            Err(WikiError::HistoryCorrupt { version: 1, .. })
        ));
        assert_eq!(store.revisions(page.id).len(), 2);
    }

    #[test]
    fn corrupt_patch_is_reported() {
        let (page, mut store) = page_with_history(&["one", "two"]);
        store.by_page.get_mut(&page.id).unwrap()[1].patch = "@@ -1,1 +1,1 @@\n-nope\n+two\n".into();
        assert!(matches!(
            store.reconstruct(&page, 3),
            Err(WikiError::HistoryCorrupt { version: 2, .. })
        ));
        // Versions before the damage still replay.
        assert_eq!(store.reconstruct(&page, 2).unwrap(), "one");
    }

    #[test]
    fn drifted_current_markup_is_corrupt() {
        let (mut page, store) = page_with_history(&["one"]);
        page.markup = "edited behind our back".into();
        assert!(matches!(
            store.reconstruct(&page, 2),
            Err(WikiError::HistoryCorrupt { .. })
        ));
    }

    #[test]
    fn history_lists_newest_first_with_stats() {
        let (page, store) = page_with_history(&["a", "a\nb\nc"]);
        let history = store.history(&page);
        let versions: Vec<_> = history.iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
        assert_eq!((history[0].lines_added, history[0].lines_removed), (3, 1));
        assert_eq!((history[1].lines_added, history[1].lines_removed), (1, 0));
        assert_eq!((history[2].lines_added, history[2].lines_removed), (0, 0));
    }

    #[test]
    fn diff_between_versions() {
        let (page, store) = page_with_history(&["a\n", "a\nb\n"]);
        let patch = store.diff_versions(&page, 2, 3).unwrap().unwrap();
        assert_eq!(patch.line_stats(), (1, 0));
        assert!(store.diff_versions(&page, 3, 3).unwrap().is_none());
    }

    #[test]
    fn textual_rewrite_keeps_history_replayable() {
        let (mut page, mut store) =
            page_with_history(&["see [[Beta]]", "see [[Beta]] twice [[Beta]]"]);
        let (pages, count) = store.rewrite_text("[[Beta]]", "[[Delta]]");
        assert_eq!(pages.into_iter().collect::<Vec<_>>(), vec![page.id]);
        assert_eq!(count, 2);

        page.markup = page.markup.replace("[[Beta]]", "[[Delta]]");
        assert_eq!(store.reconstruct(&page, 2).unwrap(), "see [[Delta]]");
        assert_eq!(store.reconstruct(&page, 3).unwrap(), page.markup);
    }

    #[test]
    fn replaced_history_replays_new_bodies() {
        let (mut page, mut store) = page_with_history(&["x [[Beta]]", "y [[Beta]]"]);
        let bodies: Vec<String> = store
            .reconstruct_all(&page)
            .unwrap()
            .into_iter()
            .map(|b| b.replace("Beta", "Delta"))
            .collect();
        assert_eq!(store.replace_history(page.id, &bodies), 2);
        page.markup = bodies.last().unwrap().clone();

        assert_eq!(store.reconstruct(&page, 2).unwrap(), "x [[Delta]]");
        assert_eq!(store.reconstruct(&page, 3).unwrap(), "y [[Delta]]");
        assert_eq!(store.revisions(page.id)[1].modified_on, at(1));
    }
}

use crate::config::RenameStrategy;
use crate::error::Result;
use crate::link_parser::{extract_references, extract_wikilinks, page_marker, rename_wikilinks};
use crate::store::{GroupState, PageId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Reference graph
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeMeta {
    pub created_on: DateTime<Utc>,
}

/// Targets gained and lost by one refresh of a page's outgoing edges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EdgeDelta {
    pub added: BTreeSet<PageId>,
    pub removed: BTreeSet<PageId>,
}

impl EdgeDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Directed "page links to page" edges within one group.
///
/// Outgoing edges are the source of truth and are persisted. Backlinks are
/// derived: rebuilt after a load and maintained alongside every edge change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceGraph {
    outgoing: BTreeMap<PageId, BTreeMap<PageId, EdgeMeta>>,
    #[serde(skip)]
    backlinks: BTreeMap<PageId, BTreeSet<PageId>>,
}

impl ReferenceGraph {
    /// Make `source`'s outgoing edges equal to `targets`.
    ///
    /// Surviving edges keep their creation time; new ones are stamped `now`.
    pub fn refresh_out_edges(
        &mut self,
        source: PageId,
        targets: &BTreeSet<PageId>,
        now: DateTime<Utc>,
    ) -> EdgeDelta {
        let current = self.outgoing.entry(source).or_default();
        let mut delta = EdgeDelta::default();

        current.retain(|target, _| {
            let keep = targets.contains(target);
            if !keep {
                delta.removed.insert(*target);
            }
            keep
        });
        for target in targets {
            if !current.contains_key(target) {
                current.insert(*target, EdgeMeta { created_on: now });
                delta.added.insert(*target);
            }
        }
        if current.is_empty() {
            self.outgoing.remove(&source);
        }

        for target in &delta.removed {
            if let Some(sources) = self.backlinks.get_mut(target) {
                sources.remove(&source);
                if sources.is_empty() {
                    self.backlinks.remove(target);
                }
            }
        }
        for target in &delta.added {
            self.backlinks.entry(*target).or_default().insert(source);
        }
        delta
    }

    /// Add a single edge. Returns false when it already existed.
    pub fn add_edge(&mut self, source: PageId, target: PageId, now: DateTime<Utc>) -> bool {
        let edges = self.outgoing.entry(source).or_default();
        if edges.contains_key(&target) {
            return false;
        }
        edges.insert(target, EdgeMeta { created_on: now });
        self.backlinks.entry(target).or_default().insert(source);
        true
    }

    pub fn out_edges(&self, source: PageId) -> BTreeSet<PageId> {
        self.outgoing
            .get(&source)
            .map(|edges| edges.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn in_edges(&self, target: PageId) -> BTreeSet<PageId> {
        self.backlinks.get(&target).cloned().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn edge(&self, source: PageId, target: PageId) -> Option<&EdgeMeta> {
        self.outgoing.get(&source)?.get(&target)
    }

    #[cfg(test)]
    pub(crate) fn edge_count(&self) -> usize {
        self.outgoing.values().map(BTreeMap::len).sum()
    }

    pub fn rebuild_backlinks(&mut self) {
        self.backlinks.clear();
        for (source, edges) in &self.outgoing {
            for target in edges.keys() {
                self.backlinks.entry(*target).or_default().insert(*source);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

/// Re-derive `page_id`'s outgoing edges from its current markup.
///
/// Links are resolved against the state's current titles; unresolvable ones
/// produce no edge.
pub fn index_page(state: &mut GroupState, page_id: PageId, now: DateTime<Utc>) -> EdgeDelta {
    let Some(page) = state.pages.get(&page_id) else {
        return EdgeDelta::default();
    };
    let targets = extract_references(&page.markup, |title| state.titles.resolve(title));
    let delta = state.references.refresh_out_edges(page_id, &targets, now);
    if !delta.is_empty() {
        tracing::debug!(
            page = page_id,
            added = delta.added.len(),
            removed = delta.removed.len(),
            "Refreshed outgoing references"
        );
    }
    delta
}

/// Connect every page that mentions `title` to `page_id`.
///
/// Run after a page appears under `title` (created or renamed) so that links
/// written before the page existed start counting. Returns the sources that
/// gained an edge; their rendered output is stale.
pub fn relink_mentions(
    state: &mut GroupState,
    page_id: PageId,
    title: &str,
    now: DateTime<Utc>,
) -> BTreeSet<PageId> {
    let mentioning: Vec<PageId> = state
        .pages
        .values()
        .filter(|page| extract_wikilinks(&page.markup).iter().any(|name| name == title))
        .map(|page| page.id)
        .collect();

    let mut gained = BTreeSet::new();
    for source in mentioning {
        if state.references.add_edge(source, page_id, now) {
            gained.insert(source);
        }
    }
    if !gained.is_empty() {
        tracing::info!(page = page_id, title, sources = gained.len(), "Linked earlier mentions");
    }
    gained
}

/// Recompute the outgoing edges of every page from scratch.
pub fn reindex_all_references(state: &mut GroupState, now: DateTime<Utc>) -> usize {
    let ids: Vec<PageId> = state.pages.keys().copied().collect();
    let mut changed = 0;
    for id in &ids {
        if !index_page(state, *id, now).is_empty() {
            changed += 1;
        }
    }
    tracing::info!(pages = ids.len(), changed, "Reindexed all references");
    changed
}

// ---------------------------------------------------------------------------
// Rename cascade
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenameCascade {
    /// Pages whose current markup was rewritten.
    pub rewritten_pages: BTreeSet<PageId>,
    /// Number of archived revisions whose patch text changed.
    pub rewritten_revisions: usize,
}

/// Rewrite links to a renamed page in current markup and in history.
///
/// Only markup and revision text change here. Titles, edges, rendered output
/// and the search index are the caller's job.
pub fn cascade_rename(
    state: &mut GroupState,
    renamed: PageId,
    old_title: &str,
    new_title: &str,
    strategy: RenameStrategy,
) -> Result<RenameCascade> {
    let cascade = match strategy {
        RenameStrategy::Textual => cascade_textual(state, renamed, old_title, new_title),
        RenameStrategy::Structural => cascade_structural(state, renamed, old_title, new_title)?,
    };
    tracing::info!(
        page = renamed,
        old_title,
        new_title,
        ?strategy,
        pages = cascade.rewritten_pages.len(),
        revisions = cascade.rewritten_revisions,
        "Cascaded rename"
    );
    Ok(cascade)
}

/// Exact `[[Old]]` substitution in referencing pages and in every stored
/// patch. Aliased or anchored links are left alone, as are markers that
/// happen to sit in code.
fn cascade_textual(
    state: &mut GroupState,
    renamed: PageId,
    old_title: &str,
    new_title: &str,
) -> RenameCascade {
    let old_marker = page_marker(old_title);
    let new_marker = page_marker(new_title);
    let mut cascade = RenameCascade::default();

    let (history_pages, revisions) = state.revisions.rewrite_text(&old_marker, &new_marker);
    cascade.rewritten_revisions = revisions;

    // A page whose history was rewritten must have its markup rewritten too,
    // or replaying its patches would no longer reach the current markup.
    let targets: BTreeSet<PageId> = state
        .references
        .in_edges(renamed)
        .into_iter()
        .chain(history_pages)
        .collect();
    for id in targets {
        if let Some(page) = state.pages.get_mut(&id) {
            if page.markup.contains(&old_marker) {
                page.markup = page.markup.replace(&old_marker, &new_marker);
                cascade.rewritten_pages.insert(id);
            }
        }
    }
    cascade
}

/// Token-aware rewrite of each referencing page, current markup and every
/// archived version, with history re-diffed afterwards.
fn cascade_structural(
    state: &mut GroupState,
    renamed: PageId,
    old_title: &str,
    new_title: &str,
) -> Result<RenameCascade> {
    let mut cascade = RenameCascade::default();

    for id in state.references.in_edges(renamed) {
        let Some(page) = state.pages.get(&id) else {
            continue;
        };
        let bodies = state.revisions.reconstruct_all(page)?;
        let rewritten: Vec<String> = bodies
            .iter()
            .map(|body| rename_wikilinks(body, old_title, new_title))
            .collect();
        if rewritten == bodies {
            continue;
        }

        cascade.rewritten_revisions += state.revisions.replace_history(id, &rewritten);
        if let (Some(page), Some(current)) = (state.pages.get_mut(&id), rewritten.last()) {
            if page.markup != *current {
                page.markup = current.clone();
                cascade.rewritten_pages.insert(id);
            }
        }
    }
    Ok(cascade)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

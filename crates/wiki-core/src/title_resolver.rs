use crate::store::{Page, PageId};
use std::collections::{BTreeMap, HashMap};

/// Bidirectional map between page titles and page ids within one group.
///
/// Derived from the page table: never persisted, rebuilt after a load and
/// kept current by every mutation that creates or renames a page. Lookups are
/// exact and case-sensitive, matching how link markers are resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TitleResolver {
    /// Forward map: "Page Title" -> id
    title_to_id: HashMap<String, PageId>,
    /// Reverse map: id -> "Page Title"
    id_to_title: HashMap<PageId, String>,
}

impl TitleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear both maps and re-add every page.
    pub fn rebuild(&mut self, pages: &BTreeMap<PageId, Page>) {
        self.title_to_id.clear();
        self.id_to_title.clear();
        for page in pages.values() {
            self.upsert(page.id, &page.title);
        }
    }

    /// Register `title` for `id`, dropping whatever title `id` had before.
    pub fn upsert(&mut self, id: PageId, title: &str) {
        if let Some(old) = self.id_to_title.insert(id, title.to_string()) {
            if old != title {
                self.title_to_id.remove(&old);
            }
        }
        self.title_to_id.insert(title.to_string(), id);
    }

    pub fn resolve(&self, title: &str) -> Option<PageId> {
        self.title_to_id.get(title).copied()
    }

    #[cfg(test)]
    pub(crate) fn title_for(&self, id: PageId) -> Option<&str> {
        self.id_to_title.get(&id).map(String::as_str)
    }

    pub fn contains_title(&self, title: &str) -> bool {
        self.title_to_id.contains_key(title)
    }

    pub fn len(&self) -> usize {
        self.id_to_title.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_title.is_empty()
    }
}

use crate::store::{Page, PageId};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, FAST, INDEXED, STORED, TEXT};
use tantivy::{
    doc, DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, Score, TantivyDocument, Term,
};

const DEFAULT_MEMORY_BUDGET: usize = 50_000_000;

/// A single search hit with its relevance score.
#[derive(Debug, Clone, Serialize)]
pub struct IndexHit {
    pub page_id: PageId,
    pub title: String,
    pub score: f32,
}

/// What the index holds for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub page_id: PageId,
    pub title: String,
    pub markup: String,
}

impl From<&Page> for IndexEntry {
    fn from(page: &Page) -> Self {
        IndexEntry {
            page_id: page.id,
            title: page.title.clone(),
            markup: page.markup.clone(),
        }
    }
}

struct Fields {
    page_id: Field,
    title: Field,
    markup: Field,
}

/// Full-text search index backed by tantivy.
///
/// Every commit carries the group generation it reflects as its payload, so a
/// reopened index can tell whether it is in step with the group snapshot.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: Fields,
    title_weight: f32,
    body_weight: f32,
    #[cfg(test)]
    refuse_commits: std::sync::atomic::AtomicBool,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let page_id = builder.add_u64_field("page_id", INDEXED | STORED | FAST);
    let title = builder.add_text_field("title", TEXT | STORED);
    let markup = builder.add_text_field("markup", TEXT);
    (
        builder.build(),
        Fields {
            page_id,
            title,
            markup,
        },
    )
}

impl SearchIndex {
    pub fn open(path: &Path, memory_budget: usize) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("creating index directory {}", path.display()))?;
        let (schema, fields) = build_schema();
        let dir = MmapDirectory::open(path)?;
        let index = Index::open_or_create(dir, schema)?;
        Self::from_index(index, fields, memory_budget)
    }

    /// Create a new SearchIndex backed by RAM (for tests).
    pub fn new_in_memory() -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        Self::from_index(index, fields, DEFAULT_MEMORY_BUDGET)
    }

    fn from_index(index: Index, fields: Fields, memory_budget: usize) -> Result<Self> {
        let writer: IndexWriter = index.writer_with_num_threads(1, memory_budget)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(SearchIndex {
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
            title_weight: 2.0,
            body_weight: 1.0,
            #[cfg(test)]
            refuse_commits: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn with_weights(mut self, title: f32, body: f32) -> Self {
        self.title_weight = title;
        self.body_weight = body;
        self
    }

    /// Make every later commit fail after its documents were staged.
    #[cfg(test)]
    pub(crate) fn refuse_commits(&self, refuse: bool) {
        self.refuse_commits
            .store(refuse, std::sync::atomic::Ordering::SeqCst);
    }

    /// Generation recorded by the last commit, `None` for a fresh index.
    pub fn committed_generation(&self) -> Result<Option<u64>> {
        let metas = self.index.load_metas()?;
        Ok(metas.payload.as_deref().and_then(|p| p.parse().ok()))
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Upsert `entries`, delete `removals` and commit as one unit.
    ///
    /// On failure the uncommitted operations are rolled back and the index
    /// still reflects its previous commit.
    pub fn sync(&self, entries: &[IndexEntry], removals: &[PageId], generation: u64) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.write_and_commit(&mut writer, entries, removals, generation, false) {
            if let Err(rollback) = writer.rollback() {
                tracing::error!(error = %rollback, "Search index rollback failed");
            }
            return Err(e);
        }
        drop(writer);
        self.reload();
        tracing::debug!(
            upserts = entries.len(),
            removals = removals.len(),
            generation,
            "Search index committed"
        );
        Ok(())
    }

    /// Replace the whole index with `entries`.
    pub fn rebuild(&self, entries: &[IndexEntry], generation: u64) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.write_and_commit(&mut writer, entries, &[], generation, true) {
            if let Err(rollback) = writer.rollback() {
                tracing::error!(error = %rollback, "Search index rollback failed");
            }
            return Err(e);
        }
        drop(writer);
        self.reload();
        tracing::info!(docs = entries.len(), generation, "Search index rebuilt");
        Ok(())
    }

    fn write_and_commit(
        &self,
        writer: &mut IndexWriter,
        entries: &[IndexEntry],
        removals: &[PageId],
        generation: u64,
        clear: bool,
    ) -> Result<()> {
        if clear {
            writer.delete_all_documents()?;
        }
        for page_id in removals {
            writer.delete_term(Term::from_field_u64(self.fields.page_id, *page_id));
        }
        for entry in entries {
            writer.delete_term(Term::from_field_u64(self.fields.page_id, entry.page_id));
            writer.add_document(doc!(
                self.fields.page_id => entry.page_id,
                self.fields.title => entry.title.as_str(),
                self.fields.markup => entry.markup.as_str(),
            ))?;
        }
        #[cfg(test)]
        if self.refuse_commits.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("commit refused");
        }
        let mut prepared = writer.prepare_commit()?;
        prepared.set_payload(&generation.to_string());
        prepared.commit()?;
        Ok(())
    }

    fn reload(&self) {
        // The commit is durable either way; a stale reader only lags until the next reload.
        if let Err(e) = self.reader.reload() {
            tracing::warn!(error = %e, "Search reader reload failed");
        }
    }

    /// Search the index and return up to `limit` hits, best first.
    ///
    /// Terms are ANDed, title matches are boosted, and malformed syntax is
    /// parsed leniently instead of failing.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<IndexHit>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let mut parser =
            QueryParser::for_index(&self.index, vec![self.fields.title, self.fields.markup]);
        parser.set_conjunction_by_default();
        parser.set_field_boost(self.fields.title, self.title_weight);
        parser.set_field_boost(self.fields.markup, self.body_weight);

        let (parsed, errors) = parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!(query, errors = errors.len(), "Lenient query parse");
        }

        let top: Vec<(Score, DocAddress)> = searcher.search(&*parsed, &TopDocs::with_limit(limit))?;
        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(page_id) = doc.get_first(self.fields.page_id).and_then(|v| v.as_u64()) else {
                continue;
            };
            let title = doc
                .get_first(self.fields.title)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            hits.push(IndexHit {
                page_id,
                title,
                score,
            });
        }
        Ok(hits)
    }

    /// Every matching page, best first.
    pub fn search_all(&self, query: &str) -> Result<Vec<IndexHit>> {
        let limit = self.num_docs() as usize;
        self.search(query, limit)
    }
}

use crate::store::{FileId, PageId};
use crate::transaction::MutationStep;
use thiserror::Error;

pub type Result<T, E = WikiError> = std::result::Result<T, E>;

/// Boxed cause carried by [`WikiError::TransactionAborted`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("unknown wiki group: {0}")]
    GroupNotFound(String),

    #[error("page {0} not found")]
    PageNotFound(PageId),

    #[error("no page titled {0:?}")]
    TitleNotFound(String),

    #[error("file {0} not found")]
    FileNotFound(FileId),

    #[error("page {page} has no revision {version}")]
    RevisionNotFound { page: PageId, version: u64 },

    /// Someone else committed to the page since the caller read it.
    #[error("page {page} is at version {current}, edit was based on version {expected}")]
    VersionConflict {
        page: PageId,
        expected: u64,
        current: u64,
    },

    #[error("the page title {0:?} has already been taken")]
    DuplicateTitle(String),

    #[error("the page name is not changed")]
    TitleUnchanged,

    #[error("invalid page title {0:?}")]
    InvalidTitle(String),

    #[error("the home page cannot be renamed")]
    HomePageRename,

    #[error("invalid date {0:?}, expected MM/DD/YYYY")]
    InvalidDate(String),

    #[error("history of page {page} is corrupt at version {version}")]
    HistoryCorrupt { page: PageId, version: u64 },

    #[error("transaction aborted at {step:?}: {source}")]
    TransactionAborted {
        step: MutationStep,
        #[source]
        source: BoxError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("search index error: {0:#}")]
    Index(#[from] anyhow::Error),
}

impl WikiError {
    pub(crate) fn aborted(step: MutationStep, source: impl Into<BoxError>) -> Self {
        WikiError::TransactionAborted {
            step,
            source: source.into(),
        }
    }

    /// True for the outcomes a caller can fix by re-fetching or choosing different input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WikiError::VersionConflict { .. }
                | WikiError::DuplicateTitle(_)
                | WikiError::TitleUnchanged
                | WikiError::InvalidTitle(_)
                | WikiError::InvalidDate(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WikiError::GroupNotFound(_)
                | WikiError::PageNotFound(_)
                | WikiError::TitleNotFound(_)
                | WikiError::FileNotFound(_)
                | WikiError::RevisionNotFound { .. }
        )
    }
}

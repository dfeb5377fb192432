pub mod blob_store;
pub mod config;
pub mod diff;
pub mod error;
pub mod group;
pub mod link_indexer;
pub mod link_parser;
pub mod mutation;
pub mod render;
pub mod revision;
pub mod search;
pub mod search_index;
pub mod store;
pub mod title_resolver;
pub mod transaction;
pub mod wiki;

pub use config::{RenameStrategy, UploadVersionPolicy, WikiConfig};
pub use error::{Result, WikiError};
pub use group::{FileDownload, Group, PageVersion, ReindexSummary};
pub use mutation::{AppendOutcome, EditOutcome, RenameOutcome, Upload, UploadOutcome};
pub use search::{SearchHit, SearchRequest};
pub use store::{Attachment, FileId, Page, PageId, PageSummary, Paginated, HOME_PAGE_ID};
pub use wiki::Wiki;

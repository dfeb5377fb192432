use crate::error::{Result, WikiError};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How many versions a page advances when several files are appended to it at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UploadVersionPolicy {
    /// One version for the whole batch.
    #[default]
    Single,
    /// One version per appended file. Only the last one is reconstructable.
    PerFile,
}

impl UploadVersionPolicy {
    pub fn increment(self, files: usize) -> u64 {
        match self {
            UploadVersionPolicy::Single => 1,
            UploadVersionPolicy::PerFile => files.max(1) as u64,
        }
    }
}

/// How links to a renamed page are rewritten.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenameStrategy {
    /// Literal `[[Old]]` -> `[[New]]` substitution in markup and stored patches.
    #[default]
    Textual,
    /// Rewrite parsed links (aliases and anchors included) and re-diff history.
    Structural,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WikiConfig {
    /// Each group gets a subdirectory holding its snapshot, index and files.
    pub data_dir: PathBuf,
    /// Groups that may be opened. Anything else is `GroupNotFound`.
    pub groups: Vec<String>,
    pub home_title: String,
    /// Offset the search date filter is interpreted in, e.g. `-06:00`.
    pub local_utc_offset: String,
    pub upload_version_policy: UploadVersionPolicy,
    pub rename_strategy: RenameStrategy,
    pub search_page_size: usize,
    pub listing_page_size: usize,
    pub sidebar_changes: usize,
    pub changes_limit: usize,
    pub title_weight: f32,
    pub body_weight: f32,
    pub index_memory_budget: usize,
    /// Request body cap on the upload routes, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for WikiConfig {
    fn default() -> Self {
        WikiConfig {
            data_dir: PathBuf::from("data"),
            groups: vec!["main".to_string()],
            home_title: "Home".to_string(),
            local_utc_offset: "-06:00".to_string(),
            upload_version_policy: UploadVersionPolicy::default(),
            rename_strategy: RenameStrategy::default(),
            search_page_size: 100,
            listing_page_size: 100,
            sidebar_changes: 5,
            changes_limit: 50,
            title_weight: 2.0,
            body_weight: 1.0,
            index_memory_budget: 50_000_000,
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }
}

impl WikiConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: WikiConfig =
            toml::from_str(text).map_err(|e| WikiError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WikiError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(WikiError::Config("at least one group is required".into()));
        }
        for name in &self.groups {
            if !is_valid_group_name(name) {
                return Err(WikiError::Config(format!("invalid group name {:?}", name)));
            }
        }
        crate::link_parser::validate_title(&self.home_title)
            .map_err(|_| WikiError::Config(format!("invalid home title {:?}", self.home_title)))?;
        self.local_offset()?;
        if self.search_page_size == 0 || self.listing_page_size == 0 {
            return Err(WikiError::Config("page sizes must be positive".into()));
        }
        if self.max_upload_bytes == 0 {
            return Err(WikiError::Config("max_upload_bytes must be positive".into()));
        }
        if !(self.title_weight > 0.0 && self.body_weight > 0.0) {
            return Err(WikiError::Config("field weights must be positive".into()));
        }
        Ok(())
    }

    pub fn is_active_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g == name)
    }

    pub fn local_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.local_utc_offset)
            .ok_or_else(|| {
                WikiError::Config(format!("invalid UTC offset {:?}", self.local_utc_offset))
            })
    }
}

/// Group names double as directory names and URL segments.
fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parse `+HH:MM` / `-HH:MM`.
fn parse_utc_offset(text: &str) -> Option<FixedOffset> {
    let (sign, rest) = match text.as_bytes().first()? {
        b'+' => (1, &text[1..]),
        b'-' => (-1, &text[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    if hours.len() != 2 || minutes.len() != 2 {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

use crate::config::WikiConfig;
use crate::error::{Result, WikiError};
use crate::group::Group;
use crate::render::{BasicRenderer, Renderer};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of the configured groups, opened lazily on first access.
pub struct Wiki {
    config: Arc<WikiConfig>,
    renderer: Arc<dyn Renderer>,
    groups: DashMap<String, Arc<Group>>,
    in_memory: bool,
}

impl Wiki {
    /// Groups persist under `config.data_dir`.
    pub fn open(config: WikiConfig) -> Result<Self> {
        Self::build(config, false)
    }

    /// Groups live only in memory.
    pub fn in_memory(config: WikiConfig) -> Result<Self> {
        Self::build(config, true)
    }

    fn build(config: WikiConfig, in_memory: bool) -> Result<Self> {
        config.validate()?;
        Ok(Wiki {
            config: Arc::new(config),
            renderer: Arc::new(BasicRenderer),
            groups: DashMap::new(),
            in_memory,
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn config(&self) -> &WikiConfig {
        &self.config
    }

    pub fn group_names(&self) -> &[String] {
        &self.config.groups
    }

    /// Look up an active group, opening it if this is the first request for it.
    pub fn group(&self, name: &str) -> Result<Arc<Group>> {
        if !self.config.is_active_group(name) {
            return Err(WikiError::GroupNotFound(name.to_string()));
        }
        match self.groups.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let group = if self.in_memory {
                    Group::in_memory(name, self.config.clone(), self.renderer.clone())?
                } else {
                    Group::open(name, self.config.clone(), self.renderer.clone())?
                };
                tracing::info!(group = name, "Opened group");
                let group = Arc::new(group);
                entry.insert(group.clone());
                Ok(group)
            }
        }
    }

    /// Open every configured group up front.
    pub fn open_all(&self) -> Result<()> {
        for name in &self.config.groups {
            self.group(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HOME_PAGE_ID;

    fn wiki() -> Wiki {
        Wiki::in_memory(WikiConfig {
            groups: vec!["physics".into(), "math".into()],
            ..WikiConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn unknown_groups_are_rejected() {
        let wiki = wiki();
        assert!(matches!(wiki.group("chemistry"), Err(WikiError::GroupNotFound(_))));
        assert!(wiki.group("physics").is_ok());
    }

    #[test]
    fn groups_are_isolated() {
        let wiki = wiki();
        let physics = wiki.group("physics").unwrap();
        physics.create_page("Optics").unwrap();

        let math = wiki.group("math").unwrap();
        assert!(math.page_by_title("Optics").is_err());
        assert_eq!(math.page(HOME_PAGE_ID).unwrap().title, "Home");
    }

    #[test]
    fn repeated_lookups_share_one_group() {
        let wiki = wiki();
        let a = wiki.group("math").unwrap();
        let b = wiki.group("math").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn persistent_groups_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = WikiConfig {
            data_dir: dir.path().to_path_buf(),
            ..WikiConfig::default()
        };
        {
            let wiki = Wiki::open(config.clone()).unwrap();
            wiki.open_all().unwrap();
            wiki.group("main").unwrap().create_page("Persisted").unwrap();
        }
        let wiki = Wiki::open(config).unwrap();
        assert!(wiki.group("main").unwrap().page_by_title("Persisted").is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = WikiConfig {
            groups: vec![],
            ..WikiConfig::default()
        };
        assert!(matches!(Wiki::in_memory(config), Err(WikiError::Config(_))));
    }
}

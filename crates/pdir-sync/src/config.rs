use std::path::{Path, PathBuf};
use std::str::FromStr;

use pdir_storage::{DEFAULT_MAX_BATCH, DEFAULT_MAX_CONDITIONS};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_url: Option<String>,
    pub store_url: Option<String>,
    pub store_token: Option<String>,
    pub page_size: u64,
    pub max_pages: usize,
    pub batch_size: usize,
    pub max_conditions: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub workspace_root: PathBuf,
    pub lookups_path: PathBuf,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    /// Defaults rooted at `workspace_root`, without reading the environment.
    pub fn for_workspace(workspace_root: impl AsRef<Path>) -> Self {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        Self {
            source_url: None,
            store_url: None,
            store_token: None,
            page_size: 500,
            max_pages: 10_000,
            batch_size: DEFAULT_MAX_BATCH,
            max_conditions: DEFAULT_MAX_CONDITIONS,
            http_timeout_secs: 30,
            user_agent: "pdir-sync/0.1".to_string(),
            lookups_path: workspace_root.join("lookups.yaml"),
            workspace_root,
        }
    }

    pub fn from_env() -> Self {
        let workspace_root = std::env::var("PDIR_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_workspace(&workspace_root);
        let lookups_path = env_string("PDIR_LOOKUPS")
            .map(|p| workspace_root.join(p))
            .unwrap_or(defaults.lookups_path);

        Self {
            source_url: env_string("PDIR_SOURCE_URL"),
            store_url: env_string("PDIR_STORE_URL"),
            store_token: env_string("PDIR_STORE_TOKEN"),
            page_size: env_parse("PDIR_PAGE_SIZE", defaults.page_size).max(1),
            max_pages: env_parse("PDIR_MAX_PAGES", defaults.max_pages).max(1),
            batch_size: env_parse("PDIR_BATCH_SIZE", defaults.batch_size).max(1),
            max_conditions: env_parse("PDIR_MAX_CONDITIONS", defaults.max_conditions).max(1),
            http_timeout_secs: env_parse("PDIR_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: env_string("PDIR_USER_AGENT").unwrap_or(defaults.user_agent),
            workspace_root,
            lookups_path,
        }
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_defaults_point_inside_the_root() {
        let config = SyncConfig::for_workspace("/srv/pdir");
        assert_eq!(config.lookups_path, PathBuf::from("/srv/pdir/lookups.yaml"));
        assert_eq!(config.reports_root(), PathBuf::from("/srv/pdir/reports"));
        assert_eq!(config.batch_size, DEFAULT_MAX_BATCH);
        assert!(config.source_url.is_none());
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        assert_eq!(env_parse("PDIR_TEST_UNSET_NUMBER_KEY", 17usize), 17);
    }
}

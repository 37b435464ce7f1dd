//! Integration configuration.
//!
//! Resolution order (first hit wins for the file, env always overrides keys):
//! 1. `$SPECKIT_ARCHON_CONFIG`
//! 2. `<workspace>/.specify/archon.yaml`
//! 3. `<config_dir>/speckit-archon/archon.yaml`
//!
//! A missing file is not an error; every key has a default and an absent
//! `api_url` simply leaves the integration unavailable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::paths::{default_state_root, find_workspace_root, WORKSPACE_CONFIG};

pub const ENV_API_URL: &str = "ARCHON_API_URL";
pub const ENV_STATE_DIR: &str = "SPECKIT_ARCHON_STATE_DIR";
pub const ENV_DISABLED: &str = "SPECKIT_ARCHON_DISABLED";
pub const ENV_CONFIG: &str = "SPECKIT_ARCHON_CONFIG";

/// On-disk config file (`archon.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchonConfig {
    pub enabled: bool,
    pub api_url: Option<String>,
    /// Relative paths are resolved against the workspace root.
    pub state_dir: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for ArchonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: None,
            state_dir: None,
            poll_interval_secs: 30,
            request_timeout_secs: 20,
            max_attempts: 8,
            backoff_base_secs: 30,
            backoff_cap_secs: 3600,
        }
    }
}

/// Environment overrides, captured once so resolution stays testable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub api_url: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub disabled: bool,
    pub config_path: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_process() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            api_url: non_empty(ENV_API_URL),
            state_dir: non_empty(ENV_STATE_DIR).map(PathBuf::from),
            disabled: non_empty(ENV_DISABLED)
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(false),
            config_path: non_empty(ENV_CONFIG).map(PathBuf::from),
        }
    }
}

/// Fully resolved settings for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workspace_root: PathBuf,
    pub state_root: PathBuf,
    /// File the config was read from, if any.
    pub config_path: Option<PathBuf>,
    pub config: ArchonConfig,
    pub disabled_by_env: bool,
}

impl Settings {
    /// Resolve settings for a process started at `start` (a feature dir or cwd).
    pub fn resolve(start: &Path) -> Result<Self, CoreError> {
        Self::resolve_with(start, &EnvOverrides::from_process(), global_config_path())
    }

    pub fn resolve_with(
        start: &Path,
        env: &EnvOverrides,
        global_config: Option<PathBuf>,
    ) -> Result<Self, CoreError> {
        let workspace_root = find_workspace_root(start);

        let candidates = [
            env.config_path.clone(),
            Some(workspace_root.join(WORKSPACE_CONFIG)),
            global_config,
        ];
        let config_path = candidates.into_iter().flatten().find(|p| p.is_file());

        let mut config = match &config_path {
            Some(path) => load_config(path)?,
            None => ArchonConfig::default(),
        };
        if let Some(url) = &env.api_url {
            config.api_url = Some(url.clone());
        }

        let state_root = match env.state_dir.clone().or_else(|| config.state_dir.clone()) {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => workspace_root.join(dir),
            None => default_state_root(&workspace_root),
        };

        Ok(Self {
            workspace_root,
            state_root,
            config_path,
            config,
            disabled_by_env: env.disabled,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    /// Configured API base URL without a trailing slash.
    pub fn api_url(&self) -> Option<&str> {
        self.config
            .api_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/'))
            .filter(|url| !url.is_empty())
    }
}

/// Parse an `archon.yaml` file.
pub fn load_config(path: &Path) -> Result<ArchonConfig, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(ArchonConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| CoreError::Config {
        path: path.to_path_buf(),
        source,
    })
}

/// `<config_dir>/speckit-archon/archon.yaml`, when a config dir exists.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("speckit-archon").join("archon.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join(".specify")).unwrap();
        tmp
    }

    #[test]
    fn defaults_without_any_file() {
        let ws = workspace();
        let settings = Settings::resolve_with(ws.path(), &EnvOverrides::default(), None).unwrap();
        assert_eq!(settings.config, ArchonConfig::default());
        assert!(settings.config_path.is_none());
        assert!(settings.state_root.ends_with(".archon-state"));
        assert_eq!(settings.api_url(), None);
    }

    #[test]
    fn workspace_file_is_read_and_env_overrides_url() {
        let ws = workspace();
        std::fs::write(
            ws.path().join(".specify/archon.yaml"),
            "api_url: http://localhost:8181/\npoll_interval_secs: 5\nstate_dir: var/archon\n",
        )
        .unwrap();

        let settings = Settings::resolve_with(ws.path(), &EnvOverrides::default(), None).unwrap();
        assert_eq!(settings.api_url(), Some("http://localhost:8181"));
        assert_eq!(settings.config.poll_interval_secs, 5);
        assert!(settings.state_root.ends_with("var/archon"));

        let env = EnvOverrides {
            api_url: Some("https://archon.example".into()),
            ..EnvOverrides::default()
        };
        let settings = Settings::resolve_with(ws.path(), &env, None).unwrap();
        assert_eq!(settings.api_url(), Some("https://archon.example"));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let ws = workspace();
        std::fs::write(ws.path().join(".specify/archon.yaml"), "poll_interval_secs: [nope").unwrap();
        let err = Settings::resolve_with(ws.path(), &EnvOverrides::default(), None).unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }), "got: {err}");
    }
}

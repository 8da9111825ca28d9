//! Runtime configuration
//!
//! Resolved as defaults, then `<home>/config.yaml`, then `SKILLFORGE_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::ipc;
use crate::types::RetentionPolicy;

pub const ENV_HOME: &str = "SKILLFORGE_HOME";
pub const ENV_DB_PATH: &str = "SKILLFORGE_DB_PATH";
pub const ENV_BACKUP_ROOT: &str = "SKILLFORGE_BACKUP_ROOT";
pub const ENV_IPC_SOCKET: &str = "SKILLFORGE_IPC_SOCKET";
pub const ENV_PROFILE: &str = "SKILLFORGE_PROFILE";

const CONFIG_FILE: &str = "config.yaml";
const DB_FILE: &str = "forgeskills.sqlite";
const BACKUP_DIR: &str = "SkillForgeBackups";

/// Deployment profile. Selects the transition cadence only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[serde(alias = "development")]
    Dev,
    #[default]
    #[serde(alias = "production")]
    Prod,
}

impl Profile {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Some(Profile::Dev),
            "prod" | "production" => Some(Profile::Prod),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Dev => "dev",
            Profile::Prod => "prod",
        }
    }

    /// How often the transition pass runs
    pub fn transition_interval(&self) -> Duration {
        match self {
            Profile::Dev => Duration::from_secs(60),
            Profile::Prod => Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RetentionFile {
    incremental: Option<usize>,
    full: Option<usize>,
}

/// Shape of `config.yaml`; every key optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    backups_root: Option<PathBuf>,
    ipc_endpoint: Option<String>,
    profile: Option<Profile>,
    retention: Option<RetentionFile>,
}

impl ConfigFile {
    fn read(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: ConfigFile = serde_yaml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Config file loaded");
        Ok(file)
    }
}

#[derive(Debug, Clone)]
pub struct ForgeConfig {
    pub home: PathBuf,
    pub db_path: PathBuf,
    pub backups_root: PathBuf,
    pub ipc_endpoint: String,
    pub profile: Profile,
    pub retention: RetentionPolicy,
}

impl ForgeConfig {
    /// Resolve from the process environment and the user's directories
    pub fn load() -> Result<Self> {
        Self::resolve(
            |key| std::env::var(key).ok(),
            dirs::home_dir(),
            dirs::document_dir(),
        )
    }

    /// Resolve with explicit sources. Empty environment values count as unset.
    pub fn resolve(
        env: impl Fn(&str) -> Option<String>,
        user_home: Option<PathBuf>,
        documents: Option<PathBuf>,
    ) -> Result<Self> {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let user_home = user_home.unwrap_or_else(|| PathBuf::from("."));

        let home = var(ENV_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|| user_home.join(".skillforge"));
        let file = ConfigFile::read(&home.join(CONFIG_FILE))?;

        let db_path = var(ENV_DB_PATH)
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| home.join(DB_FILE));

        let backups_root = var(ENV_BACKUP_ROOT)
            .map(PathBuf::from)
            .or(file.backups_root)
            .unwrap_or_else(|| {
                documents
                    .unwrap_or_else(|| user_home.join("Documents"))
                    .join(BACKUP_DIR)
            });

        let ipc_endpoint = var(ENV_IPC_SOCKET)
            .or(file.ipc_endpoint)
            .unwrap_or_else(|| ipc::default_ipc_endpoint(&home));

        let profile = match var(ENV_PROFILE) {
            Some(v) => Profile::from_str(&v).ok_or_else(|| {
                CoreError::Config(format!("{} must be dev or prod, got '{}'", ENV_PROFILE, v))
            })?,
            None => file.profile.unwrap_or_default(),
        };

        let defaults = RetentionPolicy::default();
        let retention = match file.retention {
            Some(r) => RetentionPolicy {
                incremental_keep: r.incremental.unwrap_or(defaults.incremental_keep),
                full_keep: r.full.unwrap_or(defaults.full_keep),
            },
            None => defaults,
        };

        Ok(Self {
            home,
            db_path,
            backups_root,
            ipc_endpoint,
            profile,
            retention,
        })
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn resolve_with(vars: &[(&str, &str)], user_home: &Path) -> Result<ForgeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ForgeConfig::resolve(
            move |key| vars.get(key).cloned(),
            Some(user_home.to_path_buf()),
            Some(user_home.join("Docs")),
        )
    }

    #[test]
    fn test_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = resolve_with(&[], tmp.path()).unwrap();

        let home = tmp.path().join(".skillforge");
        assert_eq!(config.home, home);
        assert_eq!(config.db_path, home.join("forgeskills.sqlite"));
        assert_eq!(config.backups_root, tmp.path().join("Docs").join("SkillForgeBackups"));
        assert_eq!(config.ipc_endpoint, ipc::default_ipc_endpoint(&home));
        assert_eq!(config.profile, Profile::Prod);
        assert_eq!(config.retention, RetentionPolicy::default());
        assert_eq!(config.logs_dir(), home.join("logs"));
    }

    #[test]
    fn test_file_then_env_layering() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("forge-home");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(
            home.join("config.yaml"),
            "db_path: /data/from-file.sqlite\nprofile: dev\nretention:\n  incremental: 3\n",
        )
        .unwrap();

        let home_str = home.to_string_lossy().into_owned();
        let config = resolve_with(
            &[
                (ENV_HOME, home_str.as_str()),
                (ENV_BACKUP_ROOT, "/backups/env"),
                (ENV_DB_PATH, ""),
            ],
            tmp.path(),
        )
        .unwrap();

        // Empty env value falls through to the file
        assert_eq!(config.db_path, PathBuf::from("/data/from-file.sqlite"));
        assert_eq!(config.backups_root, PathBuf::from("/backups/env"));
        assert_eq!(config.profile, Profile::Dev);
        assert_eq!(config.retention.incremental_keep, 3);
        assert_eq!(config.retention.full_keep, 48);

        let config = resolve_with(
            &[
                (ENV_HOME, home_str.as_str()),
                (ENV_DB_PATH, "/data/from-env.sqlite"),
                (ENV_PROFILE, "production"),
            ],
            tmp.path(),
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/data/from-env.sqlite"));
        assert_eq!(config.profile, Profile::Prod);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = resolve_with(&[(ENV_PROFILE, "staging")], tmp.path()).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn test_malformed_file_rejected() {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join(".skillforge");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join("config.yaml"), "retention: [1, 2").unwrap();
        assert!(matches!(
            resolve_with(&[], tmp.path()),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn test_profile_cadence() {
        assert_eq!(Profile::Dev.transition_interval(), Duration::from_secs(60));
        assert_eq!(Profile::Prod.transition_interval(), Duration::from_secs(3600));
        assert_eq!(Profile::from_str(" DEV "), Some(Profile::Dev));
    }
}

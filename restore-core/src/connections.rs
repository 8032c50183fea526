//! Saved repository list and the connection values handed to the cache manager.

use crate::error::CoreError;
use crate::validate;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::info;

/// Everything needed to run restic against one repository.
#[derive(Clone, PartialEq, Eq)]
pub struct RepositoryConnection {
    pub repo_id: String,
    pub path: String,
    pub password: String,
}

impl RepositoryConnection {
    pub fn new(repo_id: impl Into<String>, path: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            path: path.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for RepositoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryConnection")
            .field("repo_id", &self.repo_id)
            .field("path", &self.path)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Passwords are stored in cleartext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRepository {
    pub id: String,
    pub name: String,
    pub path: String,
    pub password: String,
}

impl SavedRepository {
    pub fn connection(&self) -> RepositoryConnection {
        RepositoryConnection::new(&self.id, &self.path, &self.password)
    }

    fn validate(&self) -> Result<()> {
        validate::repo_id(&self.id)?;
        validate::repository_name(&self.name)?;
        validate::repository_path(&self.path)?;
        validate::password(&self.password)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryList {
    pub repositories: Vec<SavedRepository>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restic_binary_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_completed: Option<bool>,
}

pub struct ConnectionManager {
    path: PathBuf,
    list: RwLock<RepositoryList>,
}

impl ConnectionManager {
    /// A missing file is an empty list.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let list = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            serde_json::from_str(&json)
                .map_err(|e| CoreError::Storage(format!("Failed to parse {}: {}", path.display(), e)))?
        } else {
            RepositoryList::default()
        };
        Ok(Self {
            path,
            list: RwLock::new(list),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<SavedRepository> {
        self.read().repositories.clone()
    }

    /// Binary chosen during first-run setup, if any.
    pub fn restic_binary_path(&self) -> Option<PathBuf> {
        self.read().restic_binary_path.as_ref().map(PathBuf::from)
    }

    pub fn get(&self, repo_id: &str) -> Option<SavedRepository> {
        self.read().repositories.iter().find(|r| r.id == repo_id).cloned()
    }

    pub fn connection(&self, repo_id: &str) -> Result<RepositoryConnection> {
        self.get(repo_id)
            .map(|r| r.connection())
            .ok_or_else(|| CoreError::UnknownRepository(repo_id.to_string()))
    }

    pub fn add(&self, name: &str, path: &str, password: &str) -> Result<SavedRepository> {
        let repo = SavedRepository {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            path: path.to_string(),
            password: password.to_string(),
        };
        repo.validate()?;

        let mut repositories = self.list();
        repositories.push(repo.clone());
        self.save_all(repositories)?;
        info!(repo_id = %repo.id, name = %repo.name, "Repository added");
        Ok(repo)
    }

    /// Replaces the whole list; nothing is written unless every entry is valid.
    pub fn save_all(&self, repositories: Vec<SavedRepository>) -> Result<()> {
        for repo in &repositories {
            repo.validate()?;
        }

        let mut list = self.write();
        let updated = RepositoryList {
            repositories,
            ..list.clone()
        };
        self.persist(&updated)?;
        *list = updated;
        Ok(())
    }

    pub fn remove(&self, repo_id: &str) -> Result<bool> {
        validate::repo_id(repo_id)?;

        let mut list = self.write();
        let before = list.repositories.len();
        let mut updated = list.clone();
        updated.repositories.retain(|r| r.id != repo_id);
        if updated.repositories.len() == before {
            return Ok(false);
        }
        self.persist(&updated)?;
        *list = updated;
        info!(repo_id, "Repository removed");
        Ok(true)
    }

    fn persist(&self, list: &RepositoryList) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(list)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RepositoryList> {
        self.list.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RepositoryList> {
        self.list.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::open(dir.path().join("repositories.json")).unwrap();
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_add_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repositories.json");

        let manager = ConnectionManager::open(&path).unwrap();
        let repo = manager.add("NAS", "/mnt/nas/restic", "hunter2").unwrap();

        let reopened = ConnectionManager::open(&path).unwrap();
        assert_eq!(reopened.list(), vec![repo.clone()]);

        let conn = reopened.connection(&repo.id).unwrap();
        assert_eq!(conn.path, "/mnt/nas/restic");
        assert_eq!(conn.password, "hunter2");
    }

    #[test]
    fn test_invalid_entry_is_not_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repositories.json");
        let manager = ConnectionManager::open(&path).unwrap();

        let err = manager.add("NAS", "/mnt/nas/restic", "").unwrap_err();
        assert!(matches!(err, CoreError::EmptyPassword));
        assert!(!path.exists());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let manager = ConnectionManager::open(dir.path().join("repositories.json")).unwrap();
        let repo = manager.add("NAS", "/mnt/nas/restic", "pw").unwrap();

        assert!(manager.remove(&repo.id).unwrap());
        assert!(!manager.remove(&repo.id).unwrap());
        assert!(matches!(
            manager.connection(&repo.id),
            Err(CoreError::UnknownRepository(_))
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let conn = RepositoryConnection::new("r1", "/repo", "secret");
        let printed = format!("{conn:?}");
        assert!(!printed.contains("secret"));
        assert!(printed.contains("<redacted>"));
    }
}

//! Input validation applied before anything reaches restic or the disk.

use crate::error::CoreError;
use crate::Result;
use std::path::{Component, Path, PathBuf};

const REMOTE_SCHEMES: [&str; 7] = ["s3:", "rest:", "sftp:", "b2:", "azure:", "gs:", "rclone:"];

fn has_drive_letter(repo: &str) -> bool {
    let bytes = repo.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

pub fn repository_path(repo: &str) -> Result<()> {
    if repo.trim().is_empty() {
        return Err(CoreError::EmptyRepositoryPath);
    }
    if repo.contains('\0') {
        return Err(CoreError::InvalidRepositoryPath);
    }

    if repo.contains(':') && !has_drive_letter(repo) {
        if !REMOTE_SCHEMES.iter().any(|s| repo.starts_with(s)) {
            return Err(CoreError::UnsupportedProtocol(REMOTE_SCHEMES.join(", ")));
        }
        if repo.len() < 5 {
            return Err(CoreError::RemotePathTooShort);
        }
        return Ok(());
    }

    // Existence is not checked: the repository may be on a disk that is not mounted yet.
    if Path::new(repo)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(CoreError::PathTraversal);
    }
    Ok(())
}

pub fn snapshot_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CoreError::EmptySnapshotId);
    }
    if id.contains('\0') {
        return Err(CoreError::InvalidSnapshotId);
    }
    if id.len() < 8 {
        return Err(CoreError::SnapshotIdTooShort);
    }
    if id.len() > 64 {
        return Err(CoreError::SnapshotIdTooLong);
    }
    if !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::SnapshotIdNotHex);
    }
    Ok(())
}

pub fn target_path(target: &str) -> Result<PathBuf> {
    if target.trim().is_empty() {
        return Err(CoreError::EmptyTargetPath);
    }
    if target.contains('\0') {
        return Err(CoreError::InvalidTargetPath);
    }

    let path = PathBuf::from(target);
    if !path.is_absolute() {
        return Err(CoreError::RelativeTargetPath);
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CoreError::PathTraversal);
    }

    // The target itself may not exist yet, its parent must.
    if let Some(parent) = path.parent() {
        if parent.components().count() > 1 && !parent.exists() {
            return Err(CoreError::ParentDirectoryNotFound(parent.to_path_buf()));
        }
    }
    Ok(path)
}

pub fn include_path(include: &str) -> Result<()> {
    if include.trim().is_empty() {
        return Err(CoreError::EmptyIncludePath);
    }
    if include.contains('\0') {
        return Err(CoreError::InvalidIncludePath);
    }
    if include.matches("..").count() > 3 {
        return Err(CoreError::ExcessiveParentTraversal);
    }
    if Path::new(include).is_absolute() {
        return Err(CoreError::AbsoluteIncludePath);
    }
    Ok(())
}

/// Repository ids double as file and row keys.
pub fn repo_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CoreError::EmptyRepoId);
    }
    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(CoreError::InvalidRepoIdCharacters);
    }
    if id.len() > 100 {
        return Err(CoreError::RepoIdTooLong);
    }
    Ok(())
}

pub fn password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(CoreError::EmptyPassword);
    }
    if password.contains('\0') {
        return Err(CoreError::InvalidPassword);
    }
    Ok(())
}

pub fn repository_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::EmptyRepositoryName);
    }
    if name.len() > 200 {
        return Err(CoreError::RepositoryNameTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_path_rules() {
        assert!(repository_path("/srv/restic").is_ok());
        assert!(repository_path("sftp:backup@host:/repo").is_ok());
        assert!(repository_path("C:\\backups\\restic").is_ok());
        assert!(matches!(repository_path("  "), Err(CoreError::EmptyRepositoryPath)));
        assert!(matches!(repository_path("ftp://host/repo"), Err(CoreError::UnsupportedProtocol(_))));
        assert!(matches!(repository_path("gs:"), Err(CoreError::RemotePathTooShort)));
        assert!(matches!(repository_path("/srv/../etc"), Err(CoreError::PathTraversal)));
    }

    #[test]
    fn test_snapshot_id_rules() {
        assert!(snapshot_id("0123abcd").is_ok());
        assert!(matches!(snapshot_id("abc"), Err(CoreError::SnapshotIdTooShort)));
        assert!(matches!(snapshot_id(&"a".repeat(65)), Err(CoreError::SnapshotIdTooLong)));
        assert!(matches!(snapshot_id("latest00"), Err(CoreError::SnapshotIdNotHex)));
    }

    #[test]
    fn test_target_path_rules() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("restore");
        assert_eq!(target_path(target.to_str().unwrap()).unwrap(), target);

        let missing = dir.path().join("missing").join("restore");
        assert!(matches!(
            target_path(missing.to_str().unwrap()),
            Err(CoreError::ParentDirectoryNotFound(_))
        ));
        assert!(matches!(target_path("relative/dir"), Err(CoreError::RelativeTargetPath)));
    }

    #[test]
    fn test_include_path_rules() {
        assert!(include_path("home/user/docs").is_ok());
        assert!(matches!(include_path("/etc"), Err(CoreError::AbsoluteIncludePath)));
        assert!(matches!(
            include_path("../../../../x"),
            Err(CoreError::ExcessiveParentTraversal)
        ));
    }

    #[test]
    fn test_repo_id_and_credentials() {
        assert!(repo_id("nas-main_01").is_ok());
        assert!(matches!(repo_id("a/b"), Err(CoreError::InvalidRepoIdCharacters)));
        assert!(matches!(repo_id(&"x".repeat(101)), Err(CoreError::RepoIdTooLong)));
        assert!(matches!(password(""), Err(CoreError::EmptyPassword)));
        assert!(matches!(repository_name(" "), Err(CoreError::EmptyRepositoryName)));
    }
}

//! Filesystem mutations on resolved targets: delete, rename, copy and
//! batches of those.
//!
//! Every function takes [`ResolvedTarget`]s, so confinement and permission
//! checks have already happened by the time anything here runs.

use std::fs;
use std::io;
use std::path::Path;

use protocol::messages::{BatchAction, BatchItem, BatchOutcome, BatchRequest};
use protocol::ApiError;
use tracing::{debug, info, warn};

use super::scope::{resolve_for, Operation, ResolvedTarget};
use super::transfer::{ensure_dir, is_missing};
use crate::store::User;

async fn require_exists(target: &ResolvedTarget) -> Result<fs::Metadata, ApiError> {
    tokio::fs::symlink_metadata(&target.path).await.map_err(|e| {
        if is_missing(&e) {
            ApiError::not_found(format!("{} not found", target.logical))
        } else {
            ApiError::from(e)
        }
    })
}

async fn require_absent(target: &ResolvedTarget) -> Result<(), ApiError> {
    match tokio::fs::symlink_metadata(&target.path).await {
        Ok(_) => Err(ApiError::conflict(format!("{} already exists", target.logical))),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(ApiError::from(e)),
    }
}

fn reject_into_self(src: &ResolvedTarget, dst: &ResolvedTarget) -> Result<(), ApiError> {
    if dst.path.starts_with(&src.path) {
        return Err(ApiError::validation(format!(
            "cannot place {} inside itself at {}",
            src.logical, dst.logical
        )));
    }
    Ok(())
}

/// Same check against where `src` really lives, for a source that is a
/// symlink into the scope.
async fn reject_into_target(src: &ResolvedTarget, dst: &ResolvedTarget) -> Result<(), ApiError> {
    let real = tokio::fs::canonicalize(&src.path).await?;
    if dst.path.starts_with(&real) {
        return Err(ApiError::validation(format!(
            "cannot place {} inside its own target at {}",
            src.logical, dst.logical
        )));
    }
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<(), ApiError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }
    Ok(())
}

/// Move a non-directory without ever replacing `dst`: the hard link fails if
/// something appeared there since the absence check. Filesystems without
/// hard links fall back to a plain rename.
async fn move_no_replace(src: &Path, dst: &Path) -> io::Result<()> {
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => tokio::fs::remove_file(src).await,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!(error = %e, "Hard link unavailable, falling back to rename");
            tokio::fs::rename(src, dst).await
        }
    }
}

/// Remove the target; directories are removed recursively and a symlink is
/// removed without touching what it points at. A missing target is NotFound.
pub async fn delete(target: &ResolvedTarget) -> Result<(), ApiError> {
    let meta = require_exists(target).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(&target.path).await?;
    } else {
        tokio::fs::remove_file(&target.path).await?;
    }
    info!(path = %target.logical, "Deleted");
    Ok(())
}

/// Move `src` to `dst`. The destination must not exist; on any failure the
/// source is left untouched.
pub async fn rename(src: &ResolvedTarget, dst: &ResolvedTarget) -> Result<(), ApiError> {
    let meta = require_exists(src).await?;
    require_absent(dst).await?;
    reject_into_self(src, dst)?;
    ensure_parent(&dst.path).await?;

    let moved = if meta.is_dir() {
        tokio::fs::rename(&src.path, &dst.path).await
    } else {
        move_no_replace(&src.path, &dst.path).await
    };
    moved.map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => {
            ApiError::conflict(format!("{} already exists", dst.logical))
        }
        _ => ApiError::from(e),
    })?;
    info!(from = %src.logical, to = %dst.logical, "Renamed");
    Ok(())
}

/// Copy a file, or a directory tree, from `src` to `dst`. The destination
/// must not exist. A symlinked source is copied as what it points at.
pub async fn copy(src: &ResolvedTarget, dst: &ResolvedTarget) -> Result<(), ApiError> {
    require_exists(src).await?;
    require_absent(dst).await?;
    reject_into_self(src, dst)?;
    let meta = tokio::fs::metadata(&src.path).await?;
    if meta.is_dir() {
        reject_into_target(src, dst).await?;
    }
    ensure_parent(&dst.path).await?;

    if meta.is_dir() {
        let from = src.path.clone();
        let to = dst.path.clone();
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| ApiError::internal(format!("copy task failed: {}", e)))??;
    } else {
        tokio::fs::copy(&src.path, &dst.path).await?;
    }
    info!(from = %src.logical, to = %dst.logical, "Copied");
    Ok(())
}

/// Recursive directory copy. Symlinks inside the tree are skipped so a copy
/// never materializes content from outside the scope.
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest = to.join(entry.file_name());
        if file_type.is_symlink() {
            warn!(path = %entry.path().display(), "Skipping symlink during copy");
        } else if file_type.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

fn join_logical(dir: &str, item: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), item.trim_start_matches('/'))
}

/// Apply `request` to each item under the directory `dir`. Items run in
/// order and independently: each is scope-resolved on its own, and a failure
/// is recorded in its outcome without stopping the rest.
pub async fn run_batch(user: &User, dir: &str, request: &BatchRequest) -> Vec<BatchOutcome> {
    let mut outcomes = Vec::with_capacity(request.items.len());
    for item in &request.items {
        let result = run_batch_item(user, dir, request.action, item).await;
        if let Err(e) = &result {
            debug!(user_id = user.id, item = %item.from, error = %e, "Batch item failed");
        }
        outcomes.push(BatchOutcome {
            path: item.from.clone(),
            ok: result.is_ok(),
            error: result.err().map(|e| e.status_line()),
        });
    }
    outcomes
}

async fn run_batch_item(
    user: &User,
    dir: &str,
    action: BatchAction,
    item: &BatchItem,
) -> Result<(), ApiError> {
    let from = join_logical(dir, &item.from);
    match action {
        BatchAction::Delete => delete(&resolve_for(user, &from, Operation::Delete)?).await,
        BatchAction::Copy | BatchAction::Move => {
            let to = item
                .to
                .as_deref()
                .ok_or_else(|| ApiError::validation(format!("{} has no destination", item.from)))?;
            let to = join_logical(dir, to);
            if action == BatchAction::Copy {
                let src = resolve_for(user, &from, Operation::Copy)?;
                let dst = resolve_for(user, &to, Operation::Create)?;
                copy(&src, &dst).await
            } else {
                let src = resolve_for(user, &from, Operation::Rename)?;
                let dst = resolve_for(user, &to, Operation::Rename)?;
                rename(&src, &dst).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ErrorKind, Permissions, ViewMode};
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn create_test_user(temp: &TempDir, perm: Permissions) -> User {
        let scope = temp.path().join("scope");
        fs::create_dir_all(scope.join("docs/inner")).unwrap();
        fs::write(scope.join("docs/a.txt"), b"a").unwrap();
        fs::write(scope.join("docs/inner/b.txt"), b"b").unwrap();
        fs::write(scope.join("top.txt"), b"top").unwrap();
        User {
            id: 7,
            username: "dana".to_string(),
            password: String::new(),
            locale: "en".to_string(),
            view_mode: ViewMode::Mosaic,
            scope,
            perm,
        }
    }

    fn resolve(user: &User, path: &str, op: Operation) -> ResolvedTarget {
        resolve_for(user, path, op).unwrap()
    }

    #[tokio::test]
    async fn test_delete_file_and_directory() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        delete(&resolve(&user, "/top.txt", Operation::Delete))
            .await
            .unwrap();
        assert!(!user.scope.join("top.txt").exists());

        delete(&resolve(&user, "/docs", Operation::Delete))
            .await
            .unwrap();
        assert!(!user.scope.join("docs").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let target = resolve(&user, "/top.txt", Operation::Delete);
        delete(&target).await.unwrap();
        let err = delete(&target).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_symlink_keeps_target() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());
        symlink(user.scope.join("docs"), user.scope.join("shortcut")).unwrap();

        delete(&resolve(&user, "/shortcut", Operation::Delete))
            .await
            .unwrap();
        assert!(user.scope.join("docs/a.txt").exists());
    }

    #[tokio::test]
    async fn test_rename() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let src = resolve(&user, "/top.txt", Operation::Rename);
        let dst = resolve(&user, "/archive/2024/top.txt", Operation::Rename);
        rename(&src, &dst).await.unwrap();

        assert!(!user.scope.join("top.txt").exists());
        assert_eq!(fs::read(user.scope.join("archive/2024/top.txt")).unwrap(), b"top");
    }

    #[tokio::test]
    async fn test_rename_conflict_leaves_source() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let src = resolve(&user, "/top.txt", Operation::Rename);
        let dst = resolve(&user, "/docs/a.txt", Operation::Rename);
        let err = rename(&src, &dst).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(fs::read(user.scope.join("top.txt")).unwrap(), b"top");
        assert_eq!(fs::read(user.scope.join("docs/a.txt")).unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_rename_into_itself() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let src = resolve(&user, "/docs", Operation::Rename);
        let dst = resolve(&user, "/docs/inner/docs", Operation::Rename);
        assert_eq!(
            rename(&src, &dst).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn test_copy_file_and_tree() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());
        symlink("/etc/passwd", user.scope.join("docs/inner/escape")).unwrap();

        copy(
            &resolve(&user, "/top.txt", Operation::Copy),
            &resolve(&user, "/top-copy.txt", Operation::Create),
        )
        .await
        .unwrap();
        assert_eq!(fs::read(user.scope.join("top-copy.txt")).unwrap(), b"top");

        copy(
            &resolve(&user, "/docs", Operation::Copy),
            &resolve(&user, "/docs2", Operation::Create),
        )
        .await
        .unwrap();
        assert_eq!(fs::read(user.scope.join("docs2/inner/b.txt")).unwrap(), b"b");
        assert!(fs::symlink_metadata(user.scope.join("docs2/inner/escape")).is_err());
        // Source untouched.
        assert!(user.scope.join("docs/a.txt").exists());
    }

    #[tokio::test]
    async fn test_copy_conflict() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let err = copy(
            &resolve(&user, "/top.txt", Operation::Copy),
            &resolve(&user, "/docs/a.txt", Operation::Create),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_copy_symlinked_directory() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());
        symlink(user.scope.join("docs"), user.scope.join("alias")).unwrap();

        copy(
            &resolve(&user, "/alias", Operation::Copy),
            &resolve(&user, "/copy", Operation::Create),
        )
        .await
        .unwrap();
        let copied = fs::symlink_metadata(user.scope.join("copy")).unwrap();
        assert!(copied.is_dir());
        assert_eq!(fs::read(user.scope.join("copy/a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(user.scope.join("copy/inner/b.txt")).unwrap(), b"b");

        let err = copy(
            &resolve(&user, "/alias", Operation::Copy),
            &resolve(&user, "/docs/inner/again", Operation::Create),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!user.scope.join("docs/inner/again").exists());
    }

    #[tokio::test]
    async fn test_copy_under_file_is_conflict() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let err = copy(
            &resolve(&user, "/docs/a.txt", Operation::Copy),
            &resolve(&user, "/top.txt/a.txt", Operation::Create),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(fs::read(user.scope.join("top.txt")).unwrap(), b"top");
    }

    #[tokio::test]
    async fn test_move_never_replaces_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        fs::write(&src, b"src").unwrap();
        fs::write(&dst, b"dst").unwrap();

        let err = move_no_replace(&src, &dst).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&src).unwrap(), b"src");
        assert_eq!(fs::read(&dst).unwrap(), b"dst");

        fs::remove_file(&dst).unwrap();
        move_no_replace(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"src");
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let request = BatchRequest {
            action: BatchAction::Delete,
            items: vec![
                BatchItem {
                    from: "a.txt".to_string(),
                    to: None,
                },
                BatchItem {
                    from: "missing.txt".to_string(),
                    to: None,
                },
                BatchItem {
                    from: "../../outside".to_string(),
                    to: None,
                },
                BatchItem {
                    from: "inner".to_string(),
                    to: None,
                },
            ],
        };
        let outcomes = run_batch(&user, "/docs", &request).await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].ok);
        assert_eq!(outcomes[1].error.as_deref(), Some("404 Not Found"));
        assert_eq!(outcomes[2].error.as_deref(), Some("403 Forbidden"));
        assert!(outcomes[3].ok);
        assert!(!user.scope.join("docs/a.txt").exists());
        assert!(!user.scope.join("docs/inner").exists());
    }

    #[tokio::test]
    async fn test_batch_move_and_copy() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::all());

        let moves = BatchRequest {
            action: BatchAction::Move,
            items: vec![
                BatchItem {
                    from: "top.txt".to_string(),
                    to: Some("docs/top.txt".to_string()),
                },
                BatchItem {
                    from: "docs/a.txt".to_string(),
                    to: None,
                },
            ],
        };
        let outcomes = run_batch(&user, "/", &moves).await;
        assert!(outcomes[0].ok);
        assert_eq!(outcomes[1].error.as_deref(), Some("400 Bad Request"));
        assert!(user.scope.join("docs/top.txt").exists());

        let copies = BatchRequest {
            action: BatchAction::Copy,
            items: vec![BatchItem {
                from: "top.txt".to_string(),
                to: Some("a.txt".to_string()),
            }],
        };
        let outcomes = run_batch(&user, "/docs", &copies).await;
        assert_eq!(outcomes[0].error.as_deref(), Some("409 Conflict"));
    }

    #[tokio::test]
    async fn test_batch_respects_permissions_per_item() {
        let temp = TempDir::new().unwrap();
        let user = create_test_user(&temp, Permissions::read_only());

        let request = BatchRequest {
            action: BatchAction::Delete,
            items: vec![BatchItem {
                from: "top.txt".to_string(),
                to: None,
            }],
        };
        let outcomes = run_batch(&user, "/", &request).await;
        assert_eq!(outcomes[0].error.as_deref(), Some("403 Forbidden"));
        assert!(user.scope.join("top.txt").exists());
    }

    #[test]
    fn test_join_logical() {
        assert_eq!(join_logical("/", "a.txt"), "/a.txt");
        assert_eq!(join_logical("/docs/", "/a.txt"), "/docs/a.txt");
        assert_eq!(PathBuf::from(join_logical("/docs", "x")), PathBuf::from("/docs/x"));
    }
}

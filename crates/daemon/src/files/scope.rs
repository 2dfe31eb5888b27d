//! Path confinement and permission checks.
//!
//! Every filesystem path the daemon touches on behalf of a user comes out of
//! [`ScopeResolver`]. Resolution runs in a fixed order:
//!
//! 1. load the user record (absence is an authentication failure)
//! 2. lexically clean the logical path; `..` above the root is rejected
//! 3. check the permission bit for the operation, before any filesystem
//!    access (`admin` satisfies every bit)
//! 4. canonicalize the scope root and the existing part of the target's
//!    parent chain, and require the result to stay under the root
//! 5. if the final component is a symlink, require its target to stay under
//!    the root as well
//!
//! Mutating operations additionally require a strict descendant of the
//! root: the scope directory itself can be listed but not deleted, renamed
//! or overwritten.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use protocol::{ApiError, Permissions};
use tracing::warn;

use crate::auth::RequestContext;
use crate::store::{StoreError, User, UserStore};

/// What the caller intends to do with a resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Directory listing or metadata.
    List,
    /// Read file content.
    Download,
    /// Create a new file or directory.
    Create,
    /// Replace the content of an existing file.
    Modify,
    /// Rename or move.
    Rename,
    Delete,
    /// Duplicate a file or tree at a new location.
    Copy,
}

impl Operation {
    /// Whether `perm` grants this operation.
    pub fn allowed_by(&self, perm: &Permissions) -> bool {
        if perm.admin {
            return true;
        }
        match self {
            Operation::List => true,
            Operation::Download => perm.download,
            Operation::Create | Operation::Copy => perm.create,
            Operation::Modify => perm.modify,
            Operation::Rename => perm.rename,
            Operation::Delete => perm.delete,
        }
    }

    /// Operations that change the filesystem at the resolved path.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::List | Operation::Download)
    }
}

/// A scope-confined path authorized for one operation.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Absolute filesystem path under the user's canonical scope root.
    pub path: PathBuf,
    /// The canonical scope root itself.
    pub root: PathBuf,
    /// Cleaned logical path as the user addresses it, always starting with `/`.
    pub logical: String,
}

/// Maps logical resource paths onto confined filesystem paths.
#[derive(Clone)]
pub struct ScopeResolver {
    store: Arc<dyn UserStore>,
}

impl ScopeResolver {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Load the authenticated user. A missing record is reported as an
    /// authentication failure, never as not-found.
    pub fn load_user(&self, ctx: &RequestContext) -> Result<User, ApiError> {
        match self.store.get(ctx.user_id) {
            Ok(user) => Ok(user),
            Err(StoreError::NotExist) => Err(ApiError::auth_failure(format!(
                "token names unknown user {}",
                ctx.user_id
            ))),
            Err(e) => Err(ApiError::internal(e.to_string())),
        }
    }

    /// Load the user, then confine `logical` under their scope for `op`.
    pub fn resolve(
        &self,
        ctx: &RequestContext,
        logical: &str,
        op: Operation,
    ) -> Result<(User, ResolvedTarget), ApiError> {
        let user = self.load_user(ctx)?;
        let target = resolve_for(&user, logical, op)?;
        Ok((user, target))
    }
}

/// Confine `logical` under `user.scope` for `op`.
///
/// Each call is an independent confinement pass; rename and copy call it
/// once for the source and once for the destination.
pub fn resolve_for(user: &User, logical: &str, op: Operation) -> Result<ResolvedTarget, ApiError> {
    let relative = clean_logical(logical)?;

    if !op.allowed_by(&user.perm) {
        return Err(ApiError::permission_denied(format!(
            "user {} lacks permission for {:?}",
            user.id, op
        )));
    }

    let root = fs::canonicalize(&user.scope).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            ApiError::not_found(format!("scope root {} is missing", user.scope.display()))
        } else {
            ApiError::internal(format!("scope root {}: {}", user.scope.display(), e))
        }
    })?;

    let logical = display_logical(&relative);

    let file_name = match relative.file_name() {
        Some(name) => name.to_owned(),
        None => {
            if op.is_mutation() {
                return Err(ApiError::permission_denied(format!(
                    "{:?} on the scope root of user {}",
                    op, user.id
                )));
            }
            return Ok(ResolvedTarget {
                path: root.clone(),
                root,
                logical,
            });
        }
    };

    let parent_relative = relative.parent().unwrap_or_else(|| Path::new(""));
    let parent = canonicalize_existing(&root.join(parent_relative));
    if !parent.starts_with(&root) {
        warn!(user_id = user.id, path = %logical, "Path escapes scope through a symlinked directory");
        return Err(ApiError::permission_denied(format!(
            "{} escapes scope {}",
            logical,
            root.display()
        )));
    }

    let path = parent.join(&file_name);

    if let Ok(meta) = fs::symlink_metadata(&path) {
        if meta.file_type().is_symlink() {
            match fs::canonicalize(&path) {
                Ok(target) if target.starts_with(&root) => {}
                Ok(target) => {
                    warn!(
                        user_id = user.id,
                        path = %logical,
                        target = %target.display(),
                        "Symlink points outside scope"
                    );
                    return Err(ApiError::permission_denied(format!(
                        "{} links outside scope",
                        logical
                    )));
                }
                Err(_) => {
                    return Err(ApiError::permission_denied(format!(
                        "{} is a dangling symlink",
                        logical
                    )));
                }
            }
        }
    }

    Ok(ResolvedTarget {
        path,
        root,
        logical,
    })
}

/// Lexically normalize a logical path into a relative path with only normal
/// components. `.` and empty segments are dropped and `..` pops a segment;
/// popping past the root is an escape attempt.
pub fn clean_logical(logical: &str) -> Result<PathBuf, ApiError> {
    if logical.contains('\0') {
        return Err(ApiError::validation("path contains a NUL byte"));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in logical.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(ApiError::permission_denied(format!(
                        "{:?} climbs above the scope root",
                        logical
                    )));
                }
            }
            other => parts.push(other),
        }
    }

    let relative: PathBuf = parts.iter().collect();
    debug_assert!(relative
        .components()
        .all(|c| matches!(c, Component::Normal(_))));
    Ok(relative)
}

fn display_logical(relative: &Path) -> String {
    let mut out = String::from("/");
    out.push_str(&relative.to_string_lossy());
    out
}

/// Canonicalize the longest existing ancestor of `path` and append the
/// remaining (not yet existing) components unchanged.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(canonical) = fs::canonicalize(current) {
            let mut resolved = canonical;
            for component in missing.iter().rev() {
                resolved.push(component);
            }
            return resolved;
        }
        match (current.file_name(), current.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_owned());
                current = parent;
            }
            // Reached the filesystem root without resolving anything.
            _ => return path.to_path_buf(),
        }
    }
}

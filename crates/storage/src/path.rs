//! Path validation and security utilities.
//!
//! Backends address everything relative to their root. These functions keep
//! paths from escaping it.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Resolve `.`/`..` components, rejecting anything that would leave the
/// storage root. An empty result means "the root itself".
///
/// Use this for directory operations, where listing the root is legitimate.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use folio_storage::normalize_path;
/// assert_eq!(normalize_path("comics/./vol1/").unwrap(), Path::new("comics/vol1"));
/// assert_eq!(normalize_path(".").unwrap(), Path::new(""));
/// assert!(normalize_path("../outside").is_err());
/// ```
pub fn normalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls, reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    Ok(components.into_iter().collect())
}

/// Validates a storage path naming a file.
///
/// Same rules as [`normalize`], but the root itself is not a file and is
/// rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use folio_storage::validate_path;
/// assert!(validate_path("comics/vol1.cbz").is_ok());
/// assert!(validate_path("a/../page.png").is_ok());
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert!(validate_path("").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let normalized = normalize(path.as_ref())?;
    match normalized.as_os_str().is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(normalized),
    }
}

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Normalizes a view path to `/`-separated form with a leading `/`.
///
/// Backslashes count as separators. Empty and `.` segments are dropped;
/// `..` segments are kept for [`safe_join`] to judge.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split(['/', '\\']) {
        if segment.is_empty() || segment == "." {
            continue;
        }
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Joins `relative` under `root` without ever leaving it.
///
/// Root and prefix components are stripped so absolute names land inside
/// `root`. A `..` pops one level; popping past `root` is a
/// [`Error::PathTraversal`]. No filesystem access happens here, so symlinks
/// already under `root` are not resolved.
pub fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::path_traversal(relative.display().to_string()));
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    let mut joined = root.to_path_buf();
    joined.extend(parts);
    Ok(joined)
}

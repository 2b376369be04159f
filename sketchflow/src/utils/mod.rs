//! Timestamp and path helpers shared by the run log and the retention store.

pub mod timestamps;

pub use timestamps::{iso_timestamp, run_stamp, Timestamp, RUN_STAMP_FORMAT};

use std::path::{Component, Path};

/// Returns true when `relative` stays inside the directory it is joined to.
///
/// Absolute paths, `..` components and empty paths are rejected.
#[must_use]
pub fn is_contained_relative(relative: &Path) -> bool {
    if relative.as_os_str().is_empty() {
        return false;
    }
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Returns true when the path's extension (with leading dot) is in `extensions`.
#[must_use]
pub fn has_excluded_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|x| x.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contained_relative() {
        assert!(is_contained_relative(Path::new("a/b.json")));
        assert!(is_contained_relative(Path::new("./a.json")));
        assert!(!is_contained_relative(Path::new("../escape.json")));
        assert!(!is_contained_relative(Path::new("/etc/passwd")));
        assert!(!is_contained_relative(Path::new("")));
    }

    #[test]
    fn test_excluded_extension() {
        let excluded = vec![".py".to_string(), "md".to_string()];
        assert!(has_excluded_extension(Path::new("clean.py"), &excluded));
        assert!(has_excluded_extension(Path::new("README.MD"), &excluded));
        assert!(!has_excluded_extension(Path::new("result.json"), &excluded));
        assert!(!has_excluded_extension(Path::new("Makefile"), &excluded));
    }
}

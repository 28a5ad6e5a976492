//! Virtual path helpers
//!
//! Virtual paths are absolute, `/`-separated and never carry a trailing
//! slash (except for the root itself). Every component keys its tables by
//! the normalized form.

/// The root of the virtual tree
pub const ROOT: &str = "/";

/// Normalize a path to a consistent format
pub fn normalize(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments(path) {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Non-empty segments of a path, root first. `.` segments are dropped.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

/// Get the parent path of a given path
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => ROOT.to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

/// Get the final component of a path (empty for the root)
pub fn file_name(path: &str) -> &str {
    segments(path).last().unwrap_or("")
}

/// Append a single name to a normalized directory path
pub fn join(dir: &str, name: &str) -> String {
    if dir == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

pub fn is_root(path: &str) -> bool {
    segments(path).next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("foo"), "/foo");
        assert_eq!(normalize("/foo"), "/foo");
        assert_eq!(normalize("/foo/"), "/foo");
        assert_eq!(normalize("//foo/./bar"), "/foo/bar");
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("/"), "/");
        assert_eq!(parent("/foo"), "/");
        assert_eq!(parent("/foo/bar"), "/foo");
        assert_eq!(parent("/foo/bar/baz/"), "/foo/bar");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/"), "");
        assert_eq!(file_name("/foo"), "foo");
        assert_eq!(file_name("/foo/bar.txt"), "bar.txt");
        assert_eq!(file_name("/foo/bar/"), "bar");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "rox"), "/rox");
        assert_eq!(join("/rox", "apps"), "/rox/apps");
    }

    #[test]
    fn test_is_root() {
        assert!(is_root("/"));
        assert!(is_root(""));
        assert!(!is_root("/a"));
    }
}

//! Remote path normalization.
//!
//! Every path that reaches the SFTP layer or the execution engine goes through
//! [`normalize`] first. Resolution is purely lexical: nothing here touches the
//! remote filesystem, so symlinks are not followed.

use super::error::{RelayError, Result};

/// Validate and canonicalize a remote path.
///
/// - rejects empty input and embedded NUL, CR or LF
/// - converts backslashes to forward slashes
/// - requires an absolute path
/// - resolves `.` and `..` with a segment stack (`..` at root is a no-op)
///
/// The result never contains `.`/`..` segments, duplicate slashes or a
/// trailing slash (except the root itself).
///
/// ```ignore
/// assert_eq!(normalize("/a/b/../c")?, "/a/c");
/// assert_eq!(normalize("/a//b/./")?, "/a/b");
/// assert!(normalize("a").is_err());
/// ```
pub fn normalize(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(RelayError::InvalidPath("path is empty".to_string()));
    }
    if raw.contains(['\0', '\r', '\n']) {
        return Err(RelayError::InvalidPath(
            "path contains control characters".to_string(),
        ));
    }

    let unified = raw.replace('\\', "/");
    if !unified.starts_with('/') {
        return Err(RelayError::InvalidPath(format!(
            "'{}' is not an absolute path",
            raw
        )));
    }

    let mut stack: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    Ok(format!("/{}", stack.join("/")))
}

/// Join a canonical directory and a single entry name.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Parent of a canonical path (`/` is its own parent).
pub fn parent(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((head, _)) => head.to_string(),
    }
}

/// Last segment of a canonical path, `None` for the root.
pub fn file_name(path: &str) -> Option<&str> {
    path.rsplit('/').find(|s| !s.is_empty())
}

/// Validate a single destination entry name (no separators, no dot entries).
pub fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidPath("name is empty".to_string()));
    }
    if trimmed.contains(['/', '\\', '\0', '\r', '\n']) {
        return Err(RelayError::InvalidPath(format!(
            "'{}' must not contain path separators",
            trimmed
        )));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(RelayError::InvalidPath(format!(
            "'{}' is not a valid name",
            trimmed
        )));
    }
    Ok(trimmed)
}

/// Whether `candidate` is `base` itself or lies below it.
pub fn is_within(base: &str, candidate: &str) -> bool {
    if base == "/" {
        return true;
    }
    candidate == base
        || candidate
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod normalize_paths {
        use super::*;

        #[test]
        fn test_resolves_parent_segments() {
            assert_eq!(normalize("/a/b/../c").unwrap(), "/a/c");
        }

        #[test]
        fn test_collapses_duplicate_slashes_and_dots() {
            assert_eq!(normalize("/a//b/./").unwrap(), "/a/b");
        }

        #[test]
        fn test_relative_path_is_invalid() {
            assert!(matches!(normalize("a"), Err(RelayError::InvalidPath(_))));
        }

        #[test]
        fn test_empty_is_invalid() {
            assert!(matches!(normalize(""), Err(RelayError::InvalidPath(_))));
        }

        #[test]
        fn test_control_characters_are_invalid() {
            assert!(normalize("/tmp/a\0b").is_err());
            assert!(normalize("/tmp/a\nb").is_err());
            assert!(normalize("/tmp/a\rb").is_err());
        }

        #[test]
        fn test_backslashes_become_slashes() {
            assert_eq!(normalize("\\var\\log\\..\\www").unwrap(), "/var/www");
        }

        #[test]
        fn test_never_ascends_above_root() {
            assert_eq!(normalize("/../../..").unwrap(), "/");
            assert_eq!(normalize("/a/../../b").unwrap(), "/b");
        }

        #[test]
        fn test_root_variants() {
            assert_eq!(normalize("/").unwrap(), "/");
            assert_eq!(normalize("//").unwrap(), "/");
            assert_eq!(normalize("/.").unwrap(), "/");
        }

        #[test]
        fn test_output_has_no_dot_segments() {
            let inputs = ["/a/./b/../../c/.", "/x/y/z/../../..", "/./../a//./b/"];
            for input in inputs {
                let out = normalize(input).unwrap();
                assert!(out.starts_with('/'));
                assert!(!out.contains("//"), "{}", out);
                assert!(
                    out.split('/').all(|s| s != "." && s != ".."),
                    "{} -> {}",
                    input,
                    out
                );
            }
        }

        #[test]
        fn test_dotted_names_are_kept() {
            assert_eq!(normalize("/etc/.hidden/..cfg").unwrap(), "/etc/.hidden/..cfg");
        }
    }

    mod helpers {
        use super::*;

        #[test]
        fn test_join() {
            assert_eq!(join("/", "etc"), "/etc");
            assert_eq!(join("/etc", "nginx"), "/etc/nginx");
        }

        #[test]
        fn test_parent() {
            assert_eq!(parent("/"), "/");
            assert_eq!(parent("/etc"), "/");
            assert_eq!(parent("/etc/nginx/sites"), "/etc/nginx");
        }

        #[test]
        fn test_file_name() {
            assert_eq!(file_name("/"), None);
            assert_eq!(file_name("/etc/hosts"), Some("hosts"));
        }

        #[test]
        fn test_validate_name_rejects_separators() {
            assert!(validate_name("a/b").is_err());
            assert!(validate_name("a\\b").is_err());
            assert!(validate_name("..").is_err());
            assert!(validate_name("   ").is_err());
            assert_eq!(validate_name(" notes.txt ").unwrap(), "notes.txt");
        }

        #[test]
        fn test_is_within() {
            assert!(is_within("/a", "/a"));
            assert!(is_within("/a", "/a/b"));
            assert!(!is_within("/a", "/ab"));
            assert!(is_within("/", "/anything"));
        }
    }
}

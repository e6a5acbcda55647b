//! Lexical URL-path joining.
//!
//! The rewriting rules for the static backend, redirects, and the
//! fallback all splice configured path fragments onto request paths.
//! Joining is purely lexical: duplicate slashes collapse, `.` and `..`
//! segments resolve, and the result carries no trailing slash (callers
//! that need one restore it explicitly).

/// Lexically clean `path`: collapse repeated slashes, resolve `.` and
/// `..` segments, and drop any trailing slash. An empty result becomes
/// `"."` for relative paths and `"/"` for rooted ones.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|last| *last != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
                // ".." above a rooted path's root is dropped
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join path fragments with `/` and clean the result. Empty fragments
/// are skipped; joining nothing yields an empty string.
pub fn join(parts: &[&str]) -> String {
    let non_empty: Vec<&str> = parts.iter().copied().filter(|p| !p.is_empty()).collect();
    if non_empty.is_empty() {
        return String::new();
    }
    clean(&non_empty.join("/"))
}

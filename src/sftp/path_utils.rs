//! Remote path helpers
//!
//! SFTP paths always use `/`, even against Windows servers, so these work on
//! plain strings instead of `std::path`.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

pub fn is_root(path: &str) -> bool {
    normalize_remote_path(path) == "/"
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    let component = component.trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", component)
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Collapse `.`, `..`, repeated and trailing slashes of an absolute path.
///
/// `..` above the root stays at the root.
pub fn normalize_remote_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Parent directory; the root is its own parent
pub fn parent_of(path: &str) -> String {
    let normalized = normalize_remote_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => normalized[..idx].to_string(),
    }
}

/// Last path component, empty for the root
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// Make `path` absolute against `home` (for `~`) and `cwd` (for relative paths).
pub fn resolve_remote_path(path: &str, home: &str, cwd: &str) -> String {
    let path = path.trim();
    if path.is_empty() {
        return normalize_remote_path(cwd);
    }
    if path == "~" {
        return normalize_remote_path(home);
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return normalize_remote_path(&join_remote_path(home, rest));
    }
    if is_absolute_remote_path(path) {
        return normalize_remote_path(path);
    }
    normalize_remote_path(&join_remote_path(cwd, path))
}

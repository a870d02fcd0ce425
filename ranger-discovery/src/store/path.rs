//! Path scheme: `{basePath}/{serviceName}/{host}:{port}`

use super::StoreError;

/// Collapse leading and trailing slashes so the base path has exactly one leading slash
#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// `{basePath}/{serviceName}`
#[must_use]
pub fn service_path(base_path: &str, service_name: &str) -> String {
    format!(
        "{}/{}",
        normalize_base_path(base_path),
        service_name.trim_matches('/')
    )
}

/// `{basePath}/{serviceName}/{host}:{port}`
#[must_use]
pub fn instance_path(base_path: &str, service_name: &str, host: &str, port: u16) -> String {
    format!("{}/{}", service_path(base_path, service_name), node_name(host, port))
}

/// Child node name of an advertisement
#[must_use]
pub fn node_name(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Join a parent path and a child name
#[must_use]
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of an absolute path, `None` for the root
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Reject relative paths, trailing slashes and empty segments
pub fn validate(path: &str) -> Result<(), StoreError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

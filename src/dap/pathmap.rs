use crate::dap::args::PathMapping;

/// Translates paths between the client machine and the machine running the playbook.
///
/// Mappings are tried in configuration order and the first match wins. Matching is
/// case-sensitive and only happens on whole path components.
#[derive(Debug, Default, Clone)]
pub struct PathMapper {
    /// Pairs of (local prefix, remote prefix), both normalized.
    mappings: Vec<(String, String)>,
}

impl PathMapper {
    pub fn new(mappings: &[PathMapping]) -> Self {
        let mappings = mappings
            .iter()
            .map(|m| (Self::norm_root(&m.local_root), Self::norm_root(&m.remote_root)))
            .collect();
        Self { mappings }
    }

    /// Map a client path to the debuggee path.
    pub fn to_remote(&self, local_path: &str) -> String {
        for (local, remote) in &self.mappings {
            if let Some(suffix) = Self::strip_root(local_path, local) {
                return Self::join(remote, suffix);
            }
        }
        local_path.to_string()
    }

    /// Map a debuggee path to the client path.
    pub fn to_local(&self, remote_path: &str) -> String {
        for (local, remote) in &self.mappings {
            if let Some(suffix) = Self::strip_root(remote_path, remote) {
                return Self::join(local, suffix);
            }
        }
        remote_path.to_string()
    }

    fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
        if root.is_empty() {
            return None;
        }
        if path == root {
            return Some("");
        }
        let rest = path.strip_prefix(root)?;
        if root.ends_with('/') {
            return Some(rest);
        }
        rest.strip_prefix('/')
    }

    fn join(root: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            return root.to_string();
        }
        let mut out = root.to_string();
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(suffix);
        out
    }

    /// Drop trailing separators, except for the filesystem root.
    fn norm_root(s: &str) -> String {
        let trimmed = s.trim_end_matches('/');
        if trimmed.is_empty() && s.starts_with('/') {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

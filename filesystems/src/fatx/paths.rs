// Path handling for FATX volumes.
// FATX paths use '\' as the separator; '/' is accepted and substituted.
// The empty path and a lone separator both denote the root directory.

/// Normalize a path: substitute '/' and strip leading/trailing
/// separators. Root normalizes to the empty string.
pub fn normalize(path: &str) -> String {
    path.replace('/', "\\").trim_matches('\\').to_string()
}

/// Split a normalized path into components, dropping empty segments.
pub fn components(path: &str) -> Vec<&str> {
    path.split('\\').filter(|part| !part.is_empty()).collect()
}

/// Split a normalized path into its parent directory and leaf name.
/// The parent of a top-level name is the empty (root) path.
pub fn parent_and_leaf(path: &str) -> (&str, &str) {
    match path.rsplit_once('\\') {
        Some((parent, leaf)) => (parent, leaf),
        None => ("", path),
    }
}

/// True when `child` equals `parent` or lies underneath it, compared
/// case-insensitively on normalized paths. Guards recursive copy and
/// move against a directory landing inside its own subtree.
pub fn is_same_or_descendant(parent: &str, child: &str) -> bool {
    let parent = normalize(parent).to_ascii_lowercase();
    let child = normalize(child).to_ascii_lowercase();
    if parent.is_empty() {
        return true;
    }
    child == parent || child.starts_with(&format!("{}\\", parent))
}

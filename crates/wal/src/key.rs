//! Key shape validation (`spec.md` §4.10): dot-joined context path + leaf
//! key. Contexts may not be empty, may not contain `".."`, and may not
//! start or end with `"."`.

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("context path must not be empty")]
    EmptyContext,
    #[error("context path must not contain '..': {0}")]
    ParentTraversal(String),
    #[error("context path must not start or end with '.': {0}")]
    DotBoundary(String),
}

/// A validated, dot-joined context path (e.g. `"fabrics.1.acl"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextPath(String);

impl ContextPath {
    pub fn new(raw: impl Into<String>) -> Result<Self, KeyError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(KeyError::EmptyContext);
        }
        if raw.contains("..") {
            return Err(KeyError::ParentTraversal(raw));
        }
        if raw.starts_with('.') || raw.ends_with('.') {
            return Err(KeyError::DotBoundary(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The directory-safe encoding of this context path, used under
    /// `<root>/blobs/<encoded-context>/`.
    pub fn encoded(&self) -> String {
        self.0.replace('.', "_")
    }
}

impl std::fmt::Display for ContextPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_context() {
        assert!(matches!(ContextPath::new(""), Err(KeyError::EmptyContext)));
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(matches!(
            ContextPath::new("a..b"),
            Err(KeyError::ParentTraversal(_))
        ));
    }

    #[test]
    fn rejects_leading_and_trailing_dot() {
        assert!(matches!(ContextPath::new(".a"), Err(KeyError::DotBoundary(_))));
        assert!(matches!(ContextPath::new("a."), Err(KeyError::DotBoundary(_))));
    }

    #[test]
    fn accepts_ordinary_dotted_path() {
        assert!(ContextPath::new("fabrics.1.acl").is_ok());
    }
}

//! Spec-tree addressing: a `Path` names one location inside an object's
//! JSON tree, mixing mapping keys, positional indices, and keyed
//! sequence elements.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step into the spec tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathElem {
    /// Mapping key.
    Key(String),
    /// Positional index into an ordered sequence.
    Index(usize),
    /// Element of a set-valued sequence, identified by a field value
    /// (e.g. a container's `name`) instead of its position.
    Id { field: String, value: String },
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElem::Key(k) => write!(f, "{}", k),
            PathElem::Index(i) => write!(f, "[{}]", i),
            PathElem::Id { field, value } => write!(f, "[{}={}]", field, value),
        }
    }
}

/// Ordered sequence of path elements, root first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Path(Vec<PathElem>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    /// Build a path of plain mapping keys.
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Path(keys.into_iter().map(|k| PathElem::Key(k.into())).collect())
    }

    pub fn push(&self, elem: PathElem) -> Self {
        let mut elements = self.0.clone();
        elements.push(elem);
        Path(elements)
    }

    pub fn key(&self, name: &str) -> Self {
        self.push(PathElem::Key(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn elements(&self) -> &[PathElem] {
        &self.0
    }

    pub fn last(&self) -> Option<&PathElem> {
        self.0.last()
    }

    /// Last element when it is a plain key.
    pub fn last_key(&self) -> Option<&str> {
        match self.0.last() {
            Some(PathElem::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// True when `prefix` matches the leading elements of this path.
    pub fn starts_with(&self, prefix: &Path) -> bool {
        if prefix.0.len() > self.0.len() {
            return false;
        }
        self.0.iter().zip(prefix.0.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for elem in &self.0 {
            match elem {
                PathElem::Key(_) if !first => write!(f, ".{}", elem)?,
                _ => write!(f, "{}", elem)?,
            }
            first = false;
        }
        Ok(())
    }
}

impl FromIterator<PathElem> for Path {
    fn from_iter<I: IntoIterator<Item = PathElem>>(iter: I) -> Self {
        Path(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mixes_keys_indices_and_ids() {
        let p = Path::keys(["spec", "template", "spec", "containers"])
            .push(PathElem::Id { field: "name".into(), value: "web".into() })
            .key("image");
        assert_eq!(p.to_string(), "spec.template.spec.containers[name=web].image");

        let q = Path::keys(["spec", "ports"]).push(PathElem::Index(0)).key("port");
        assert_eq!(q.to_string(), "spec.ports[0].port");
    }

    #[test]
    fn prefix_matching_ignores_trailing_elements() {
        let prefix = Path::keys(["spec", "template"]);
        let deep = Path::keys(["spec", "template", "spec", "containers"])
            .push(PathElem::Index(0))
            .key("image");
        assert!(deep.starts_with(&prefix));
        assert!(!prefix.starts_with(&deep));
        assert!(deep.starts_with(&Path::root()));
        assert!(!deep.starts_with(&Path::keys(["spec", "selector"])));
    }

    #[test]
    fn last_key_skips_non_key_tails() {
        let p = Path::keys(["spec", "resources", "requests", "memory"]);
        assert_eq!(p.last_key(), Some("memory"));
        let q = Path::keys(["spec", "ports"]).push(PathElem::Index(1));
        assert_eq!(q.last_key(), None);
    }
}

//! Hierarchical resource names with typed version and segment components.
//!
//! Text form: `/endless/shards/abc/v=1700000000/seg=12`. A trailing `seg=` component
//! addresses one segment of a resource; a name without one is a "bare" name.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const VERSION_MARKER: &str = "v=";
const SEGMENT_MARKER: &str = "seg=";

/// One name component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    Generic(String),
    Version(u64),
    Segment(u64),
}

impl Component {
    fn parse(text: &str) -> Self {
        if let Some(v) = text.strip_prefix(VERSION_MARKER).and_then(|s| s.parse().ok()) {
            return Component::Version(v);
        }
        if let Some(n) = text.strip_prefix(SEGMENT_MARKER).and_then(|s| s.parse().ok()) {
            return Component::Segment(n);
        }
        Component::Generic(text.to_string())
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Generic(s) => f.write_str(s),
            Component::Version(v) => write!(f, "{}{}", VERSION_MARKER, v),
            Component::Segment(n) => write!(f, "{}{}", SEGMENT_MARKER, n),
        }
    }
}

/// Resource or segment name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Name {
    components: Vec<Component>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn push(&mut self, component: Component) {
        self.components.push(component);
    }

    /// Builder form of [`Name::push`].
    pub fn append(mut self, component: Component) -> Self {
        self.push(component);
        self
    }

    /// Segment addressed by this name (the trailing segment component), if any.
    pub fn segment(&self) -> Option<u64> {
        match self.components.last() {
            Some(Component::Segment(n)) => Some(*n),
            _ => None,
        }
    }

    /// Last version component, if any.
    pub fn version(&self) -> Option<u64> {
        self.components.iter().rev().find_map(|c| match c {
            Component::Version(v) => Some(*v),
            _ => None,
        })
    }

    /// This name with its trailing segment component removed.
    pub fn without_segment(&self) -> Name {
        let mut out = self.clone();
        if out.segment().is_some() {
            out.components.pop();
        }
        out
    }

    /// This name addressing segment `n`; an existing trailing segment is replaced.
    pub fn with_segment(&self, n: u64) -> Name {
        self.without_segment().append(Component::Segment(n))
    }

    /// Component-wise prefix test: `/a/b` is a prefix of `/a/b/seg=0`, not of `/a/bc`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        other.components.len() >= self.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a == b)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for c in &self.components {
            write!(f, "/{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for Name {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Name::from(s))
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name {
            components: s
                .split('/')
                .filter(|c| !c.is_empty())
                .map(Component::parse)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let name = Name::from("/endless/shards/abc/v=17/seg=3");
        assert_eq!(name.len(), 5);
        assert_eq!(name.segment(), Some(3));
        assert_eq!(name.version(), Some(17));
        assert_eq!(name.to_string(), "/endless/shards/abc/v=17/seg=3");
    }

    #[test]
    fn bare_name_has_no_segment() {
        let name = Name::from("endless/file");
        assert_eq!(name.segment(), None);
        assert_eq!(name.version(), None);
        assert_eq!(name.to_string(), "/endless/file");
        assert_eq!(Name::new().to_string(), "/");
    }

    #[test]
    fn malformed_markers_stay_generic() {
        let name = Name::from("/a/seg=x/v=");
        assert_eq!(
            name.components()[1],
            Component::Generic("seg=x".to_string())
        );
        assert_eq!(name.segment(), None);
        assert_eq!(name.version(), None);
    }

    #[test]
    fn with_segment_replaces_trailing_segment() {
        let name = Name::from("/a/b/seg=4");
        assert_eq!(name.with_segment(9).to_string(), "/a/b/seg=9");
        assert_eq!(Name::from("/a/b").with_segment(0).to_string(), "/a/b/seg=0");
        assert_eq!(name.without_segment().to_string(), "/a/b");
    }

    #[test]
    fn prefix_is_component_wise() {
        let base = Name::from("/a/b");
        assert!(base.is_prefix_of(&Name::from("/a/b/seg=0")));
        assert!(base.is_prefix_of(&base));
        assert!(!base.is_prefix_of(&Name::from("/a/bc")));
        assert!(!base.is_prefix_of(&Name::from("/a")));
        assert!(Name::new().is_prefix_of(&base));
    }
}

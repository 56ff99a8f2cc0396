use std::collections::BTreeSet;

/// The set of namespaces a caller may observe.
///
/// Resolved fresh for every request and never cached across requests. The
/// `BTreeSet` keeps the rendered matcher deterministic regardless of the
/// order the identity backend listed the namespaces in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceSet(BTreeSet<String>);

// === impl NamespaceSet ===

impl NamespaceSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.0.contains(namespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Renders the label matcher confining a query to this set.
    ///
    /// Namespace names are DNS-1123 labels, so no escaping is needed inside
    /// the regex alternation. An empty set renders a matcher that cannot
    /// match any value: `.^` requires a start-of-text after a character.
    pub fn matcher(&self) -> String {
        if self.0.is_empty() {
            return r#"namespace=~".^""#.to_string();
        }
        let mut alternation = String::new();
        for (i, ns) in self.0.iter().enumerate() {
            if i > 0 {
                alternation.push('|');
            }
            alternation.push_str(ns);
        }
        format!(r#"namespace=~"{alternation}""#)
    }
}

impl<S: Into<String>> FromIterator<S> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

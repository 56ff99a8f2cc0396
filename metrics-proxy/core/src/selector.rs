//! Vector-selector rewriting.
//!
//! A caller-supplied `match[]` argument is parsed against the two-token
//! grammar `name? ('{' body '}')?` and re-emitted with a `namespace`
//! matcher intersected in. This is the sole security boundary for
//! query-time scoping: a selector that does not fit the grammar is an
//! error, never passed through unmodified.

use crate::{error::Error, namespace::NamespaceSet};

/// A top-level PromQL instant-vector selector: an optional metric name and
/// an optional brace-delimited matcher body.
///
/// The body is kept as raw text; only selector syntax at the top level is
/// interpreted, so arbitrary matcher contents (including quoted braces)
/// survive the round trip. Parsing never mutates; rewriting produces a new
/// selector string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VectorSelector {
    name: String,
    matchers: Option<String>,
}

/// Rewrites `selector` so it can only match series whose `namespace` label
/// is in `namespaces`.
pub fn rewrite(selector: &str, namespaces: &NamespaceSet) -> Result<String, Error> {
    Ok(VectorSelector::parse(selector)?.scoped_to(namespaces))
}

// === impl VectorSelector ===

impl VectorSelector {
    pub fn parse(selector: &str) -> Result<Self, Error> {
        let (name, rest) = split_metric_name(selector);
        if rest.is_empty() {
            return Ok(Self {
                name: name.to_string(),
                matchers: None,
            });
        }

        // The matcher block runs from the first `{` to a `}` that must
        // terminate the input, mirroring a greedy match over the body.
        if rest.len() < 2 || !rest.starts_with('{') || !rest.ends_with('}') || rest.contains('\n')
        {
            return Err(Error::InvalidSelector(selector.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            matchers: Some(rest[1..rest.len() - 1].to_string()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matchers(&self) -> Option<&str> {
        self.matchers.as_deref()
    }

    /// Returns the selector text with the namespace clause intersected in.
    ///
    /// A series satisfies the result if and only if it satisfied the
    /// original selector and carries a `namespace` label in the set.
    pub fn scoped_to(&self, namespaces: &NamespaceSet) -> String {
        let clause = namespaces.matcher();
        match self.matchers.as_deref() {
            Some(body) if !body.is_empty() => format!("{}{{{body},{clause}}}", self.name),
            _ => format!("{}{{{clause}}}", self.name),
        }
    }
}

/// Splits a leading `[a-zA-Z_:][a-zA-Z0-9_:]*` metric name off `selector`.
fn split_metric_name(selector: &str) -> (&str, &str) {
    let mut end = 0;
    for (i, c) in selector.char_indices() {
        let valid = match c {
            'a'..='z' | 'A'..='Z' | '_' | ':' => true,
            '0'..='9' => i > 0,
            _ => false,
        };
        if !valid {
            break;
        }
        end = i + c.len_utf8();
    }
    selector.split_at(end)
}

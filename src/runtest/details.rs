//! Named attachments reported alongside a test outcome.

use std::collections::btree_map::{BTreeMap, Iter};
use std::fmt;

/// Named text attachments for a test report.
///
/// Names are unique; [`add_unique`](Details::add_unique) picks `name`,
/// `name-1`, `name-2`, ... so repeated faults do not overwrite each other.
///
/// # Example
///
/// ```rust
/// use testkit_reactor::runtest::Details;
///
/// let mut details = Details::new();
/// assert_eq!(details.add_unique("traceback", "first"), "traceback");
/// assert_eq!(details.add_unique("traceback", "second"), "traceback-1");
/// assert_eq!(details.get("traceback-1"), Some("second"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Details {
    entries: BTreeMap<String, String>,
}

impl Details {
    /// Create empty details.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a detail, replacing any existing one with the same name.
    pub fn insert(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.entries.insert(name.into(), content.into());
    }

    /// Adds a detail under the first free name derived from `name` and
    /// returns the name used.
    pub fn add_unique(&mut self, name: &str, content: impl Into<String>) -> String {
        let mut unique = name.to_string();
        let mut suffix = 0;
        while self.entries.contains_key(&unique) {
            suffix += 1;
            unique = format!("{name}-{suffix}");
        }
        self.entries.insert(unique.clone(), content.into());
        unique
    }

    /// The content of a detail.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Returns `true` if a detail with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Detail names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of details.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no details.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, content)` pairs in name order.
    pub fn iter(&self) -> Iter<'_, String, String> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a Details {
    type Item = (&'a String, &'a String);
    type IntoIter = Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for Details {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, content) in &self.entries {
            writeln!(f, "{name}: {{{{{{")?;
            writeln!(f, "{content}")?;
            writeln!(f, "}}}}}}")?;
        }
        Ok(())
    }
}

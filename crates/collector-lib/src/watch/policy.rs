//! Namespace inclusion policy

use std::collections::BTreeSet;

/// Decides which namespaces a watch loop processes
///
/// An empty include set admits every namespace not excluded. Exclusion
/// always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespacePolicy {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl NamespacePolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            include: include.into_iter().map(Into::into).collect(),
            exclude: exclude.into_iter().map(Into::into).collect(),
        }
    }

    /// Build from comma-separated lists; blank items are ignored
    pub fn parse(include: &str, exclude: &str) -> Self {
        Self::new(split_list(include), split_list(exclude))
    }

    pub fn allows(&self, namespace: &str) -> bool {
        if self.exclude.contains(namespace) {
            return false;
        }
        self.include.is_empty() || self.include.contains(namespace)
    }
}

fn split_list(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
}

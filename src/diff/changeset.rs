//! Change sets and revision ranges.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Keyword accepted in place of a previous revision for a first deployment.
pub const INITIAL_REVISION: &str = "initial";

/// A revision as given by a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Revision {
    /// No usable previous revision: everything tracked counts as changed.
    Initial,
    /// A commit-ish understood by the version control system.
    Commit(String),
}

impl Revision {
    /// Parses a trigger revision.
    ///
    /// The empty string, the keyword `initial` and the all-zero object id that
    /// push events carry for newly created refs all mean [`Revision::Initial`].
    #[must_use]
    pub fn parse(revision: &str) -> Self {
        let revision = revision.trim();
        if revision.is_empty()
            || revision.eq_ignore_ascii_case(INITIAL_REVISION)
            || is_null_object_id(revision)
        {
            Self::Initial
        } else {
            Self::Commit(revision.to_string())
        }
    }

    /// Returns true for [`Revision::Initial`].
    #[must_use]
    pub const fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "{INITIAL_REVISION}"),
            Self::Commit(rev) => write!(f, "{rev}"),
        }
    }
}

/// Returns true for an all-zero SHA-1 or SHA-256 object id.
fn is_null_object_id(revision: &str) -> bool {
    matches!(revision.len(), 40 | 64) && revision.bytes().all(|b| b == b'0')
}

/// The pair of revisions a deployment covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRange {
    /// Revision currently deployed.
    pub previous: Revision,
    /// Revision to deploy.
    pub current: String,
}

impl RevisionRange {
    /// Creates a new revision range.
    #[must_use]
    pub fn new(previous: Revision, current: impl Into<String>) -> Self {
        Self {
            previous,
            current: current.into(),
        }
    }
}

impl std::fmt::Display for RevisionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.previous, self.current)
    }
}

/// Distinct paths that differ between two revisions, in first-seen order.
///
/// A change set is built once per deployment attempt and never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    paths: Vec<String>,
    first_deploy: bool,
}

impl ChangeSet {
    /// Creates a change set from paths, dropping blanks and repeats.
    #[must_use]
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let paths = paths
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.trim().is_empty())
            .filter(|p| seen.insert(p.clone()))
            .collect();

        Self {
            paths,
            first_deploy: false,
        }
    }

    /// Creates a change set listing every tracked path of a first deployment.
    #[must_use]
    pub fn first_deploy<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            first_deploy: true,
            ..Self::new(paths)
        }
    }

    /// Gets the changed paths.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Iterates the changed paths.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Returns the number of changed paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Returns true if this set came from the first-deploy fallback.
    #[must_use]
    pub const fn is_first_deploy(&self) -> bool {
        self.first_deploy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_parse() {
        assert_eq!(Revision::parse("initial"), Revision::Initial);
        assert_eq!(Revision::parse(""), Revision::Initial);
        assert_eq!(Revision::parse(&"0".repeat(40)), Revision::Initial);
        assert_eq!(
            Revision::parse(" a1b2c3 "),
            Revision::Commit(String::from("a1b2c3"))
        );
        // Short all-zero strings are ordinary (if unlikely) revisions.
        assert!(!Revision::parse("000").is_initial());
    }

    #[test]
    fn test_changeset_keeps_first_seen_order() {
        let set = ChangeSet::new(["b/x", "a/y", "b/x", "", "c"]);
        assert_eq!(set.paths(), ["b/x", "a/y", "c"]);
        assert_eq!(set.len(), 3);
        assert!(!set.is_first_deploy());
    }

    #[test]
    fn test_first_deploy_flag() {
        let set = ChangeSet::first_deploy(vec![String::from("docker-compose.yml")]);
        assert!(set.is_first_deploy());
        assert!(ChangeSet::new(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_range_display() {
        let range = RevisionRange::new(Revision::Initial, "abc");
        assert_eq!(range.to_string(), "initial..abc");
    }
}

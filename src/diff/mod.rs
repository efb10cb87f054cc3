//! Change detection module.
//!
//! This module turns a pair of revisions into the set of changed paths:
//! - [`ChangeSet`] and [`RevisionRange`] value types
//! - The [`DiffSource`] seam and its git implementation

mod changeset;
mod git;

pub use changeset::{ChangeSet, INITIAL_REVISION, Revision, RevisionRange};
pub use git::{DiffSource, GitDiffReader};

#[cfg(test)]
pub use git::MockDiffSource;

//! Rule table fingerprinting.
//!
//! A deterministic hash of the rule table is shown with every plan and stored
//! in the deployment history, so a changed mapping is visible when comparing
//! two deployments of the same revision range.

use sha2::{Digest, Sha256};

use super::spec::{RuleConfig, RuleTargets};
use crate::planner::normalize_prefix;

/// Hasher for computing rule table fingerprints.
#[derive(Debug, Default)]
pub struct RuleTableHasher;

impl RuleTableHasher {
    /// Creates a new rule table hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the rule table.
    ///
    /// Rule order in the file does not matter: rules are hashed sorted by
    /// normalized prefix, matching how they are applied.
    #[must_use]
    pub fn hash_rules(&self, rules: &[RuleConfig]) -> String {
        let mut entries: Vec<(String, &RuleTargets)> = rules
            .iter()
            .map(|r| (normalize_prefix(&r.prefix), &r.targets))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (prefix, targets) in entries {
            hasher.update(prefix.as_bytes());
            hasher.update([0u8]);
            match targets {
                RuleTargets::All => hasher.update(b"*all*"),
                RuleTargets::Services(names) => {
                    // BTreeSet iteration is already sorted
                    for name in names {
                        hasher.update(name.as_bytes());
                        hasher.update([0u8]);
                    }
                }
            }
            hasher.update([0xffu8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

//! Path-prefix to service rule table.
//!
//! Rules are held in an explicitly ordered table, longest prefix first, so a
//! linear scan returns the most specific rule without any tie-break logic.

use std::collections::HashSet;

use crate::config::{RuleConfig, RuleTargets};
use crate::error::ConfigError;

/// Normalizes a rule prefix: surrounding whitespace, leading `./` and trailing
/// `/` are removed.
#[must_use]
pub fn normalize_prefix(prefix: &str) -> String {
    let mut p = prefix.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    p.trim_end_matches('/').to_string()
}

/// Normalizes a changed path the same way prefixes are normalized.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    normalize_prefix(path)
}

/// A single prefix rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRule {
    prefix: String,
    targets: RuleTargets,
}

impl ServiceRule {
    /// Creates a rule with an already normalized prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>, targets: RuleTargets) -> Self {
        Self {
            prefix: normalize_prefix(&prefix.into()),
            targets,
        }
    }

    /// Gets the normalized prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Gets the rule targets.
    #[must_use]
    pub const fn targets(&self) -> &RuleTargets {
        &self.targets
    }

    /// Returns true if the path lies under this rule's prefix.
    ///
    /// Matching is per path component: `api` matches `api` and `api/x`, not `apix`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
}

/// Rule table ordered by prefix length, longest first.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<ServiceRule>,
}

impl RuleTable {
    /// Builds the table from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a prefix is empty or two rules share a prefix.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut table = Vec::with_capacity(rules.len());

        for (i, rule) in rules.iter().enumerate() {
            let rule = ServiceRule::new(rule.prefix.as_str(), rule.targets.clone());
            if rule.prefix.is_empty() {
                return Err(ConfigError::validation(
                    "Rule prefix cannot be empty",
                    format!("rules[{i}].prefix"),
                ));
            }
            if !seen.insert(rule.prefix.clone()) {
                return Err(ConfigError::DuplicateRulePrefix {
                    prefix: rule.prefix,
                });
            }
            table.push(rule);
        }

        Ok(Self::from_rules(table))
    }

    /// Builds the table from rules, ordering them longest prefix first.
    #[must_use]
    pub fn from_rules(mut rules: Vec<ServiceRule>) -> Self {
        rules.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Self { rules }
    }

    /// Returns the most specific rule matching the path.
    #[must_use]
    pub fn longest_match(&self, path: &str) -> Option<&ServiceRule> {
        let path = normalize_path(path);
        self.rules.iter().find(|rule| rule.matches(&path))
    }

    /// Iterates rules in match order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceRule> {
        self.rules.iter()
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if the table has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

//! Change resolution.
//!
//! Maps every changed path to its most specific rule and folds the matches
//! into a [`DeploymentPlan`]. The first path whose rule targets every service
//! settles the plan as [`DeploymentPlan::All`]; later paths are not examined.

use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::RuleTargets;
use crate::diff::ChangeSet;

use super::plan::DeploymentPlan;
use super::rules::RuleTable;

/// How one changed path was matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathMatch {
    /// The changed path.
    pub path: String,
    /// Prefix of the matching rule, if any.
    pub rule: Option<String>,
    /// Targets of the matching rule, if any.
    pub targets: Option<RuleTargets>,
}

/// Resolved plan together with the per-path trace that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// The plan.
    pub plan: DeploymentPlan,
    /// Match trace, in change-set order, up to the deciding path.
    pub matches: Vec<PathMatch>,
    /// Paths not examined because an `all` rule had already matched.
    pub unexamined: usize,
}

impl Resolution {
    /// Number of paths no rule claimed.
    #[must_use]
    pub fn unmatched(&self) -> usize {
        self.matches.iter().filter(|m| m.rule.is_none()).count()
    }
}

/// Resolves change sets against a rule table.
#[derive(Debug, Clone, Copy)]
pub struct ChangeResolver<'a> {
    rules: &'a RuleTable,
}

impl<'a> ChangeResolver<'a> {
    /// Creates a resolver over the rule table.
    #[must_use]
    pub const fn new(rules: &'a RuleTable) -> Self {
        Self { rules }
    }

    /// Resolves the change set into a plan and match trace.
    #[must_use]
    pub fn resolve(&self, changes: &ChangeSet) -> Resolution {
        let mut services = BTreeSet::new();
        let mut matches = Vec::with_capacity(changes.len());

        for (i, path) in changes.iter().enumerate() {
            let Some(rule) = self.rules.longest_match(path) else {
                debug!("Unmatched path: {path}");
                matches.push(PathMatch {
                    path: path.to_string(),
                    rule: None,
                    targets: None,
                });
                continue;
            };

            debug!("Path {path} matched rule '{}'", rule.prefix());
            matches.push(PathMatch {
                path: path.to_string(),
                rule: Some(rule.prefix().to_string()),
                targets: Some(rule.targets().clone()),
            });

            match rule.targets() {
                RuleTargets::All => {
                    debug!("Rule '{}' redeploys every service", rule.prefix());
                    return Resolution {
                        plan: DeploymentPlan::All,
                        matches,
                        unexamined: changes.len() - i - 1,
                    };
                }
                RuleTargets::Services(names) => services.extend(names.iter().cloned()),
            }
        }

        Resolution {
            plan: DeploymentPlan::subset(services),
            matches,
            unexamined: 0,
        }
    }
}

/// Resolves a change set into a deployment plan.
#[must_use]
pub fn resolve(changes: &ChangeSet, rules: &RuleTable) -> DeploymentPlan {
    ChangeResolver::new(rules).resolve(changes).plan
}

//! Deployment plan type.
//!
//! A plan is the resolved decision of what to redeploy for one trigger. It is
//! built by the resolver or by an operator override and consumed once by the
//! executor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a deployment attempt will redeploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "services", rename_all = "snake_case")]
pub enum DeploymentPlan {
    /// Stop the whole stack, then rebuild and start it.
    All,
    /// Redeploy the named services one by one, leaving dependents untouched.
    ///
    /// Build it with [`DeploymentPlan::subset`], which never yields an empty set.
    Subset(BTreeSet<String>),
    /// Nothing to do.
    NoOp,
}

impl DeploymentPlan {
    /// Creates a subset plan, or [`DeploymentPlan::NoOp`] if no service is named.
    #[must_use]
    pub fn subset<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services: BTreeSet<String> = services.into_iter().map(Into::into).collect();
        if services.is_empty() {
            Self::NoOp
        } else {
            Self::Subset(services)
        }
    }

    /// Returns true if the plan redeploys the whole stack.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Returns true if the plan does nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        match self {
            Self::NoOp => true,
            Self::Subset(services) => services.is_empty(),
            Self::All => false,
        }
    }

    /// Gets the services of a subset plan.
    #[must_use]
    pub const fn services(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Subset(services) => Some(services),
            Self::All | Self::NoOp => None,
        }
    }

    /// Returns true if the plan redeploys the given service.
    #[must_use]
    pub fn includes(&self, service: &str) -> bool {
        match self {
            Self::All => true,
            Self::Subset(services) => services.contains(service),
            Self::NoOp => false,
        }
    }

    /// Short label used in logs and history.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Subset(_) => "subset",
            Self::NoOp => "noop",
        }
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "redeploy all services"),
            Self::Subset(services) => {
                let names: Vec<&str> = services.iter().map(String::as_str).collect();
                write!(f, "redeploy {}", names.join(", "))
            }
            Self::NoOp => write!(f, "nothing to deploy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_subset_is_noop() {
        assert_eq!(DeploymentPlan::subset(Vec::<String>::new()), DeploymentPlan::NoOp);
        assert!(DeploymentPlan::subset(["api"]).services().is_some());
    }

    #[test]
    fn test_includes() {
        let plan = DeploymentPlan::subset(["api", "mailer"]);
        assert!(plan.includes("api"));
        assert!(!plan.includes("web"));
        assert!(DeploymentPlan::All.includes("web"));
        assert!(!DeploymentPlan::NoOp.includes("web"));
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(DeploymentPlan::subset(["b", "a"])).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "subset", "services": ["a", "b"]}));

        let json = serde_json::to_value(DeploymentPlan::All).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "all"}));
    }

    #[test]
    fn test_display() {
        assert_eq!(DeploymentPlan::subset(["b", "a"]).to_string(), "redeploy a, b");
        assert_eq!(DeploymentPlan::NoOp.to_string(), "nothing to deploy");
    }
}

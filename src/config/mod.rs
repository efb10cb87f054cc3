//! Configuration module for the stackshift deployment system.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackshift.yaml`
//! - Validation of the rule table and secret declarations
//! - Fingerprinting the rule table for the deployment history

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DeployConfig, ProjectConfig, RawTargets, RepositoryConfig, RuleConfig, RuleTargets,
    RuntimeConfig, SecretSource, SecretsConfig, ServiceSecrets, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::RuleTableHasher;

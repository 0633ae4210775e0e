//! Stack definition module.
//!
//! This module handles everything about the declared desired state:
//! - Parsing and deserializing `stackplan.yaml`
//! - Validation of definition values
//! - Computing hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    EndpointVisibility, GuardrailsConfig, ProjectConfig, ReplaceStrategy, ResourceConfig,
    SettingsConfig, StackConfig, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;

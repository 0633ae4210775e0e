//! Definition parser for loading stack files.
//!
//! This module handles loading the stack definition from YAML files and
//! environment variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, StackError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Parser for loading stack definitions.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack definition from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack definition from: {}", path.display());

        if !path.exists() {
            return Err(StackError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack definition from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML stack definition");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack '{}' with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack definition with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `STACKPLAN_<SECTION>_<KEY>` (e.g., `STACKPLAN_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut StackConfig) -> Result<()> {
        if let Ok(name) = std::env::var("STACKPLAN_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("STACKPLAN_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("STACKPLAN_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("STACKPLAN_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("STACKPLAN_API_ENDPOINT") {
            debug!("Overriding settings.api_endpoint from environment");
            config.settings.api_endpoint = endpoint.parse().map_err(|message: String| {
                StackError::Config(ConfigError::validation(message, "settings.api_endpoint"))
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider bearer token from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn get_provider_token() -> Result<String> {
        std::env::var("STACKPLAN_PROVIDER_TOKEN").map_err(|_| {
            StackError::Config(ConfigError::MissingEnvVar {
                name: String::from("STACKPLAN_PROVIDER_TOKEN"),
            })
        })
    }
}

/// Default definition file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackplan.yaml",
    "stackplan.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the definition file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no definition file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack definition: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{EndpointVisibility, ReplaceStrategy, StateBackend};

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
resources: []
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.settings.api_endpoint, EndpointVisibility::Private);
        assert_eq!(config.settings.parallelism, 10);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: apigw-alb
  environment: prod

state:
  backend: s3
  bucket: stack-state
  prefix: apigw-alb/prod

settings:
  api_endpoint: public
  parallelism: 4

variables:
  instance_type: t3.micro

defaults:
  proxy:
    type: HTTP_PROXY
    integration_http_method: ANY

resources:
  - id: vpc
    type: aws:ec2:Vpc
    properties:
      max_azs: 2
    immutable: [max_azs]
  - id: nlb
    type: aws:elbv2:NetworkLoadBalancer
    properties:
      vpc_id: "${vpc.id}"
    replace_strategy: create_before_delete
  - id: route
    type: aws:apigateway:Integration
    extends: [proxy]
    endpoint: public
    depends_on: [nlb]
    properties:
      uri: "http://${nlb.dns_name}:3000/external/"
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.settings.parallelism, 4);
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.resources[0].immutable, vec![String::from("max_azs")]);
        assert_eq!(
            config.resources[1].replace_strategy,
            ReplaceStrategy::CreateBeforeDelete
        );
        assert_eq!(config.resources[2].extends, vec![String::from("proxy")]);
        assert_eq!(config.resources[2].endpoint, Some(EndpointVisibility::Public));
        assert_eq!(config.defaults["proxy"]["type"], "HTTP_PROXY");
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        let yaml = r"
project:
  name: demo
state:
  backend: consul
";
        let result = ConfigParser::new().parse_yaml(yaml, None);
        assert!(matches!(
            result,
            Err(StackError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("stackplan.yaml"), "project:\n  name: x\n").unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stackplan.yaml"));
    }
}

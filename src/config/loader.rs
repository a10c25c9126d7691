//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::LloadConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<LloadConfig, ConfigError> {
    let config: LloadConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<LloadConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TierKind;

    #[test]
    fn parses_full_example() {
        let config = parse_config(
            r#"
            [daemon]
            io_threads = 4

            [daemon.timeouts]
            operation_secs = 30

            [[listeners]]
            bind_address = "127.0.0.1:1389"

            [[tiers]]
            name = "primary"
            policy = "weighted"

            [[tiers.backends]]
            name = "ldap1"
            uri = "ldap://10.0.0.1:389"
            weight = 3
            numconns = 8

            [tiers.backends.bindconf]
            dn = "cn=lloadd,dc=example,dc=com"
            password = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.io_threads, 4);
        assert_eq!(config.daemon.timeouts.operation_secs, 30);
        assert_eq!(config.daemon.timeouts.connect_secs, 5);
        assert_eq!(config.tiers[0].policy, TierKind::Weighted);
        let backend = &config.tiers[0].backends[0];
        assert_eq!(backend.weight, 3);
        assert_eq!(backend.bindconf.as_ref().unwrap().dn, "cn=lloadd,dc=example,dc=com");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = parse_config("[daemon]\nio_threads = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("io_threads"));
    }
}

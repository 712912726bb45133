//! Process-wide configuration, read once at startup.
//!
//! Every key is required; a missing key is fatal before any subsystem
//! starts, so a half-configured deployment never launches instances.

use std::env;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
const AWS_REGION: &str = "AWS_REGION";
const AWS_SECURITY_GROUP: &str = "AWS_SECURITY_GROUP";
const DREAMSERVER_AMI: &str = "DREAMPICS_DREAMSERVER_AMI";
const DREAMSERVER_INSTANCE_TYPE: &str = "DREAMPICS_DREAMSERVER_INSTANCE_TYPE";
const STORAGE_BUCKET: &str = "GCS_BUCKET";

/// Static deployment settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub aws_region: String,
    pub aws_security_group: String,
    pub dream_server_ami: String,
    pub dream_server_instance_type: String,
    pub storage_bucket: String,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let require = |key: &'static str| -> Result<String, ConfigError> {
            match lookup(key) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(ConfigError::Missing(key)),
            }
        };

        Ok(Self {
            aws_access_key_id: require(AWS_ACCESS_KEY_ID)?,
            aws_secret_access_key: require(AWS_SECRET_ACCESS_KEY)?,
            aws_region: require(AWS_REGION)?,
            aws_security_group: require(AWS_SECURITY_GROUP)?,
            dream_server_ami: require(DREAMSERVER_AMI)?,
            dream_server_instance_type: require(DREAMSERVER_INSTANCE_TYPE)?,
            storage_bucket: require(STORAGE_BUCKET)?,
        })
    }
}

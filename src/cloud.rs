//! Cloud provider port and its EC2 implementation.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::config::{Credentials, Region};
use aws_sdk_ec2::error::DisplayErrorContext;
use aws_sdk_ec2::types::InstanceType;
use aws_sdk_ec2::Client as Ec2Client;

use crate::config::Settings;
use crate::error::{DreamError, Result};

/// Launch parameters shared by every dream server instance.
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub ami: String,
    pub instance_type: String,
    pub security_group: String,
}

impl LaunchTemplate {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ami: settings.dream_server_ami.clone(),
            instance_type: settings.dream_server_instance_type.clone(),
            security_group: settings.aws_security_group.clone(),
        }
    }
}

/// Thin port over the IaaS instance API.
///
/// `run_instance` must be idempotent in `client_token`: repeating a call
/// with the same token yields the same instance, which is what makes
/// launch retries safe.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn run_instance(
        &self,
        template: &LaunchTemplate,
        user_data: &str,
        client_token: &str,
    ) -> Result<String>;

    /// Public IPv4 of the instance, or `None` while the provider has no
    /// reservation or no address for it yet.
    async fn public_ip(&self, instance_id: &str) -> Result<Option<String>>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
}

/// EC2-backed provider.
pub struct Ec2Provider {
    client: Ec2Client,
}

impl Ec2Provider {
    pub async fn new(settings: &Settings) -> Self {
        let credentials = Credentials::new(
            settings.aws_access_key_id.clone(),
            settings.aws_secret_access_key.clone(),
            None,
            None,
            "dreampics-settings",
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.aws_region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        Self {
            client: Ec2Client::new(&config),
        }
    }
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    async fn run_instance(
        &self,
        template: &LaunchTemplate,
        user_data: &str,
        client_token: &str,
    ) -> Result<String> {
        let output = self
            .client
            .run_instances()
            .client_token(client_token)
            .image_id(&template.ami)
            .instance_type(InstanceType::from(template.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .user_data(user_data)
            .security_groups(&template.security_group)
            .send()
            .await
            .map_err(|err| DreamError::Provider(format!("{}", DisplayErrorContext(&err))))?;

        output
            .instances()
            .first()
            .and_then(|instance| instance.instance_id())
            .map(str::to_string)
            .ok_or_else(|| DreamError::Provider("RunInstances returned no instances".into()))
    }

    async fn public_ip(&self, instance_id: &str) -> Result<Option<String>> {
        let output = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| DreamError::Provider(format!("{}", DisplayErrorContext(&err))))?;

        let Some(reservation) = output.reservations().first() else {
            tracing::debug!(instance_id, "No reservation yet; terminated or still starting?");
            return Ok(None);
        };

        let ip = reservation
            .instances()
            .first()
            .and_then(|instance| instance.public_ip_address())
            .map(str::to_string);
        if ip.is_none() {
            tracing::debug!(instance_id, "No public IP yet; still starting up?");
        }

        Ok(ip)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|err| DreamError::Provider(format!("{}", DisplayErrorContext(&err))))?;

        Ok(())
    }
}

//! The dream server instance record embedded in jobs and pool rows.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cloud::CloudProvider;
use crate::error::{DreamError, Result};
use crate::worker::WorkerTarget;

/// One EC2 dream server. A plain value: a job owns its copy while
/// running, and a finished job copies it into a fresh pool row, so no
/// two records ever share a live instance object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// EC2 instance id. Empty until a launch request has been accepted.
    pub id: String,

    /// Auth code the worker requires on every request.
    pub auth_code: String,

    /// PEM certificate this worker must serve; requests to it refuse any
    /// other certificate.
    pub certificate: String,

    /// PEM private key matching `certificate`. Held only until launch
    /// succeeds, so retried launches can resend identical UserData; never
    /// stored afterwards.
    pub private_key: Option<String>,

    /// When the launch request was accepted.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub launch_time: Option<DateTime<Utc>>,

    /// Cached public IPv4, filled in by the first successful lookup.
    pub ip: Option<String>,
}

/// Boot payload the instance reads to configure its HTTPS endpoint.
#[derive(Serialize, Deserialize)]
struct UserData<'a> {
    auth_code: &'a str,
    ssl_certificate: &'a str,
    ssl_private_key: &'a str,
}

impl Instance {
    /// Base64 UserData blob for the launch request. Requires the private
    /// key, so it is only callable before a successful launch clears it.
    pub fn user_data(&self) -> Result<String> {
        let private_key = self.private_key.as_deref().ok_or_else(|| {
            DreamError::Internal("building UserData without a stored private key".into())
        })?;
        let payload = UserData {
            auth_code: &self.auth_code,
            ssl_certificate: &self.certificate,
            ssl_private_key: private_key,
        };

        Ok(STANDARD.encode(serde_json::to_vec(&payload)?))
    }

    /// Public IP for this instance: the cached value, or one provider
    /// lookup. An instance without a reservation or address yet is not
    /// ready, and the request that needed the IP fails immediately.
    pub async fn public_ip(&self, cloud: &dyn CloudProvider) -> Result<String> {
        if let Some(ip) = &self.ip {
            return Ok(ip.clone());
        }

        match cloud.public_ip(&self.id).await? {
            Some(ip) => Ok(ip),
            None => Err(DreamError::InstanceNotReady(format!(
                "no public IP for instance {}",
                self.id
            ))),
        }
    }

    pub fn worker_target(&self, ip: String) -> WorkerTarget {
        WorkerTarget {
            ip,
            certificate_pem: self.certificate.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launched_instance() -> Instance {
        Instance {
            id: "i-0abc".into(),
            auth_code: "code123".into(),
            certificate: "CERT PEM".into(),
            private_key: Some("KEY PEM".into()),
            launch_time: None,
            ip: None,
        }
    }

    #[test]
    fn test_user_data_encodes_boot_payload() {
        let instance = launched_instance();

        let encoded = instance.user_data().expect("user data should encode");
        let decoded = STANDARD.decode(encoded).expect("should be base64");
        let payload: serde_json::Value =
            serde_json::from_slice(&decoded).expect("should be JSON");

        assert_eq!(payload["auth_code"], "code123");
        assert_eq!(payload["ssl_certificate"], "CERT PEM");
        assert_eq!(payload["ssl_private_key"], "KEY PEM");
    }

    #[test]
    fn test_user_data_requires_private_key() {
        let mut instance = launched_instance();
        instance.private_key = None;

        assert!(instance.user_data().is_err());
    }
}

//! HTTPS client for talking to dream server workers.
//!
//! Trust is pinned per request: the only root certificate is the one the
//! job generated for this exact instance, system CAs are disabled, and
//! the hostname is fixed to `dreamserver` by resolving that name to the
//! instance's address. Dream operations run for a long time, so the
//! request deadline is 50 minutes; nothing between here and the socket
//! may shorten it.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use crate::error::{DreamError, Result};
use crate::tls::SERVER_NAME;

const WORKER_PORT: u16 = 8080;
const REQUEST_DEADLINE: Duration = Duration::from_secs(50 * 60);
const CONNECT_DEADLINE: Duration = Duration::from_secs(60);

/// Where and how to reach one worker.
#[derive(Debug, Clone)]
pub struct WorkerTarget {
    pub ip: String,
    pub certificate_pem: String,
}

/// A completed worker response. Any status is reported back; callers
/// decide what counts as success.
#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn get(&self, target: &WorkerTarget, path_and_query: &str) -> Result<WorkerResponse>;

    /// Multipart POST of a single file field.
    async fn post_file(
        &self,
        target: &WorkerTarget,
        path_and_query: &str,
        field: &str,
        data: Vec<u8>,
    ) -> Result<WorkerResponse>;
}

/// The real client.
#[derive(Debug, Default)]
pub struct HttpWorkerClient;

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self
    }

    fn client_for(&self, target: &WorkerTarget) -> Result<reqwest::Client> {
        let root = reqwest::Certificate::from_pem(target.certificate_pem.as_bytes())?;
        let ip = target.ip.parse().map_err(|_| {
            DreamError::InstanceNotReady(format!("invalid public IP: {}", target.ip))
        })?;

        Ok(reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .resolve(SERVER_NAME, SocketAddr::new(ip, WORKER_PORT))
            .timeout(REQUEST_DEADLINE)
            .connect_timeout(CONNECT_DEADLINE)
            .build()?)
    }

    fn url(path_and_query: &str) -> String {
        format!("https://{SERVER_NAME}:{WORKER_PORT}/{path_and_query}")
    }

    async fn finish(response: reqwest::Response) -> Result<WorkerResponse> {
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(WorkerResponse { status, body })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn get(&self, target: &WorkerTarget, path_and_query: &str) -> Result<WorkerResponse> {
        let client = self.client_for(target)?;
        let response = client.get(Self::url(path_and_query)).send().await?;
        Self::finish(response).await
    }

    async fn post_file(
        &self,
        target: &WorkerTarget,
        path_and_query: &str,
        field: &str,
        data: Vec<u8>,
    ) -> Result<WorkerResponse> {
        let part = Part::bytes(data).file_name(field.to_string());
        let form = Form::new().part(field.to_string(), part);

        let client = self.client_for(target)?;
        let response = client
            .post(Self::url(path_and_query))
            .multipart(form)
            .send()
            .await?;
        Self::finish(response).await
    }
}

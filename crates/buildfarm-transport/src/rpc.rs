//! HTTP/JSON worker RPC client.
//!
//! Every call is a POST of a JSON body to `<worker url>/rpc/<method>`, except
//! file downloads which GET `<worker url>/filecache/<hash>`.

use async_trait::async_trait;
use buildfarm_config::{ManagerConfig, TemplateContext};
use buildfarm_core::dispatch::{Credentials, DispatchRequest, StartResponse};
use buildfarm_core::report::StatusReport;
use buildfarm_core::transport::{TransportFactory, WorkerTransport};
use buildfarm_core::worker::Worker;
use buildfarm_core::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeouts and the reset command shared by all worker clients.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub socket_timeout: Duration,
    pub virtualized_socket_timeout: Duration,
    /// Command template run by `resume`, e.g. `ssh ${vm_host} resume ${worker}`.
    pub vm_resume_command: Option<String>,
    pub resume_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(40),
            virtualized_socket_timeout: Duration::from_secs(30),
            vm_resume_command: None,
            resume_timeout: Duration::from_secs(180),
        }
    }
}

impl TransportSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            socket_timeout: config.socket_timeout,
            virtualized_socket_timeout: config.virtualized_socket_timeout,
            vm_resume_command: config.vm_resume_command.clone(),
            ..Self::default()
        }
    }
}

/// Creates one `HttpWorkerClient` per worker over a shared connection pool.
pub struct HttpTransportFactory {
    client: reqwest::Client,
    settings: TransportSettings,
}

impl HttpTransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
        }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(&self, worker: &Worker) -> Arc<dyn WorkerTransport> {
        Arc::new(HttpWorkerClient::new(
            self.client.clone(),
            worker,
            &self.settings,
        ))
    }
}

/// RPC client for one worker.
pub struct HttpWorkerClient {
    client: reqwest::Client,
    worker: String,
    base_url: String,
    timeout: Duration,
    /// Interpolated reset command, program first.
    resume_command: Option<Vec<String>>,
    resume_timeout: Duration,
}

#[derive(Serialize)]
struct EchoRequest<'a> {
    message: &'a str,
}

#[derive(Deserialize)]
struct EchoResponse {
    message: String,
}

#[derive(Serialize)]
struct CacheFileRequest<'a> {
    content_hash: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
}

#[derive(Deserialize)]
struct CacheFileResponse {
    present: bool,
    #[serde(default)]
    info: String,
}

#[derive(Deserialize)]
struct Empty {}

impl HttpWorkerClient {
    pub fn new(client: reqwest::Client, worker: &Worker, settings: &TransportSettings) -> Self {
        let timeout = if worker.virtualized {
            settings.virtualized_socket_timeout
        } else {
            settings.socket_timeout
        };
        let resume_command = settings.vm_resume_command.as_ref().map(|template| {
            TemplateContext::for_worker(&worker.name, worker.vm_host.as_deref())
                .command_line(template)
        });
        Self {
            client,
            worker: worker.name.clone(),
            base_url: worker.url.trim_end_matches('/').to_string(),
            timeout,
            resume_command,
            resume_timeout: settings.resume_timeout,
        }
    }

    async fn call<B, R>(&self, method: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/rpc/{}", self.base_url, method);
        debug!(worker = %self.worker, method, "Worker RPC");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.request_error(method, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "{} on {} returned {}: {}",
                method, self.worker, status, text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| {
                Error::Protocol(format!("bad {} response from {}: {}", method, self.worker, e))
            })
    }

    fn request_error(&self, method: &str, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(format!("{} on {} after {:?}", method, self.worker, self.timeout))
        } else {
            Error::Transport(format!("{} on {}: {}", method, self.worker, err))
        }
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerClient {
    async fn echo(&self, message: &str) -> Result<String> {
        let response: EchoResponse = self.call("echo", &EchoRequest { message }).await?;
        Ok(response.message)
    }

    async fn cache_file(
        &self,
        content_hash: &str,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let request = CacheFileRequest {
            content_hash,
            url,
            username: credentials.map(|c| c.username.as_str()),
            password: credentials.map(|c| c.password.as_str()),
        };
        let response: CacheFileResponse = self.call("ensurepresent", &request).await?;
        if !response.present {
            return Err(Error::CannotFetchFile {
                url: url.to_string(),
                info: response.info,
            });
        }
        Ok(())
    }

    async fn start_build(&self, request: &DispatchRequest) -> Result<StartResponse> {
        self.call("build", request).await
    }

    async fn poll_status(&self) -> Result<StatusReport> {
        self.call("status", &serde_json::json!({})).await
    }

    async fn abort(&self) -> Result<()> {
        let _: Empty = self.call("abort", &serde_json::json!({})).await?;
        Ok(())
    }

    async fn clean(&self) -> Result<()> {
        let _: Empty = self.call("clean", &serde_json::json!({})).await?;
        Ok(())
    }

    async fn get_file(&self, content_hash: &str) -> Result<Bytes> {
        let url = format!(
            "{}/filecache/{}",
            self.base_url,
            urlencoding::encode(content_hash)
        );
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.request_error("filecache", e))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "fetching {} from {} returned {}",
                content_hash,
                self.worker,
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| self.request_error("filecache", e))
    }

    async fn resume(&self) -> Result<()> {
        let Some((program, args)) = self
            .resume_command
            .as_ref()
            .and_then(|cmd| cmd.split_first())
        else {
            return Err(Error::CannotResumeHost(format!(
                "no vm-resume-command configured for {}",
                self.worker
            )));
        };

        info!(worker = %self.worker, command = %program, "Resuming worker VM");
        let run = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.resume_timeout, run)
            .await
            .map_err(|_| {
                Error::CannotResumeHost(format!(
                    "resuming {} timed out after {:?}",
                    self.worker, self.resume_timeout
                ))
            })?
            .map_err(|e| Error::CannotResumeHost(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(worker = %self.worker, status = %output.status, "VM resume failed");
            return Err(Error::CannotResumeHost(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

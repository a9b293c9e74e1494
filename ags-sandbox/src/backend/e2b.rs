//! E2B-compatible backend
//!
//! The control plane is a REST API authenticated with `X-API-Key`. Code runs
//! through the sandbox's code-interpreter endpoint, which answers with a
//! newline-delimited JSON event stream authenticated with `X-Access-Token`.
//! Files and processes go through the sandbox daemon (envd): plain HTTP for
//! file contents and Connect-protocol JSON calls for everything else.

use crate::error::{Result, SandboxError};
use crate::token_cache::TokenCache;
use crate::types::{
    CodeRequest, Execution, ExecutionError, FileEntry, FileType, OutputChunk, OutputSender,
    ProcessInfo, ResultPayload, SandboxInfo, SandboxRef,
};
use ags_common::E2bConfig;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Port the code interpreter listens on inside a sandbox
const CODE_INTERPRETER_PORT: u16 = 49999;
/// Port of the sandbox daemon
const ENVD_PORT: u16 = 49983;
/// Sandbox user for daemon calls
const ENVD_USER: &str = "user";
/// `user:` as HTTP basic credentials; envd reads the user from this header
const ENVD_USER_AUTH: &str = "Basic dXNlcjo=";

/// Where to reach the control plane and sandbox data planes
#[derive(Debug, Clone)]
pub struct E2bEndpoints {
    api_base: String,
    data_plane: DataPlane,
}

#[derive(Debug, Clone)]
enum DataPlane {
    /// `https://{port}-{sandbox_id}.{domain}`
    Domain(String),
    /// Every sandbox is reached through one base URL
    Fixed(String),
}

impl E2bEndpoints {
    pub fn from_config(config: &E2bConfig) -> Self {
        Self {
            api_base: config.api_endpoint(),
            data_plane: DataPlane::Domain(config.data_plane_domain()),
        }
    }

    /// Route both planes through one base URL (proxies, tests)
    pub fn fixed(base_url: impl Into<String>) -> Self {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self {
            api_base: base.clone(),
            data_plane: DataPlane::Fixed(base),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn data_plane_url(&self, port: u16, sandbox_id: &str, path: &str) -> String {
        match &self.data_plane {
            DataPlane::Domain(domain) => {
                format!("https://{}-{}.{}{}", port, sandbox_id, domain, path)
            }
            DataPlane::Fixed(base) => format!("{}{}", base, path),
        }
    }

    fn execute_url(&self, sandbox_id: &str) -> String {
        self.data_plane_url(CODE_INTERPRETER_PORT, sandbox_id, "/execute")
    }

    fn envd_url(&self, sandbox_id: &str, path: &str) -> String {
        self.data_plane_url(ENVD_PORT, sandbox_id, path)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    envd_access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxDetail {
    #[serde(rename = "sandboxID", default)]
    sandbox_id: Option<String>,
    #[serde(rename = "templateID", default)]
    template_id: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    end_at: Option<String>,
    #[serde(default)]
    envd_access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "templateID", default)]
    template_id: Option<String>,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    end_at: Option<String>,
}

/// Protobuf JSON writes 64-bit integers as strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Int64 {
    Number(u64),
    Text(String),
}

impl Int64 {
    fn value(&self) -> u64 {
        match self {
            Int64::Number(n) => *n,
            Int64::Text(text) => text.parse().unwrap_or(0),
        }
    }
}

/// `EntryInfo` from the filesystem service
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvdEntry {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    path: String,
    #[serde(default)]
    size: Option<Int64>,
    #[serde(default)]
    permissions: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    symlink_target: Option<String>,
}

impl From<EnvdEntry> for FileEntry {
    fn from(entry: EnvdEntry) -> Self {
        let file_type = match entry.kind.as_deref() {
            Some("FILE_TYPE_FILE") => FileType::File,
            Some("FILE_TYPE_DIRECTORY") => FileType::Dir,
            _ => FileType::Other,
        };
        FileEntry {
            name: entry.name,
            path: entry.path,
            file_type,
            size: entry.size.as_ref().map(Int64::value).unwrap_or(0),
            permissions: entry.permissions.unwrap_or_default(),
            owner: entry.owner.filter(|s| !s.is_empty()),
            group: entry.group.filter(|s| !s.is_empty()),
            modified: entry.modified_time,
            symlink_target: entry.symlink_target.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListDirResponse {
    #[serde(default)]
    entries: Vec<EnvdEntry>,
}

#[derive(Debug, Deserialize)]
struct EntryResponse {
    entry: EnvdEntry,
}

#[derive(Debug, Default, Deserialize)]
struct EnvdProcessConfig {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnvdProcess {
    #[serde(default)]
    config: EnvdProcessConfig,
    pid: u32,
    #[serde(default)]
    tag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessListResponse {
    #[serde(default)]
    processes: Vec<EnvdProcess>,
}

/// One line of the code-interpreter stream
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ExecutionEvent {
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Result(ResultPayload),
    Error {
        name: String,
        value: String,
        #[serde(default)]
        traceback: String,
    },
    NumberOfExecutions {
        execution_count: u64,
    },
    EndOfExecution,
    #[serde(other)]
    Unknown,
}

fn apply_event(execution: &mut Execution, event: ExecutionEvent, output: Option<&OutputSender>) {
    match event {
        ExecutionEvent::Stdout { text } => {
            if let Some(tx) = output {
                let _ = tx.send(OutputChunk::stdout(text.clone()));
            }
            execution.stdout.push(text);
        }
        ExecutionEvent::Stderr { text } => {
            if let Some(tx) = output {
                let _ = tx.send(OutputChunk::stderr(text.clone()));
            }
            execution.stderr.push(text);
        }
        ExecutionEvent::Result(payload) => execution.results.push(payload),
        ExecutionEvent::Error {
            name,
            value,
            traceback,
        } => {
            execution.error = Some(ExecutionError {
                name,
                value,
                traceback,
            });
        }
        ExecutionEvent::NumberOfExecutions { execution_count } => {
            execution.execution_count = Some(execution_count);
        }
        ExecutionEvent::EndOfExecution | ExecutionEvent::Unknown => {}
    }
}

/// Splits a byte stream into non-empty lines
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

pub struct E2bBackend {
    client: Client,
    api_key: String,
    endpoints: E2bEndpoints,
    sandbox_timeout: Duration,
    tokens: Arc<TokenCache>,
}

impl E2bBackend {
    pub fn new(
        api_key: impl Into<String>,
        endpoints: E2bEndpoints,
        sandbox_timeout: Duration,
        tokens: Arc<TokenCache>,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SandboxError::Http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoints,
            sandbox_timeout,
            tokens,
        })
    }

    async fn error_body(response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if body.is_empty() {
            status.to_string()
        } else {
            format!("{} - {}", status, body)
        }
    }

    async fn acquire_token(&self, instance_id: &str) -> std::result::Result<Option<String>, String> {
        let response = self
            .client
            .get(self.endpoints.api(&format!("/sandboxes/{}", instance_id)))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(Self::error_body(response).await);
        }
        let detail: SandboxDetail = response.json().await.map_err(|e| e.to_string())?;
        Ok(detail.envd_access_token.filter(|t| !t.is_empty()))
    }

    fn with_access_token(builder: RequestBuilder, sandbox: &SandboxRef) -> RequestBuilder {
        match &sandbox.access_token {
            Some(token) => builder.header("X-Access-Token", token),
            None => builder,
        }
    }

    /// Unary Connect call with JSON encoding
    async fn envd_call<T: DeserializeOwned>(
        &self,
        sandbox: &SandboxRef,
        procedure: &str,
        body: Value,
        to_error: fn(String) -> SandboxError,
    ) -> Result<T> {
        let url = self
            .endpoints
            .envd_url(&sandbox.id, &format!("/{}", procedure));
        let builder = self
            .client
            .post(url)
            .header("Connect-Protocol-Version", "1")
            .header(reqwest::header::AUTHORIZATION, ENVD_USER_AUTH)
            .json(&body);
        let response = Self::with_access_token(builder, sandbox)
            .send()
            .await
            .map_err(|e| to_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(to_error(Self::error_body(response).await));
        }
        response
            .json()
            .await
            .map_err(|e| to_error(format!("invalid {} response: {}", procedure, e)))
    }

    fn remember_token(&self, instance_id: &str, token: &str) {
        if let Err(e) = self.tokens.set(instance_id, token) {
            warn!(sandbox_id = instance_id, "Failed to cache access token: {}", e);
        }
    }
}

#[async_trait]
impl super::SandboxBackend for E2bBackend {
    fn name(&self) -> &str {
        "e2b"
    }

    async fn create(&self, tool: &str) -> Result<SandboxRef> {
        let body = json!({
            "templateID": tool,
            "timeout": self.sandbox_timeout.as_secs(),
        });
        let response = self
            .client
            .post(self.endpoints.api("/sandboxes"))
            .header("X-API-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SandboxError::Create(Self::error_body(response).await));
        }
        let created: CreatedSandbox = response
            .json()
            .await
            .map_err(|e| SandboxError::Create(format!("invalid response: {}", e)))?;

        let access_token = created.envd_access_token.filter(|t| !t.is_empty());
        if let Some(token) = &access_token {
            self.remember_token(&created.sandbox_id, token);
        }

        info!(sandbox_id = %created.sandbox_id, tool, "Created sandbox");
        Ok(SandboxRef {
            id: created.sandbox_id,
            tool: Some(tool.to_string()),
            access_token,
        })
    }

    async fn connect(&self, instance_id: &str) -> Result<SandboxRef> {
        let access_token = match self.tokens.get(instance_id) {
            Some(token) => Some(token),
            None => {
                debug!(sandbox_id = instance_id, "Token not cached, acquiring");
                let token = self
                    .acquire_token(instance_id)
                    .await
                    .map_err(|message| SandboxError::Connect {
                        instance_id: instance_id.to_string(),
                        message,
                    })?;
                if let Some(token) = &token {
                    self.remember_token(instance_id, token);
                }
                token
            }
        };

        Ok(SandboxRef {
            id: instance_id.to_string(),
            tool: None,
            access_token,
        })
    }

    async fn destroy(&self, sandbox: &SandboxRef) -> Result<()> {
        let response = self
            .client
            .delete(self.endpoints.api(&format!("/sandboxes/{}", sandbox.id)))
            .header("X-API-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| SandboxError::Destroy {
                sandbox_id: sandbox.id.clone(),
                message: e.to_string(),
            })?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => {}
            _ => {
                return Err(SandboxError::Destroy {
                    sandbox_id: sandbox.id.clone(),
                    message: Self::error_body(response).await,
                })
            }
        }

        if let Err(e) = self.tokens.delete(&sandbox.id) {
            warn!(sandbox_id = %sandbox.id, "Failed to drop cached token: {}", e);
        }
        info!(sandbox_id = %sandbox.id, "Destroyed sandbox");
        Ok(())
    }

    async fn run_code(
        &self,
        sandbox: &SandboxRef,
        request: &CodeRequest,
        output: Option<OutputSender>,
    ) -> Result<Execution> {
        let mut body = json!({
            "code": request.code,
            "language": request.language.as_str(),
        });
        if !request.env.is_empty() {
            let env: HashMap<&str, &str> = request
                .env
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            body["env_vars"] = json!(env);
        }

        let mut builder = Self::with_access_token(
            self.client
                .post(self.endpoints.execute_url(&sandbox.id))
                .json(&body),
            sandbox,
        );
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SandboxError::Execution(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Execution(Self::error_body(response).await));
        }

        let mut execution = Execution::default();
        let mut lines = LineBuffer::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| SandboxError::Execution(e.to_string()))?;
            for line in lines.push(&chunk) {
                let event: ExecutionEvent = serde_json::from_str(&line).map_err(|e| {
                    SandboxError::Execution(format!("malformed event: {}", e))
                })?;
                apply_event(&mut execution, event, output.as_ref());
            }
        }
        if let Some(line) = lines.finish() {
            let event: ExecutionEvent = serde_json::from_str(&line)
                .map_err(|e| SandboxError::Execution(format!("malformed event: {}", e)))?;
            apply_event(&mut execution, event, output.as_ref());
        }

        debug!(
            sandbox_id = %sandbox.id,
            stdout_chunks = execution.stdout.len(),
            failed = execution.error.is_some(),
            "Execution finished"
        );
        Ok(execution)
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let response = self
            .client
            .get(self.endpoints.api("/sandboxes"))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SandboxError::Http(Self::error_body(response).await));
        }
        let listed: Vec<ListedSandbox> = response.json().await?;
        Ok(listed
            .into_iter()
            .map(|s| SandboxInfo {
                id: s.sandbox_id,
                tool: s.alias.or(s.template_id),
                state: s.state,
                started_at: s.started_at,
                expires_at: s.end_at,
            })
            .collect())
    }

    async fn get(&self, instance_id: &str) -> Result<SandboxInfo> {
        let response = self
            .client
            .get(self.endpoints.api(&format!("/sandboxes/{}", instance_id)))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SandboxError::Connect {
                instance_id: instance_id.to_string(),
                message: Self::error_body(response).await,
            });
        }
        let detail: SandboxDetail = response.json().await?;
        Ok(SandboxInfo {
            id: detail
                .sandbox_id
                .unwrap_or_else(|| instance_id.to_string()),
            tool: detail.alias.or(detail.template_id),
            state: detail.state,
            started_at: detail.started_at,
            expires_at: detail.end_at,
        })
    }

    async fn list_files(
        &self,
        sandbox: &SandboxRef,
        path: &str,
        depth: u32,
    ) -> Result<Vec<FileEntry>> {
        let listed: ListDirResponse = self
            .envd_call(
                sandbox,
                "filesystem.Filesystem/ListDir",
                json!({ "path": path, "depth": depth.max(1) }),
                SandboxError::Filesystem,
            )
            .await?;
        Ok(listed.entries.into_iter().map(FileEntry::from).collect())
    }

    async fn stat_file(&self, sandbox: &SandboxRef, path: &str) -> Result<FileEntry> {
        let stat: EntryResponse = self
            .envd_call(
                sandbox,
                "filesystem.Filesystem/Stat",
                json!({ "path": path }),
                SandboxError::Filesystem,
            )
            .await?;
        Ok(stat.entry.into())
    }

    async fn read_file(&self, sandbox: &SandboxRef, path: &str) -> Result<Vec<u8>> {
        let builder = self
            .client
            .get(self.endpoints.envd_url(&sandbox.id, "/files"))
            .query(&[("path", path), ("username", ENVD_USER)]);
        let response = Self::with_access_token(builder, sandbox)
            .send()
            .await
            .map_err(|e| SandboxError::Filesystem(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Filesystem(format!(
                "{}: {}",
                path,
                Self::error_body(response).await
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SandboxError::Filesystem(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn write_file(&self, sandbox: &SandboxRef, path: &str, data: &[u8]) -> Result<()> {
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);
        let builder = self
            .client
            .post(self.endpoints.envd_url(&sandbox.id, "/files"))
            .query(&[("path", path), ("username", ENVD_USER)])
            .multipart(form);
        let response = Self::with_access_token(builder, sandbox)
            .send()
            .await
            .map_err(|e| SandboxError::Filesystem(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Filesystem(format!(
                "{}: {}",
                path,
                Self::error_body(response).await
            )));
        }
        debug!(sandbox_id = %sandbox.id, path, bytes = data.len(), "Uploaded file");
        Ok(())
    }

    async fn remove_file(&self, sandbox: &SandboxRef, path: &str) -> Result<()> {
        let _: IgnoredAny = self
            .envd_call(
                sandbox,
                "filesystem.Filesystem/Remove",
                json!({ "path": path }),
                SandboxError::Filesystem,
            )
            .await?;
        Ok(())
    }

    async fn make_dir(&self, sandbox: &SandboxRef, path: &str) -> Result<()> {
        let _: IgnoredAny = self
            .envd_call(
                sandbox,
                "filesystem.Filesystem/MakeDir",
                json!({ "path": path }),
                SandboxError::Filesystem,
            )
            .await?;
        Ok(())
    }

    async fn list_processes(&self, sandbox: &SandboxRef) -> Result<Vec<ProcessInfo>> {
        let listed: ProcessListResponse = self
            .envd_call(
                sandbox,
                "process.Process/List",
                json!({}),
                SandboxError::Execution,
            )
            .await?;
        Ok(listed
            .processes
            .into_iter()
            .map(|p| ProcessInfo {
                pid: p.pid,
                cmd: p.config.cmd,
                args: p.config.args,
                cwd: p.config.cwd.filter(|c| !c.is_empty()),
                tag: p.tag.filter(|t| !t.is_empty()),
            })
            .collect())
    }
}

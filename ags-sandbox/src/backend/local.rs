//! Local process backend
//!
//! Each sandbox is a working directory under a root folder; code runs as a
//! child process of the language's interpreter inside that directory. File
//! operations treat that directory as the sandbox's `/`.

use crate::error::{Result, SandboxError};
use crate::types::{
    CodeRequest, Execution, ExecutionError, FileEntry, FileType, Language, OutputChunk,
    OutputSender, SandboxInfo, SandboxRef, StreamKind,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const ID_PREFIX: &str = "local-";
const TOOL_MARKER: &str = ".ags-tool";
const READER_GRACE: Duration = Duration::from_secs(1);

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Sandboxes under the system temp directory
    pub fn new() -> Self {
        Self::with_root(std::env::temp_dir().join("ags-local"))
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of a sandbox, or `None` when `id` is not one of our ids.
    ///
    /// Ids are `local-` followed by `[A-Za-z0-9_-]`, so a valid id can never
    /// name a path outside the root.
    fn sandbox_dir(&self, id: &str) -> Option<PathBuf> {
        let suffix = id.strip_prefix(ID_PREFIX)?;
        let well_formed = !suffix.is_empty()
            && suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        well_formed.then(|| self.root.join(id))
    }

    /// Directory of a sandbox that must already exist
    fn existing_dir(&self, sandbox: &SandboxRef) -> Result<PathBuf> {
        match self.sandbox_dir(&sandbox.id) {
            Some(dir) if dir.is_dir() => Ok(dir),
            _ => Err(SandboxError::Connect {
                instance_id: sandbox.id.clone(),
                message: "no such local sandbox".to_string(),
            }),
        }
    }
}

/// Map a sandbox path onto the host, rejecting anything that climbs out.
///
/// Returns the host path and the normalised sandbox path (always absolute).
fn resolve(dir: &Path, path: &str) -> Result<(PathBuf, String)> {
    let mut host = dir.to_path_buf();
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => {
                host.push(part);
                parts.push(part.to_string_lossy().into_owned());
            }
            Component::ParentDir | Component::Prefix(_) => {
                return Err(SandboxError::Filesystem(format!(
                    "path escapes the sandbox: {}",
                    path
                )))
            }
        }
    }
    Ok((host, format!("/{}", parts.join("/"))))
}

fn fs_error(path: &str, err: std::io::Error) -> SandboxError {
    SandboxError::Filesystem(format!("{}: {}", path, err))
}

#[cfg(unix)]
fn permissions_string(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let kind = if metadata.is_dir() {
        'd'
    } else if metadata.file_type().is_symlink() {
        'l'
    } else {
        '-'
    };
    let mode = metadata.permissions().mode();
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
fn permissions_string(metadata: &std::fs::Metadata) -> String {
    let kind = if metadata.is_dir() { "d" } else { "-" };
    let write = if metadata.permissions().readonly() { "-" } else { "w" };
    format!("{}r{}-------", kind, write)
}

async fn entry_for(host: &Path, sandbox_path: String) -> std::io::Result<FileEntry> {
    let metadata = tokio::fs::symlink_metadata(host).await?;
    let file_type = if metadata.is_dir() {
        FileType::Dir
    } else if metadata.is_file() {
        FileType::File
    } else {
        FileType::Other
    };
    let symlink_target = if metadata.file_type().is_symlink() {
        tokio::fs::read_link(host)
            .await
            .ok()
            .map(|target| target.to_string_lossy().into_owned())
    } else {
        None
    };
    let name = match sandbox_path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "/".to_string(),
    };

    Ok(FileEntry {
        name,
        path: sandbox_path,
        file_type,
        size: metadata.len(),
        permissions: permissions_string(&metadata),
        owner: None,
        group: None,
        modified: metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
        symlink_target,
    })
}

/// Code from a process status; signals map to `128 + signo` like a shell
fn exit_status_code(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (Some(128 + signal), Some(signal));
        }
    }
    (status.code(), None)
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpreter command for a source file
fn interpreter(language: Language, file: &Path) -> (&'static str, Vec<String>) {
    let file = file.to_string_lossy().into_owned();
    match language {
        Language::Python => ("python3", vec![file]),
        Language::JavaScript => ("node", vec![file]),
        Language::TypeScript => ("npx", vec!["tsx".to_string(), file]),
        Language::R => ("Rscript", vec![file]),
        Language::Java => ("java", vec![file]),
        Language::Bash => ("bash", vec![file]),
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: StreamKind,
    output: Option<OutputSender>,
) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let text = format!("{}\n", line);
            if let Some(tx) = &output {
                let _ = tx.send(OutputChunk {
                    stream,
                    text: text.clone(),
                });
            }
            collected.push(text);
        }
        collected
    })
}

async fn collect_reader(
    mut handle: JoinHandle<Vec<String>>,
    limit: Option<Duration>,
) -> Vec<String> {
    match limit {
        None => handle.await.unwrap_or_default(),
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(lines) => lines.unwrap_or_default(),
            Err(_) => {
                handle.abort();
                Vec::new()
            }
        },
    }
}

#[async_trait]
impl super::SandboxBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self, tool: &str) -> Result<SandboxRef> {
        let id = format!("{}{}", ID_PREFIX, Uuid::new_v4().simple());
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::Create(format!("{}: {}", dir.display(), e)))?;
        tokio::fs::write(dir.join(TOOL_MARKER), tool)
            .await
            .map_err(|e| SandboxError::Create(format!("{}: {}", dir.display(), e)))?;

        debug!(sandbox_id = %id, tool, "Created local sandbox");
        Ok(SandboxRef {
            id,
            tool: Some(tool.to_string()),
            access_token: None,
        })
    }

    async fn connect(&self, instance_id: &str) -> Result<SandboxRef> {
        let dir = self.existing_dir(&SandboxRef::new(instance_id))?;
        let tool = tokio::fs::read_to_string(dir.join(TOOL_MARKER)).await.ok();
        Ok(SandboxRef {
            id: instance_id.to_string(),
            tool,
            access_token: None,
        })
    }

    async fn destroy(&self, sandbox: &SandboxRef) -> Result<()> {
        let dir = self
            .sandbox_dir(&sandbox.id)
            .ok_or_else(|| SandboxError::Destroy {
                sandbox_id: sandbox.id.clone(),
                message: "not a local sandbox id".to_string(),
            })?;
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| SandboxError::Destroy {
                sandbox_id: sandbox.id.clone(),
                message: e.to_string(),
            })?;
        debug!(sandbox_id = %sandbox.id, "Destroyed local sandbox");
        Ok(())
    }

    async fn run_code(
        &self,
        sandbox: &SandboxRef,
        request: &CodeRequest,
        output: Option<OutputSender>,
    ) -> Result<Execution> {
        let dir = match self.sandbox_dir(&sandbox.id) {
            Some(dir) if dir.is_dir() => dir,
            _ => {
                return Err(SandboxError::Execution(format!(
                    "sandbox {} does not exist",
                    sandbox.id
                )))
            }
        };

        let file = dir.join(format!(
            "main_{}{}",
            Uuid::new_v4().simple(),
            request.language.file_extension()
        ));
        tokio::fs::write(&file, &request.code)
            .await
            .map_err(|e| SandboxError::Execution(format!("failed to write source: {}", e)))?;

        let (program, args) = interpreter(request.language, &file);
        let spawned = Command::new(program)
            .args(&args)
            .current_dir(&dir)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&file).await;
                return Err(SandboxError::Execution(format!(
                    "failed to spawn {}: {}",
                    program, e
                )));
            }
        };

        let stdout_reader = child
            .stdout
            .take()
            .map(|out| spawn_reader(out, StreamKind::Stdout, output.clone()));
        let stderr_reader = child
            .stderr
            .take()
            .map(|err| spawn_reader(err, StreamKind::Stderr, output.clone()));
        drop(output);

        let mut error = None;
        let wait_result = match request.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status.map(Some),
                Err(_) => {
                    let _ = child.kill().await;
                    error = Some(ExecutionError {
                        name: "TimeoutError".to_string(),
                        value: format!("execution exceeded {:?}", limit),
                        traceback: String::new(),
                    });
                    Ok(None)
                }
            },
            None => child.wait().await.map(Some),
        };

        // Grandchildren of a killed process can keep the pipes open.
        let drain_limit = error.as_ref().map(|_| READER_GRACE);
        let mut execution = Execution::default();
        if let Some(handle) = stdout_reader {
            execution.stdout = collect_reader(handle, drain_limit).await;
        }
        if let Some(handle) = stderr_reader {
            execution.stderr = collect_reader(handle, drain_limit).await;
        }

        if let Err(e) = tokio::fs::remove_file(&file).await {
            warn!(path = %file.display(), "Failed to remove source file: {}", e);
        }

        match wait_result {
            Ok(Some(status)) => {
                let (code, signal) = exit_status_code(status);
                execution.exit_code = code;
                if let Some(signal) = signal {
                    error.get_or_insert(ExecutionError {
                        name: "Signal".to_string(),
                        value: format!("process terminated by signal {}", signal),
                        traceback: String::new(),
                    });
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(SandboxError::Execution(format!("process wait error: {}", e)));
            }
        }
        execution.error = error;
        Ok(execution)
    }

    async fn list(&self) -> Result<Vec<SandboxInfo>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SandboxError::Internal(e.to_string())),
        };

        let mut sandboxes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SandboxError::Internal(e.to_string()))?
        {
            let id = entry.file_name().to_string_lossy().into_owned();
            if !id.starts_with(ID_PREFIX) || !entry.path().is_dir() {
                continue;
            }
            let tool = tokio::fs::read_to_string(entry.path().join(TOOL_MARKER))
                .await
                .ok();
            let started_at = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
            sandboxes.push(SandboxInfo {
                id,
                tool,
                state: Some("running".to_string()),
                started_at,
                expires_at: None,
            });
        }
        sandboxes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sandboxes)
    }

    async fn list_files(
        &self,
        sandbox: &SandboxRef,
        path: &str,
        depth: u32,
    ) -> Result<Vec<FileEntry>> {
        let dir = self.existing_dir(sandbox)?;
        let (host, sandbox_path) = resolve(&dir, path)?;
        let marker = dir.join(TOOL_MARKER);

        let mut entries = Vec::new();
        let mut pending = vec![(host, sandbox_path, 1u32)];
        while let Some((host_dir, parent, level)) = pending.pop() {
            let mut read = tokio::fs::read_dir(&host_dir)
                .await
                .map_err(|e| fs_error(&parent, e))?;
            while let Some(item) = read.next_entry().await.map_err(|e| fs_error(&parent, e))? {
                let item_host = item.path();
                if item_host == marker {
                    continue;
                }
                let name = item.file_name().to_string_lossy().into_owned();
                let item_path = format!("{}/{}", parent.trim_end_matches('/'), name);
                let entry = entry_for(&item_host, item_path.clone())
                    .await
                    .map_err(|e| fs_error(&item_path, e))?;
                if entry.is_dir() && level < depth {
                    pending.push((item_host, item_path, level + 1));
                }
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn stat_file(&self, sandbox: &SandboxRef, path: &str) -> Result<FileEntry> {
        let dir = self.existing_dir(sandbox)?;
        let (host, sandbox_path) = resolve(&dir, path)?;
        entry_for(&host, sandbox_path)
            .await
            .map_err(|e| fs_error(path, e))
    }

    async fn read_file(&self, sandbox: &SandboxRef, path: &str) -> Result<Vec<u8>> {
        let dir = self.existing_dir(sandbox)?;
        let (host, _) = resolve(&dir, path)?;
        tokio::fs::read(&host).await.map_err(|e| fs_error(path, e))
    }

    async fn write_file(&self, sandbox: &SandboxRef, path: &str, data: &[u8]) -> Result<()> {
        let dir = self.existing_dir(sandbox)?;
        let (host, _) = resolve(&dir, path)?;
        if host == dir {
            return Err(SandboxError::Filesystem(format!("not a file path: {}", path)));
        }
        if let Some(parent) = host.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| fs_error(path, e))?;
        }
        tokio::fs::write(&host, data)
            .await
            .map_err(|e| fs_error(path, e))?;
        debug!(sandbox_id = %sandbox.id, path, bytes = data.len(), "Wrote file");
        Ok(())
    }

    async fn remove_file(&self, sandbox: &SandboxRef, path: &str) -> Result<()> {
        let dir = self.existing_dir(sandbox)?;
        let (host, _) = resolve(&dir, path)?;
        if host == dir {
            return Err(SandboxError::Filesystem(
                "refusing to remove the sandbox root".to_string(),
            ));
        }
        let metadata = tokio::fs::symlink_metadata(&host)
            .await
            .map_err(|e| fs_error(path, e))?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&host).await
        } else {
            tokio::fs::remove_file(&host).await
        };
        removed.map_err(|e| fs_error(path, e))
    }

    async fn make_dir(&self, sandbox: &SandboxRef, path: &str) -> Result<()> {
        let dir = self.existing_dir(sandbox)?;
        let (host, _) = resolve(&dir, path)?;
        tokio::fs::create_dir_all(&host)
            .await
            .map_err(|e| fs_error(path, e))
    }
}

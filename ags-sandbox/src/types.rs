//! Core types for sandbox execution

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

/// Languages supported by the code interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    JavaScript,
    TypeScript,
    R,
    Java,
    Bash,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::R => "r",
            Language::Java => "java",
            Language::Bash => "bash",
        }
    }

    /// Extension used for editor buffers and local source files
    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => ".py",
            Language::JavaScript => ".js",
            Language::TypeScript => ".ts",
            Language::R => ".r",
            Language::Java => ".java",
            Language::Bash => ".sh",
        }
    }

    /// Line comment prefix, including the trailing space
    pub fn comment_prefix(&self) -> &'static str {
        match self {
            Language::JavaScript | Language::TypeScript | Language::Java => "// ",
            Language::Python | Language::R | Language::Bash => "# ",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "javascript" | "js" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "r" => Ok(Language::R),
            "java" => Ok(Language::Java),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            other => Err(format!(
                "unsupported language '{}' (python, javascript, typescript, r, java, bash)",
                other
            )),
        }
    }
}

/// Request to execute code inside a sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    /// The code to execute
    pub code: String,

    pub language: Language,

    /// Optional timeout (None = backend default)
    pub timeout: Option<Duration>,

    /// Optional environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl CodeRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            timeout: None,
            env: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A piece of live output from a running execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            text: text.into(),
        }
    }
}

/// Channel a backend forwards live output into
pub type OutputSender = mpsc::UnboundedSender<OutputChunk>;

/// Structured error raised by the executed code (exception, timeout, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub traceback: String,
}

/// Rich result produced by the code interpreter (display data)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub png: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jpeg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub javascript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<Value>,
    #[serde(default)]
    pub is_main_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl ResultPayload {
    /// Whether the payload carries anything besides the main-result flag
    pub fn has_content(&self) -> bool {
        self.text.is_some()
            || self.html.is_some()
            || self.markdown.is_some()
            || self.svg.is_some()
            || self.png.is_some()
            || self.jpeg.is_some()
            || self.pdf.is_some()
            || self.latex.is_some()
            || self.javascript.is_some()
            || self.json.is_some()
            || self.data.is_some()
            || self.chart.is_some()
            || self.extra.is_some()
    }
}

/// Result of running code in a sandbox
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Stdout chunks in arrival order
    pub stdout: Vec<String>,

    /// Stderr chunks in arrival order
    pub stderr: Vec<String>,

    /// Rich display results
    #[serde(default)]
    pub results: Vec<ResultPayload>,

    /// Error raised by the executed code
    pub error: Option<ExecutionError>,

    /// Exit status of the remote process, when the backend reports one
    pub exit_code: Option<i32>,

    /// Interpreter execution counter, when the backend reports one
    pub execution_count: Option<u64>,
}

impl Execution {
    /// True when the code did not raise an error.
    ///
    /// A non-zero `exit_code` alone does not make an execution unsuccessful.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.concat()
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.concat()
    }

    /// Results worth displaying
    pub fn displayable_results(&self) -> impl Iterator<Item = &ResultPayload> {
        self.results.iter().filter(|r| r.has_content())
    }
}

/// Reference to a live sandbox instance
#[derive(Clone, PartialEq, Eq)]
pub struct SandboxRef {
    pub id: String,
    /// Tool (template) the sandbox was created from, if known
    pub tool: Option<String>,
    /// Data plane access token
    pub access_token: Option<String>,
}

impl SandboxRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: None,
            access_token: None,
        }
    }
}

impl fmt::Debug for SandboxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxRef")
            .field("id", &self.id)
            .field("tool", &self.tool)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Sandbox listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub tool: Option<String>,
    pub state: Option<String>,
    pub started_at: Option<String>,
    /// When the sandbox will be reclaimed, if the backend enforces a lifetime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Dir,
    Other,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Dir => "dir",
            FileType::Other => "other",
        }
    }
}

/// A file or directory inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Absolute path inside the sandbox
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    pub size: u64,
    /// `ls -l` style, e.g. `-rw-r--r--`
    pub permissions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }
}

/// A process running inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

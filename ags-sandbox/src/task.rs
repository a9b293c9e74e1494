//! Turning user input into an ordered list of execution tasks
//!
//! Sources are consulted in priority order: inline code, then files, then
//! piped stdin, then an interactive editor. Each source yields `repeat`
//! tasks with consecutive ids starting at 1.

use crate::types::Language;
use std::fmt;
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TaskBuildError {
    #[error("cannot use both -c and -f flags")]
    ConflictingSources,

    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read from stdin: {0}")]
    Stdin(#[source] io::Error),

    #[error("no editor found: set the $EDITOR environment variable")]
    NoEditor,

    #[error("editor failed: {0}")]
    Editor(String),
}

/// Where a task's code came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSource {
    Code,
    File(PathBuf),
    Stdin,
    Editor,
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskSource::Code => f.write_str("<code>"),
            TaskSource::File(path) => write!(f, "{}", path.display()),
            TaskSource::Stdin => f.write_str("<stdin>"),
            TaskSource::Editor => f.write_str("<editor>"),
        }
    }
}

/// One unit of work: a code snippet plus its identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionTask {
    /// 1-based, unique within a batch
    pub id: usize,
    pub code: String,
    pub source: TaskSource,
    /// 1-based copy index within the source's repeat group
    pub instance_number: usize,
    /// Copies made of this source
    pub total_instances: usize,
}

impl ExecutionTask {
    /// Instance number worth showing, `None` for unrepeated sources
    pub fn display_instance(&self) -> Option<usize> {
        (self.total_instances > 1).then_some(self.instance_number)
    }

    pub fn label(&self) -> TaskLabel {
        TaskLabel {
            id: self.id,
            source: self.source.to_string(),
            instance: self.display_instance(),
        }
    }
}

/// Compact task identity used to prefix live output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLabel {
    pub id: usize,
    pub source: String,
    pub instance: Option<usize>,
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.source)?;
        if let Some(n) = self.instance {
            write!(f, "#{}", n)?;
        }
        Ok(())
    }
}

/// Raw inputs collected from the command line
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    pub code: Option<String>,
    pub files: Vec<PathBuf>,
    /// Copies per source; values below 1 are treated as 1
    pub repeat: usize,
    /// Selects the editor template and buffer extension
    pub language: Language,
}

/// Interactive input channels consulted when no code or files are given
pub trait InputSource {
    /// Content piped into the process, `None` when stdin is a terminal
    fn read_piped(&mut self) -> Result<Option<String>, TaskBuildError>;

    /// Open an editor and return the code written, `None` when cancelled
    fn edit(&mut self, language: Language) -> Result<Option<String>, TaskBuildError>;
}

/// Process stdin plus `$EDITOR`
#[derive(Debug, Default)]
pub struct StdInputSource;

impl InputSource for StdInputSource {
    fn read_piped(&mut self) -> Result<Option<String>, TaskBuildError> {
        let stdin = io::stdin();
        if stdin.is_terminal() {
            return Ok(None);
        }
        let mut content = String::new();
        stdin
            .lock()
            .read_to_string(&mut content)
            .map_err(TaskBuildError::Stdin)?;
        Ok(Some(content))
    }

    fn edit(&mut self, language: Language) -> Result<Option<String>, TaskBuildError> {
        open_editor(language)
    }
}

/// Build the ordered task list for a run.
///
/// Returns an empty list when every source is empty; callers treat that as
/// "no code provided".
pub fn build_tasks(
    input: &TaskInput,
    interactive: &mut dyn InputSource,
) -> Result<Vec<ExecutionTask>, TaskBuildError> {
    let inline = input.code.as_deref().filter(|c| !c.is_empty());
    if inline.is_some() && !input.files.is_empty() {
        return Err(TaskBuildError::ConflictingSources);
    }

    let mut tasks = TaskList::new(input.repeat);

    if let Some(code) = inline {
        tasks.push(code, TaskSource::Code);
    } else if !input.files.is_empty() {
        for path in &input.files {
            let code = read_source_file(path)?;
            tasks.push(&code, TaskSource::File(path.clone()));
        }
    } else if let Some(code) = interactive.read_piped()?.filter(|c| !c.is_empty()) {
        tasks.push(&code, TaskSource::Stdin);
    } else if let Some(code) = interactive.edit(input.language)? {
        tasks.push(&code, TaskSource::Editor);
    }

    debug!(count = tasks.items.len(), "Built execution tasks");
    Ok(tasks.items)
}

fn read_source_file(path: &Path) -> Result<String, TaskBuildError> {
    std::fs::read_to_string(path).map_err(|source| TaskBuildError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

struct TaskList {
    repeat: usize,
    items: Vec<ExecutionTask>,
}

impl TaskList {
    fn new(repeat: usize) -> Self {
        Self {
            repeat: repeat.max(1),
            items: Vec::new(),
        }
    }

    fn push(&mut self, code: &str, source: TaskSource) {
        for instance in 1..=self.repeat {
            let id = self.items.len() + 1;
            self.items.push(ExecutionTask {
                id,
                code: code.to_string(),
                source: source.clone(),
                instance_number: instance,
                total_instances: self.repeat,
            });
        }
    }
}

/// Comment header written into a fresh editor buffer
pub fn editor_template(language: Language) -> String {
    let c = language.comment_prefix();
    format!(
        "{c}AGS Code Editor\n{c}Write your {lang} code below, save and exit to execute.\n{c}Leave empty or unchanged to cancel.\n\n",
        c = c,
        lang = language
    )
}

/// Trim the saved buffer; unchanged or empty buffers count as cancelled
pub fn normalize_editor_buffer(content: &str, template: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed == template.trim() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `$EDITOR`, then `$VISUAL`, then the first of vim, vi, nano on PATH
pub fn find_editor() -> Option<String> {
    for var in ["EDITOR", "VISUAL"] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    ["vim", "vi", "nano"]
        .into_iter()
        .find(|candidate| which::which(candidate).is_ok())
        .map(str::to_string)
}

/// Let the user write code in their editor.
///
/// Blocks until the editor exits.
pub fn open_editor(language: Language) -> Result<Option<String>, TaskBuildError> {
    let editor = find_editor().ok_or(TaskBuildError::NoEditor)?;
    let mut parts = editor.split_whitespace();
    let program = parts.next().ok_or(TaskBuildError::NoEditor)?;
    let args: Vec<&str> = parts.collect();

    let template = editor_template(language);
    let mut buffer = tempfile::Builder::new()
        .prefix("ags-code-")
        .suffix(language.file_extension())
        .tempfile()
        .map_err(|e| TaskBuildError::Editor(format!("failed to create temp file: {}", e)))?;
    buffer
        .write_all(template.as_bytes())
        .and_then(|_| buffer.flush())
        .map_err(|e| TaskBuildError::Editor(format!("failed to write temp file: {}", e)))?;

    debug!(editor = %editor, path = %buffer.path().display(), "Opening editor");
    let status = Command::new(program)
        .args(&args)
        .arg(buffer.path())
        .status()
        .map_err(|e| TaskBuildError::Editor(format!("failed to launch {}: {}", program, e)))?;
    if !status.success() {
        return Err(TaskBuildError::Editor(format!("{} exited with {}", program, status)));
    }

    let content = std::fs::read_to_string(buffer.path())
        .map_err(|e| TaskBuildError::Editor(format!("failed to read temp file: {}", e)))?;
    Ok(normalize_editor_buffer(&content, &template))
}

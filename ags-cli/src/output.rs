//! Rendering results as text or JSON

use ags_common::OutputFormat;
use ags_sandbox::{
    DispatchOutcome, Execution, ExecutionError, FileEntry, OutputChunk, ProcessInfo,
    ResultPayload, RunObserver, SandboxInfo, StreamKind, Summary, TaskLabel, TaskResult,
};
use chrono::DateTime;
use serde::Serialize;
use std::io::{self, Write};
use std::time::Duration;

pub fn format_duration(duration: Duration) -> String {
    if duration >= Duration::from_secs(1) {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// `Time: 2.00s (create: 500ms, exec: 1.50s)`, phases only when a sandbox was created
pub fn phase_timing(total: Duration, creation: Duration, execution: Duration) -> String {
    if creation.is_zero() {
        format!("Time: {}", format_duration(total))
    } else {
        format!(
            "Time: {} (create: {}, exec: {})",
            format_duration(total),
            format_duration(creation),
            format_duration(execution)
        )
    }
}

fn timing_line(result: &TaskResult) -> String {
    phase_timing(
        result.total_duration,
        result.creation_duration,
        result.execution_duration,
    )
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}

fn format_modified(modified: Option<&str>) -> String {
    match modified {
        Some(text) => DateTime::parse_from_rfc3339(text)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|_| text.to_string()),
        None => "-".to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// `━━━ Task 2: main.py (2/3) [FAILED] ━━━`
pub fn task_header(result: &TaskResult) -> String {
    let task = &result.task;
    let status = if result.is_failure() { " [FAILED]" } else { "" };
    if task.total_instances > 1 {
        format!(
            "━━━ Task {}: {} ({}/{}){} ━━━",
            task.id, task.source, task.instance_number, task.total_instances, status
        )
    } else {
        format!("━━━ Task {}: {}{} ━━━", task.id, task.source, status)
    }
}

/// Prefix every line of a streamed chunk with the task label
pub fn prefix_lines(label: &TaskLabel, text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for line in text.split_inclusive('\n') {
        out.push_str(&format!("[{}] {}", label, line));
    }
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn write_error(out: &mut impl Write, error: &ExecutionError) -> io::Result<()> {
    writeln!(out, "{}: {}", error.name, error.value)?;
    if !error.traceback.is_empty() {
        writeln!(out, "{}", error.traceback)?;
    }
    Ok(())
}

fn write_results(out: &mut impl Write, execution: &Execution) -> io::Result<()> {
    for payload in execution.displayable_results() {
        if let Some(text) = &payload.text {
            writeln!(out, "{}", text)?;
        } else if let Some(markdown) = &payload.markdown {
            writeln!(out, "{}", markdown)?;
        } else if let Some(json) = &payload.json {
            writeln!(out, "{}", json)?;
        } else {
            writeln!(out, "[rich output omitted, use --output json]")?;
        }
    }
    Ok(())
}

/// One task block in batch text output
pub fn write_task(out: &mut impl Write, result: &TaskResult, show_time: bool) -> io::Result<()> {
    writeln!(out, "{}", task_header(result))?;

    match &result.outcome {
        Err(e) => {
            writeln!(out, "--- error ---")?;
            writeln!(out, "{}", e)?;
        }
        Ok(execution) => {
            for chunk in &execution.stdout {
                write!(out, "{}", chunk)?;
            }
            write_results(out, execution)?;
            if !execution.stderr.is_empty() {
                writeln!(out, "--- stderr ---")?;
                for chunk in &execution.stderr {
                    write!(out, "{}", chunk)?;
                }
            }
            if let Some(error) = &execution.error {
                writeln!(out, "--- error ---")?;
                write_error(out, error)?;
            }
        }
    }

    if show_time {
        writeln!(out, "{}", timing_line(result))?;
    }
    writeln!(out)
}

pub fn write_summary(out: &mut impl Write, summary: &Summary, show_time: bool) -> io::Result<()> {
    write!(
        out,
        "Total: {}, Succeeded: {}, Failed: {}",
        summary.total, summary.succeeded, summary.failed
    )?;
    if show_time {
        write!(out, ", Time: {}", format_duration(summary.duration))?;
    }
    writeln!(out)
}

#[derive(Debug, Serialize)]
struct TimingJson {
    total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    create_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exec_ms: Option<u64>,
}

impl TimingJson {
    fn of(result: &TaskResult) -> Self {
        let phased = !result.creation_duration.is_zero();
        Self {
            total_ms: result.total_duration.as_millis() as u64,
            create_ms: phased.then(|| result.creation_duration.as_millis() as u64),
            exec_ms: phased.then(|| result.execution_duration.as_millis() as u64),
        }
    }
}

#[derive(Debug, Serialize)]
struct TaskJson<'a> {
    id: usize,
    source: String,
    instance: usize,
    total_instances: usize,
    success: bool,
    stdout: &'a [String],
    stderr: &'a [String],
    results: &'a [ResultPayload],
    error: Option<&'a ExecutionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timing: Option<TimingJson>,
}

impl<'a> TaskJson<'a> {
    fn of(result: &'a TaskResult, show_time: bool) -> Self {
        let execution = result.execution();
        Self {
            id: result.task.id,
            source: result.task.source.to_string(),
            instance: result.task.instance_number,
            total_instances: result.task.total_instances,
            success: !result.is_failure(),
            stdout: execution.map(|e| e.stdout.as_slice()).unwrap_or(&[]),
            stderr: execution.map(|e| e.stderr.as_slice()).unwrap_or(&[]),
            results: execution.map(|e| e.results.as_slice()).unwrap_or(&[]),
            error: execution.and_then(|e| e.error.as_ref()),
            error_message: result.error().map(|e| e.to_string()),
            exit_code: execution.and_then(|e| e.exit_code),
            timing: show_time.then(|| TimingJson::of(result)),
        }
    }
}

#[derive(Debug, Serialize)]
struct SummaryJson {
    total: usize,
    succeeded: usize,
    failed: usize,
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct BatchJson<'a> {
    tasks: Vec<TaskJson<'a>>,
    summary: SummaryJson,
}

#[derive(Debug, Serialize)]
struct SingleJson<'a> {
    #[serde(flatten)]
    task: TaskJson<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<&'a str>,
}

pub fn batch_json(results: &[TaskResult], summary: &Summary, show_time: bool) -> serde_json::Value {
    let doc = BatchJson {
        tasks: results.iter().map(|r| TaskJson::of(r, show_time)).collect(),
        summary: SummaryJson {
            total: summary.total,
            succeeded: summary.succeeded,
            failed: summary.failed,
            exit_code: summary.exit_code(),
            total_ms: show_time.then(|| summary.duration.as_millis() as u64),
        },
    };
    serde_json::to_value(doc).unwrap_or(serde_json::Value::Null)
}

pub fn single_json(
    result: &TaskResult,
    kept_instance: Option<&str>,
    show_time: bool,
) -> serde_json::Value {
    let doc = SingleJson {
        task: TaskJson::of(result, show_time),
        instance_id: kept_instance,
    };
    serde_json::to_value(doc).unwrap_or(serde_json::Value::Null)
}

/// Final rendering settings for a command
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    pub format: OutputFormat,
    pub show_time: bool,
    /// Output was already streamed live
    pub streamed: bool,
    /// Task blocks were already printed as they finished
    pub progressive: bool,
}

impl Printer {
    pub fn print_json(value: &serde_json::Value) -> io::Result<()> {
        let mut out = io::stdout().lock();
        serde_json::to_writer_pretty(&mut out, value)?;
        writeln!(out)
    }

    /// Print a dispatch outcome and return the process exit code
    pub fn print_outcome(&self, outcome: &DispatchOutcome) -> io::Result<i32> {
        match outcome {
            DispatchOutcome::Single {
                result,
                exit_code,
                kept_instance,
            } => {
                self.print_single(result, kept_instance.as_deref())?;
                Ok(*exit_code)
            }
            DispatchOutcome::Batch { results, summary } => {
                self.print_batch(results, summary)?;
                Ok(summary.exit_code())
            }
        }
    }

    fn print_single(&self, result: &TaskResult, kept_instance: Option<&str>) -> io::Result<()> {
        if self.format.is_json() && !self.streamed {
            return Self::print_json(&single_json(result, kept_instance, self.show_time));
        }

        let Some(execution) = result.execution() else {
            return Ok(());
        };
        let mut err = io::stderr().lock();
        if !self.streamed {
            let mut out = io::stdout().lock();
            for chunk in &execution.stdout {
                write!(out, "{}", chunk)?;
            }
            write_results(&mut out, execution)?;
            out.flush()?;
            for chunk in &execution.stderr {
                write!(err, "{}", chunk)?;
            }
        }
        if let Some(error) = &execution.error {
            if self.streamed {
                writeln!(err, "\n--- error ---")?;
            }
            write_error(&mut err, error)?;
        }
        if self.show_time {
            writeln!(err, "{}", timing_line(result))?;
        }
        Ok(())
    }

    fn print_batch(&self, results: &[TaskResult], summary: &Summary) -> io::Result<()> {
        if self.streamed {
            return write_summary(&mut io::stderr().lock(), summary, self.show_time);
        }
        if self.format.is_json() {
            return Self::print_json(&batch_json(results, summary, self.show_time));
        }

        let mut out = io::stdout().lock();
        if !self.progressive {
            for result in results {
                write_task(&mut out, result, self.show_time)?;
            }
        }
        write_summary(&mut out, summary, self.show_time)
    }
}

/// Live terminal feedback while a batch runs
pub struct TerminalObserver {
    show_time: bool,
    prefix_streams: bool,
}

impl TerminalObserver {
    pub fn new(show_time: bool, prefix_streams: bool) -> Self {
        Self {
            show_time,
            prefix_streams,
        }
    }
}

impl RunObserver for TerminalObserver {
    fn on_output(&self, task: &TaskLabel, chunk: &OutputChunk) {
        let text = if self.prefix_streams {
            prefix_lines(task, &chunk.text)
        } else {
            chunk.text.clone()
        };
        let _ = match chunk.stream {
            StreamKind::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(text.as_bytes()).and_then(|_| out.flush())
            }
            StreamKind::Stderr => io::stderr().lock().write_all(text.as_bytes()),
        };
    }

    fn on_task_finished(&self, result: &TaskResult) {
        let mut out = io::stdout().lock();
        let _ = write_task(&mut out, result, self.show_time).and_then(|_| out.flush());
    }

    fn on_sandboxes_kept(&self, sandbox_ids: &[String]) {
        match sandbox_ids {
            [id] => eprintln!("Created instance: {} (kept alive)", id),
            ids => eprintln!(
                "Created {} instances (kept alive): {}",
                ids.len(),
                ids.join(", ")
            ),
        }
    }
}

/// Instance listing as an aligned table
pub fn write_instances(out: &mut impl Write, instances: &[SandboxInfo]) -> io::Result<()> {
    if instances.is_empty() {
        return writeln!(out, "No instances found");
    }
    let id_width = instances.iter().map(|i| i.id.len()).max().unwrap_or(2).max(2);
    let tool_width = instances
        .iter()
        .map(|i| i.tool.as_deref().unwrap_or("-").len())
        .max()
        .unwrap_or(4)
        .max(4);

    writeln!(
        out,
        "{:<id_width$}  {:<tool_width$}  {:<8}  STARTED",
        "ID", "TOOL", "STATE"
    )?;
    for instance in instances {
        writeln!(
            out,
            "{:<id_width$}  {:<tool_width$}  {:<8}  {}",
            instance.id,
            instance.tool.as_deref().unwrap_or("-"),
            instance.state.as_deref().unwrap_or("-"),
            instance.started_at.as_deref().unwrap_or("-"),
        )?;
    }
    Ok(())
}

fn write_pairs(out: &mut impl Write, pairs: &[(&str, String)]) -> io::Result<()> {
    let width = pairs.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in pairs {
        writeln!(out, "{:<width$}  {}", format!("{}:", key), value, width = width + 1)?;
    }
    Ok(())
}

pub fn write_instance_detail(out: &mut impl Write, info: &SandboxInfo) -> io::Result<()> {
    let mut pairs = vec![
        ("ID", info.id.clone()),
        ("Tool", info.tool.clone().unwrap_or_else(|| "-".to_string())),
        ("State", info.state.clone().unwrap_or_else(|| "-".to_string())),
        ("Started", info.started_at.clone().unwrap_or_else(|| "-".to_string())),
    ];
    if let Some(expires_at) = &info.expires_at {
        pairs.push(("Expires", expires_at.clone()));
    }
    write_pairs(out, &pairs)
}

/// Directory listing as an aligned table
pub fn write_file_entries(out: &mut impl Write, entries: &[FileEntry]) -> io::Result<()> {
    if entries.is_empty() {
        return writeln!(out, "Directory is empty");
    }
    let rows: Vec<[String; 5]> = entries
        .iter()
        .map(|e| {
            [
                e.file_type.as_str().to_string(),
                format_size(e.size),
                e.permissions.clone(),
                format_modified(e.modified.as_deref()),
                e.name.clone(),
            ]
        })
        .collect();
    let headers = ["TYPE", "SIZE", "PERMISSIONS", "MODIFIED", "NAME"];
    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    writeln!(
        out,
        "{:<w0$}  {:<w1$}  {:<w2$}  {:<w3$}  {}",
        headers[0],
        headers[1],
        headers[2],
        headers[3],
        headers[4],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3]
    )?;
    for row in &rows {
        writeln!(
            out,
            "{:<w0$}  {:<w1$}  {:<w2$}  {:<w3$}  {}",
            row[0],
            row[1],
            row[2],
            row[3],
            row[4],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3]
        )?;
    }
    Ok(())
}

pub fn write_file_stat(out: &mut impl Write, entry: &FileEntry) -> io::Result<()> {
    let mut pairs = vec![
        ("Name", entry.name.clone()),
        ("Path", entry.path.clone()),
        ("Type", entry.file_type.as_str().to_string()),
        ("Size", format!("{} ({} bytes)", format_size(entry.size), entry.size)),
        ("Permissions", entry.permissions.clone()),
    ];
    if let Some(owner) = &entry.owner {
        pairs.push(("Owner", owner.clone()));
    }
    if let Some(group) = &entry.group {
        pairs.push(("Group", group.clone()));
    }
    pairs.push(("Modified", format_modified(entry.modified.as_deref())));
    if let Some(target) = &entry.symlink_target {
        pairs.push(("Symlink", target.clone()));
    }
    write_pairs(out, &pairs)
}

pub fn write_processes(out: &mut impl Write, processes: &[ProcessInfo]) -> io::Result<()> {
    if processes.is_empty() {
        return writeln!(out, "No running processes");
    }
    let cmd_width = processes
        .iter()
        .map(|p| p.cmd.chars().count())
        .max()
        .unwrap_or(3)
        .max(3);
    writeln!(out, "{:<7}  {:<cmd_width$}  {:<40}  CWD", "PID", "CMD", "ARGS")?;
    for process in processes {
        let args = if process.args.is_empty() {
            "-".to_string()
        } else {
            truncate(&process.args.join(" "), 40)
        };
        writeln!(
            out,
            "{:<7}  {:<cmd_width$}  {:<40}  {}",
            process.pid,
            process.cmd,
            args,
            truncate(process.cwd.as_deref().unwrap_or("-"), 30),
        )?;
    }
    Ok(())
}

/// A completed file transfer or change, for `ags file` output
#[derive(Debug, Serialize)]
pub struct FileOperation<'a> {
    pub operation: &'a str,
    pub path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl FileOperation<'_> {
    pub fn describe(&self) -> String {
        let size = self
            .size
            .map(|size| format!(" ({})", format_size(size)))
            .unwrap_or_default();
        match (self.operation, self.local_path) {
            ("upload", Some(local)) => format!("Uploaded {} -> {}{}", local, self.path, size),
            ("download", Some(local)) => format!("Downloaded {} -> {}{}", self.path, local, size),
            ("remove", _) => format!("Removed {}", self.path),
            ("mkdir", _) => format!("Created directory {}", self.path),
            (operation, _) => format!("{} {}", operation, self.path),
        }
    }
}

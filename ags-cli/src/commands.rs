//! CLI command implementations
//!
//! Each command returns the process exit code; errors bubble up to `main`.

use crate::output::{self, FileOperation, Printer, TerminalObserver};
use crate::{ExecArgs, FileArgs, FileCommands, RunArgs, SandboxArgs};
use ags_common::AppConfig;
use ags_sandbox::{
    backend, build_tasks, Dispatcher, ExecutionTask, Language, RunConfig, SandboxBackend,
    SandboxRef, SandboxSelector, SandboxSession, StdInputSource, TaskInput, TaskSource,
    TrackedBackend,
};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code after a forced second Ctrl-C
const INTERRUPTED_EXIT_CODE: i32 = 130;
/// How long a forced exit waits for sandbox cleanup
const FORCED_CLEANUP_LIMIT: Duration = Duration::from_secs(5);

fn connect_backend(config: &AppConfig) -> Result<Arc<dyn SandboxBackend>> {
    config.validate()?;
    let backend = backend::from_config(config).context("Failed to initialise backend")?;
    debug!(backend = backend.name(), "Backend ready");
    Ok(backend)
}

fn selector(
    config: &AppConfig,
    instance: Option<String>,
    tool: Option<String>,
) -> Result<SandboxSelector> {
    match (instance, tool) {
        (Some(_), Some(_)) => bail!("cannot use --tool with --instance"),
        (Some(instance_id), None) => Ok(SandboxSelector::Existing { instance_id }),
        (None, tool) => Ok(SandboxSelector::Create {
            tool: tool.unwrap_or_else(|| config.sandbox.default_tool.clone()),
        }),
    }
}

/// Per-execution timeout: the flag, else the configured sandbox lifetime
fn execution_timeout(config: &AppConfig, seconds: Option<u64>) -> Duration {
    seconds
        .map(Duration::from_secs)
        .unwrap_or(config.sandbox.timeout)
}

/// Destroy the sandboxes this run created, bounded in time
async fn forced_cleanup(backend: &TrackedBackend, limit: Duration) -> usize {
    match tokio::time::timeout(limit, backend.destroy_all()).await {
        Ok(destroyed) => destroyed,
        Err(_) => {
            warn!(left = ?backend.live(), "Cleanup timed out");
            0
        }
    }
}

/// First Ctrl-C cancels the batch and lets in-flight work finish. A second
/// one destroys the sandboxes created so far (unless kept alive) and exits.
fn cancel_on_interrupt(backend: Arc<TrackedBackend>, keep_alive: bool) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, no new tasks will start");
        eprintln!("Interrupted, waiting for running tasks to finish (Ctrl-C again to abort)...");
        trigger.cancel();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted again, aborting");
        if keep_alive {
            eprintln!("Aborted, instances left running: {}", backend.live().join(", "));
        } else {
            let destroyed = forced_cleanup(&backend, FORCED_CLEANUP_LIMIT).await;
            eprintln!("Aborted, cleaned up {} instance(s)", destroyed);
        }
        std::process::exit(INTERRUPTED_EXIT_CODE);
    });
    token
}

async fn dispatch_and_print(
    config: &AppConfig,
    run_config: RunConfig,
    tasks: Vec<ExecutionTask>,
    show_time: bool,
) -> Result<i32> {
    let backend = Arc::new(TrackedBackend::new(connect_backend(config)?));
    let keep_alive = run_config.keep_alive;
    let dispatcher = Dispatcher::new(backend.clone(), run_config)?;
    let single = dispatcher.is_single(tasks.len());

    let printer = Printer {
        format: config.output,
        show_time,
        streamed: dispatcher.config().stream,
        progressive: dispatcher.config().report_progress,
    };
    let observer = Arc::new(TerminalObserver::new(show_time, !single));

    let cancel = cancel_on_interrupt(backend, keep_alive);
    let outcome = dispatcher.dispatch(tasks, &cancel, observer).await?;
    let code = printer
        .print_outcome(&outcome)
        .context("Failed to write output")?;
    Ok(code)
}

pub async fn execute_run(config: &AppConfig, args: RunArgs) -> Result<i32> {
    let language: Language = match &args.language {
        Some(lang) => lang.parse().map_err(|e: String| anyhow!(e))?,
        None => config
            .sandbox
            .language
            .parse()
            .map_err(|e: String| anyhow!("invalid sandbox.language in config: {}", e))?,
    };

    let run_config = RunConfig {
        selector: selector(config, args.instance, args.tool)?,
        language,
        timeout: Some(execution_timeout(config, args.timeout)),
        env: args.env,
        repeat: args.repeat.max(1),
        stream: args.stream,
        parallel: args.parallel,
        max_parallel: args.max_parallel,
        keep_alive: args.keep_alive,
        report_progress: args.parallel && !args.stream && !config.output.is_json(),
    };
    // usage errors before reading stdin or opening an editor
    run_config.validate()?;

    let input = TaskInput {
        code: args.code,
        files: args.files,
        repeat: run_config.repeat,
        language,
    };
    let tasks = tokio::task::spawn_blocking(move || build_tasks(&input, &mut StdInputSource))
        .await
        .context("Task builder failed")??;
    info!(tasks = tasks.len(), parallel = run_config.parallel, "Dispatching");

    dispatch_and_print(config, run_config, tasks, args.time).await
}

/// Quote for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// The shell line for `exec`, run from `cwd` when given
fn exec_command_line(command: &[String], cwd: Option<&str>) -> Result<String> {
    let command = command.join(" ");
    if command.trim().is_empty() {
        bail!("no command provided");
    }
    Ok(match cwd {
        Some(dir) => format!("cd {} && {}", shell_quote(dir), command),
        None => command,
    })
}

pub async fn execute_exec(config: &AppConfig, args: ExecArgs) -> Result<i32> {
    let command = exec_command_line(&args.command, args.cwd.as_deref())?;

    let run_config = RunConfig {
        selector: selector(config, args.instance, args.tool)?,
        language: Language::Bash,
        timeout: Some(execution_timeout(config, args.timeout)),
        env: args.env,
        repeat: 1,
        stream: args.stream,
        parallel: false,
        max_parallel: 0,
        keep_alive: args.keep_alive,
        report_progress: false,
    };
    let task = ExecutionTask {
        id: 1,
        code: command,
        source: TaskSource::Code,
        instance_number: 1,
        total_instances: 1,
    };

    dispatch_and_print(config, run_config, vec![task], args.time).await
}

/// Open the sandbox for a single-sandbox command
async fn open_session(config: &AppConfig, args: &SandboxArgs) -> Result<SandboxSession> {
    let backend = connect_backend(config)?;
    let selector = selector(config, args.instance.clone(), args.tool.clone())?;
    SandboxSession::open(backend, &selector, args.keep_alive)
        .await
        .context("Failed to obtain a sandbox")
}

/// Release the session and report timing on stderr
async fn close_session(
    session: SandboxSession,
    started: Instant,
    operation_started: Instant,
    show_time: bool,
) {
    let creation = session.creation_duration();
    let operation = operation_started.elapsed();
    if let Some(id) = session.close().await {
        eprintln!("Created instance: {} (kept alive)", id);
    }
    if show_time {
        eprintln!("{}", output::phase_timing(started.elapsed(), creation, operation));
    }
}

pub async fn execute_exec_ps(config: &AppConfig, args: SandboxArgs) -> Result<i32> {
    let started = Instant::now();
    let session = open_session(config, &args).await?;

    let operation_started = Instant::now();
    let listed = session
        .backend()
        .list_processes(session.sandbox())
        .await
        .context("Failed to list processes");
    close_session(session, started, operation_started, args.time).await;
    let processes = listed?;

    if config.output.is_json() {
        Printer::print_json(&serde_json::to_value(&processes)?)?;
    } else {
        output::write_processes(&mut std::io::stdout().lock(), &processes)?;
    }
    Ok(0)
}

/// Local destination for a download: the given path or the remote base name
fn download_target(remote: &str, local: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(local) = local {
        return Ok(local);
    }
    Path::new(remote)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("cannot derive a local file name from {}", remote))
}

fn print_file_operation(config: &AppConfig, operation: &FileOperation<'_>) -> Result<()> {
    if config.output.is_json() {
        Printer::print_json(&serde_json::to_value(operation)?)?;
    } else {
        println!("{}", operation.describe());
    }
    Ok(())
}

async fn run_file_command(
    config: &AppConfig,
    session: &SandboxSession,
    command: FileCommands,
) -> Result<i32> {
    let backend = session.backend();
    let sandbox = session.sandbox();

    match command {
        FileCommands::List { path, depth } => {
            let entries = backend
                .list_files(sandbox, &path, depth)
                .await
                .context("Failed to list directory")?;
            if config.output.is_json() {
                Printer::print_json(&serde_json::to_value(&entries)?)?;
            } else {
                output::write_file_entries(&mut std::io::stdout().lock(), &entries)?;
            }
        }
        FileCommands::Upload { local, remote } => {
            let data = tokio::fs::read(&local)
                .await
                .with_context(|| format!("Failed to read local file {}", local.display()))?;
            backend
                .write_file(sandbox, &remote, &data)
                .await
                .context("Failed to upload file")?;
            let local = local.display().to_string();
            print_file_operation(
                config,
                &FileOperation {
                    operation: "upload",
                    path: &remote,
                    local_path: Some(&local),
                    size: Some(data.len() as u64),
                },
            )?;
        }
        FileCommands::Download { remote, local } => {
            let target = download_target(&remote, local)?;
            let data = backend
                .read_file(sandbox, &remote)
                .await
                .context("Failed to read remote file")?;
            tokio::fs::write(&target, &data)
                .await
                .with_context(|| format!("Failed to write local file {}", target.display()))?;
            let local = target.display().to_string();
            print_file_operation(
                config,
                &FileOperation {
                    operation: "download",
                    path: &remote,
                    local_path: Some(&local),
                    size: Some(data.len() as u64),
                },
            )?;
        }
        FileCommands::Remove { paths } => {
            let mut failed = 0;
            for path in &paths {
                match backend.remove_file(sandbox, path).await {
                    Ok(()) => print_file_operation(
                        config,
                        &FileOperation {
                            operation: "remove",
                            path,
                            local_path: None,
                            size: None,
                        },
                    )?,
                    Err(e) => {
                        eprintln!("Failed to remove {}: {}", path, e);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("failed to remove {} file(s)", failed);
            }
        }
        FileCommands::Mkdir { path } => {
            backend
                .make_dir(sandbox, &path)
                .await
                .context("Failed to create directory")?;
            print_file_operation(
                config,
                &FileOperation {
                    operation: "mkdir",
                    path: &path,
                    local_path: None,
                    size: None,
                },
            )?;
        }
        FileCommands::Stat { path } => {
            let entry = backend
                .stat_file(sandbox, &path)
                .await
                .context("Failed to stat file")?;
            if config.output.is_json() {
                Printer::print_json(&serde_json::to_value(&entry)?)?;
            } else {
                output::write_file_stat(&mut std::io::stdout().lock(), &entry)?;
            }
        }
        FileCommands::Cat { path } => {
            let data = backend
                .read_file(sandbox, &path)
                .await
                .context("Failed to read file")?;
            if config.output.is_json() {
                let content = String::from_utf8_lossy(&data);
                Printer::print_json(&json!({ "path": path, "content": content }))?;
            } else {
                use std::io::Write;
                let mut out = std::io::stdout().lock();
                out.write_all(&data)?;
                out.flush()?;
            }
        }
    }
    Ok(0)
}

pub async fn execute_file(config: &AppConfig, args: FileArgs) -> Result<i32> {
    let started = Instant::now();
    let session = open_session(config, &args.sandbox).await?;

    let operation_started = Instant::now();
    let result = run_file_command(config, &session, args.command).await;
    close_session(session, started, operation_started, args.sandbox.time).await;
    result
}

pub async fn execute_instance_create(config: &AppConfig, tool: Option<String>) -> Result<i32> {
    let backend = connect_backend(config)?;
    let tool = tool.unwrap_or_else(|| config.sandbox.default_tool.clone());
    let sandbox = backend
        .create(&tool)
        .await
        .context("Failed to create instance")?;

    if config.output.is_json() {
        Printer::print_json(&json!({ "instance_id": sandbox.id, "tool": tool }))?;
    } else {
        println!("Created instance: {}", sandbox.id);
    }
    Ok(0)
}

pub async fn execute_instance_list(config: &AppConfig) -> Result<i32> {
    let backend = connect_backend(config)?;
    let instances = backend.list().await.context("Failed to list instances")?;

    if config.output.is_json() {
        Printer::print_json(&serde_json::to_value(&instances)?)?;
    } else {
        output::write_instances(&mut std::io::stdout().lock(), &instances)?;
    }
    Ok(0)
}

pub async fn execute_instance_get(config: &AppConfig, id: &str) -> Result<i32> {
    let backend = connect_backend(config)?;
    let info = backend
        .get(id)
        .await
        .with_context(|| format!("Failed to get instance {}", id))?;

    if config.output.is_json() {
        Printer::print_json(&serde_json::to_value(&info)?)?;
    } else {
        output::write_instance_detail(&mut std::io::stdout().lock(), &info)?;
    }
    Ok(0)
}

pub async fn execute_instance_delete(config: &AppConfig, ids: Vec<String>) -> Result<i32> {
    let backend = connect_backend(config)?;

    let mut deleted = Vec::new();
    let mut failed = Vec::new();
    for id in ids {
        match backend.destroy(&SandboxRef::new(id.clone())).await {
            Ok(()) => {
                if !config.output.is_json() {
                    println!("Deleted instance: {}", id);
                }
                deleted.push(id);
            }
            Err(e) => {
                eprintln!("Failed to delete {}: {}", id, e);
                failed.push(id);
            }
        }
    }

    if config.output.is_json() {
        Printer::print_json(&json!({ "deleted": deleted, "failed": failed }))?;
    }
    Ok(if failed.is_empty() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_rules() {
        let config = AppConfig::default();
        assert!(selector(&config, Some("sbx".into()), Some("tool".into())).is_err());
        assert_eq!(
            selector(&config, None, None).unwrap(),
            SandboxSelector::Create {
                tool: "code-interpreter-v1".to_string()
            }
        );
        assert_eq!(
            selector(&config, Some("sbx".into()), None).unwrap(),
            SandboxSelector::Existing {
                instance_id: "sbx".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_exec_on_local_backend() {
        let mut config = AppConfig::default();
        config.backend = ags_common::BackendKind::Local;
        config.output = ags_common::OutputFormat::Json;

        let code = execute_exec(&config, exec_args(&["exit", "5"])).await.unwrap();
        assert_eq!(code, 5);
    }

    fn exec_args(command: &[&str]) -> ExecArgs {
        ExecArgs {
            action: None,
            command: command.iter().map(|s| s.to_string()).collect(),
            instance: None,
            tool: None,
            keep_alive: false,
            stream: false,
            time: false,
            cwd: None,
            timeout: None,
            env: Vec::new(),
        }
    }

    fn local_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.backend = ags_common::BackendKind::Local;
        config.output = ags_common::OutputFormat::Json;
        config
    }

    #[test]
    fn test_execution_timeout_falls_back_to_config() {
        let mut config = AppConfig::default();
        config.sandbox.timeout = Duration::from_secs(90);
        assert_eq!(execution_timeout(&config, None), Duration::from_secs(90));
        assert_eq!(execution_timeout(&config, Some(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_exec_command_line() {
        let command = vec!["ls".to_string(), "-la".to_string()];
        assert_eq!(exec_command_line(&command, None).unwrap(), "ls -la");
        assert_eq!(
            exec_command_line(&command, Some("/tmp/it's here")).unwrap(),
            "cd '/tmp/it'\\''s here' && ls -la"
        );
        assert!(exec_command_line(&[" ".to_string()], None).is_err());
    }

    #[tokio::test]
    async fn test_exec_timeout_and_env_reach_the_process() {
        let config = local_config();

        let mut args = exec_args(&["test", "\"$MODE\"", "=", "fast"]);
        args.env = vec![("MODE".to_string(), "fast".to_string())];
        assert_eq!(execute_exec(&config, args).await.unwrap(), 0);

        // a timed-out command is a failure
        let mut args = exec_args(&["sleep", "5"]);
        args.timeout = Some(1);
        assert_eq!(execute_exec(&config, args).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exec_reports_signal_death() {
        let code = execute_exec(&local_config(), exec_args(&["kill", "-9", "$$"]))
            .await
            .unwrap();
        assert_eq!(code, 137);
    }

    #[test]
    fn test_download_target_defaults_to_base_name() {
        assert_eq!(
            download_target("/home/user/out.csv", None).unwrap(),
            PathBuf::from("out.csv")
        );
        assert_eq!(
            download_target("/x", Some(PathBuf::from("y"))).unwrap(),
            PathBuf::from("y")
        );
        assert!(download_target("/", None).is_err());
    }

    #[tokio::test]
    async fn test_file_commands_on_local_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let backend: Arc<dyn SandboxBackend> =
            Arc::new(ags_sandbox::LocalBackend::with_root(root.path()));
        let sandbox = backend.create("bash").await.unwrap();
        let selector = SandboxSelector::Existing {
            instance_id: sandbox.id.clone(),
        };
        let session = SandboxSession::open(backend.clone(), &selector, false)
            .await
            .unwrap();
        let config = local_config();

        let upload = root.path().join("upload.txt");
        std::fs::write(&upload, "payload").unwrap();
        let code = run_file_command(
            &config,
            &session,
            FileCommands::Upload {
                local: upload,
                remote: "/work/upload.txt".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            backend
                .read_file(&sandbox, "/work/upload.txt")
                .await
                .unwrap(),
            b"payload".to_vec()
        );

        let download = root.path().join("download.txt");
        run_file_command(
            &config,
            &session,
            FileCommands::Download {
                remote: "/work/upload.txt".to_string(),
                local: Some(download.clone()),
            },
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read_to_string(&download).unwrap(), "payload");

        // one failing path fails the whole removal
        let err = run_file_command(
            &config,
            &session,
            FileCommands::Remove {
                paths: vec!["/work/upload.txt".to_string(), "/missing".to_string()],
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to remove 1 file(s)"));
        assert!(backend
            .stat_file(&sandbox, "/work/upload.txt")
            .await
            .is_err());

        // an attached instance survives the command
        assert_eq!(session.close().await, None);
        assert!(backend.connect(&sandbox.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_forced_cleanup_destroys_created_sandboxes() {
        let root = tempfile::tempdir().unwrap();
        let tracked =
            TrackedBackend::new(Arc::new(ags_sandbox::LocalBackend::with_root(root.path())));
        let first = tracked.create("bash").await.unwrap();
        tracked.create("bash").await.unwrap();
        tracked.destroy(&first).await.unwrap();

        assert_eq!(forced_cleanup(&tracked, Duration::from_secs(5)).await, 1);
        assert!(tracked.live().is_empty());
        assert!(tracked.list().await.unwrap().is_empty());
    }
}

//! The `task` bolt-family module: resolves a `<module>[::<task>]` name to an
//! executable file under the tasks directory and runs it with its `input`
//! parameter object on stdin.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tokio::process::Command;

use super::bolt::{self, CommandObject};
use super::{ActionSchema, Module, ModuleError};
use crate::request::{ActionRequest, RequestType};
use crate::response::ModuleType;
use crate::wrapper::{TaskErrorKind, TaskErrorOutput, TaskInvocation, TaskOutputFiles, TaskSuccessOutput, TaskWrapperRequest};

const RESERVED_EXTENSIONS: [&str; 2] = ["json", "md"];

fn task_name_regex() -> Regex {
    #[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
    Regex::new(r"\A(\w+)(?:::(\w+))?\z").unwrap()
}

/// Split a task name of the form `<module>` or `<module>::<task>` into its
/// module and task components, defaulting the task to `init`.
#[must_use]
pub fn parse_task_name(name: &str) -> Option<(String, String)> {
    let captures = task_name_regex().captures(name)?;
    let module = captures.get(1)?.as_str().to_owned();
    let task = captures.get(2).map_or_else(|| "init".to_owned(), |m| m.as_str().to_owned());
    Some((module, task))
}

/// The resolved executable and any interpreter arguments needed to invoke it.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    /// The interpreter or task file itself, as an executable path.
    pub executable: PathBuf,
    /// Arguments preceding the caller's own arguments (e.g. `apply <file>`).
    pub arguments: Vec<String>,
}

/// Locate the task file for `module`/`task` under `tasks_dir`, picking an
/// interpreter for known extensions on Windows, or relying on the
/// executable bit (and a shebang line) on POSIX.
///
/// # Errors
/// Returns `Err` if no eligible file is found.
pub async fn find_task_executable(tasks_dir: &Path, module: &str, task: &str) -> Result<ResolvedTask, ()> {
    let dir = tasks_dir.join(module).join("tasks");
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(_) => return Err(()),
    };

    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        if stem != task {
            continue;
        }
        let extension = path.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
        if extension.as_deref().is_some_and(|e| RESERVED_EXTENSIONS.contains(&e)) {
            continue;
        }
        candidates.push((path, extension));
    }
    candidates.sort();

    for (path, extension) in candidates {
        if let Some(resolved) = resolve_candidate(&path, extension.as_deref()).await {
            return Ok(resolved);
        }
    }
    Err(())
}

#[cfg(windows)]
async fn resolve_candidate(path: &Path, extension: Option<&str>) -> Option<ResolvedTask> {
    Some(windows_interpreter_for(path, extension).unwrap_or_else(|| ResolvedTask { executable: path.to_path_buf(), arguments: vec![] }))
}

#[cfg(not(windows))]
async fn resolve_candidate(path: &Path, _extension: Option<&str>) -> Option<ResolvedTask> {
    if is_executable(path).await {
        Some(ResolvedTask { executable: path.to_path_buf(), arguments: vec![] })
    } else {
        None
    }
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable(_path: &Path) -> bool { true }

/// Resolve how to invoke a known, already-located file: apply the Windows
/// interpreter table for its extension, or, on POSIX, run it directly
/// (executability is the caller's responsibility to have arranged). Used by
/// the `script` and `apply` bolt modules, which — unlike task dispatch —
/// don't need a "not found" outcome: the file is already known to exist.
#[must_use]
pub fn find_executable_and_arguments(path: &Path) -> ResolvedTask {
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
    windows_interpreter_for(path, extension.as_deref())
        .unwrap_or_else(|| ResolvedTask { executable: path.to_path_buf(), arguments: vec![] })
}

#[cfg(windows)]
fn windows_interpreter_for(path: &Path, extension: Option<&str>) -> Option<ResolvedTask> {
    let path_str = path.display().to_string();
    match extension {
        Some("rb") => Some(ResolvedTask { executable: "ruby".into(), arguments: vec![path_str] }),
        Some("pp") => Some(ResolvedTask { executable: "puppet".into(), arguments: vec!["apply".into(), path_str] }),
        Some("ps1") => Some(ResolvedTask {
            executable: "powershell".into(),
            arguments: vec![
                "-NoProfile".into(),
                "-NonInteractive".into(),
                "-NoLogo".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-File".into(),
                path_str,
            ],
        }),
        _ => None,
    }
}

#[cfg(not(windows))]
fn windows_interpreter_for(_path: &Path, _extension: Option<&str>) -> Option<ResolvedTask> { None }

/// Run the already-resolved task inline, validating UTF-8 output, and build
/// the `{"output": ...}` / `{"_error": {...}}` success/failure shape along
/// with the child's captured stderr.
///
/// # Errors
/// Returns `Err` only if the child cannot be spawned at all; a UTF-8 or
/// exec-failure condition is folded into the returned JSON's `_error` field.
pub async fn run_resolved_task(taskname: &str, resolved: &ResolvedTask, input: &Value) -> Result<(Value, String, i32), ModuleError> {
    let cmd = CommandObject {
        executable: resolved.executable.clone(),
        arguments: resolved.arguments.clone(),
        environment: HashMap::new(),
        input: input.to_string(),
    };
    match bolt::run_sync(&cmd).await {
        Ok(result) => {
            let output = serde_json::to_value(TaskSuccessOutput { output: result.stdout }).unwrap_or(Value::Null);
            Ok((output, result.stderr, result.exitcode))
        }
        Err(ModuleError::OutputEncoding(_)) => Ok((
            error_output(TaskErrorKind::OutputEncodingError, "Output cannot be represented as a JSON string"),
            String::new(),
            1,
        )),
        Err(error) => {
            Ok((error_output(TaskErrorKind::ExecFailed, format!("Task '{taskname}' failed to run: {error}")), String::new(), 127))
        }
    }
}

fn error_output(kind: TaskErrorKind, msg: impl Into<String>) -> Value {
    serde_json::to_value(TaskErrorOutput::new(kind, msg)).unwrap_or(Value::Null)
}

/// Runs arbitrary task executables resolved under the tasks directory.
pub struct TaskModule {
    tasks_dir: PathBuf,
    actions: Vec<ActionSchema>,
}

impl TaskModule {
    /// Build the `task` module rooted at `tasks_dir`.
    #[must_use]
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
            actions: vec![ActionSchema {
                name: "run".to_owned(),
                description: "Run a task".to_owned(),
                input: json!({
                    "type": "object",
                    "properties": { "task": { "type": "string" }, "input": { "type": "object" } },
                    "required": ["task", "input"],
                }),
                results: json!({ "type": "object" }),
            }],
        }
    }

    async fn dispatch_blocking(&self, taskname: &str, module: &str, task: &str, input: &Value) -> Result<Value, ModuleError> {
        let Ok(resolved) = find_task_executable(&self.tasks_dir, module, task).await else {
            return Ok(error_output(TaskErrorKind::NotFound, format!("Task file for '{taskname}' is not present or not executable")));
        };
        let (output, _stderr, _exitcode) = run_resolved_task(taskname, &resolved, input).await?;
        Ok(output)
    }

    async fn dispatch_non_blocking(
        &self,
        taskname: &str,
        module: &str,
        task: &str,
        input: &Value,
        results_dir: &Path,
    ) -> Result<Value, ModuleError> {
        let wrapper_request = TaskWrapperRequest {
            input: TaskInvocation { task: taskname.to_owned(), input: input.clone() },
            output_files: TaskOutputFiles {
                stdout: results_dir.join("stdout"),
                stderr: results_dir.join("stderr"),
                exitcode: results_dir.join("exitcode"),
            },
        };
        let _ = (module, task);
        run_task_wrapper(&wrapper_request, results_dir, &self.tasks_dir).await
    }
}

async fn run_task_wrapper(wrapper_request: &TaskWrapperRequest, results_dir: &Path, tasks_dir: &Path) -> Result<Value, ModuleError> {
    use tokio::io::AsyncWriteExt as _;

    let wrapper_path = task_wrapper_path()?;
    let payload = serde_json::to_vec(wrapper_request).map_err(|e| ModuleError::Processing(e.to_string()))?;

    let mut command = Command::new(&wrapper_path);
    command
        .env("PXA_TASKS_DIR", tasks_dir)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    detach_process_group(&mut command);
    let mut child = command.spawn().map_err(|e| ModuleError::Processing(e.to_string()))?;

    if let Some(pid) = child.id() {
        tokio::fs::write(results_dir.join("pid"), format!("{pid}\n")).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    }
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    }
    child.wait().await.map_err(|e| ModuleError::Processing(e.to_string()))?;

    let stdout = tokio::fs::read_to_string(results_dir.join("stdout")).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    serde_json::from_str(&stdout).map_err(|e| ModuleError::Processing(e.to_string()))
}

#[cfg(unix)]
fn detach_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt as _;
    command.process_group(0);
}

#[cfg(not(unix))]
fn detach_process_group(_command: &mut Command) {}

fn task_wrapper_path() -> Result<PathBuf, ModuleError> {
    let exe = std::env::current_exe().map_err(|e| ModuleError::Processing(e.to_string()))?;
    let dir = exe.parent().ok_or_else(|| ModuleError::Processing("agent executable has no parent directory".to_owned()))?;
    Ok(dir.join("pxa-task-wrapper"))
}

#[async_trait]
impl Module for TaskModule {
    fn name(&self) -> &str { "task" }
    fn actions(&self) -> &[ActionSchema] { &self.actions }
    fn module_type(&self) -> ModuleType { ModuleType::Internal }

    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError> {
        let taskname = request
            .params()
            .get("task")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "run".to_owned(), detail: "missing 'task'".to_owned() })?
            .to_owned();
        let input = request.params().get("input").cloned().unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let Some((module, task)) = parse_task_name(&taskname) else {
            return Ok(error_output(TaskErrorKind::InvalidTask, format!("Invalid task name '{taskname}'")));
        };

        match request.request_type() {
            RequestType::Blocking => self.dispatch_blocking(&taskname, &module, &task, &input).await,
            RequestType::NonBlocking => {
                let results_dir = request
                    .results_dir()
                    .ok_or_else(|| ModuleError::Processing("non-blocking task action dispatched without a results directory".to_owned()))?;
                self.dispatch_non_blocking(&taskname, &module, &task, &input, &results_dir).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::request::RequestType as ReqType;

    #[test]
    fn parses_module_only_name() {
        assert_eq!(parse_task_name("package"), Some(("package".to_owned(), "init".to_owned())));
    }

    #[test]
    fn parses_module_and_task_name() {
        assert_eq!(parse_task_name("package::status"), Some(("package".to_owned(), "status".to_owned())));
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(parse_task_name("../etc/passwd"), None);
        assert_eq!(parse_task_name("a::b::c"), None);
    }

    #[tokio::test]
    async fn finds_reserved_extension_free_candidate() {
        let dir = tempdir().unwrap();
        let tasks_dir = dir.path().join("pkg").join("tasks");
        tokio::fs::create_dir_all(&tasks_dir).await.unwrap();
        tokio::fs::write(tasks_dir.join("init.json"), b"{}").await.unwrap();
        let script = tasks_dir.join("init.sh");
        tokio::fs::write(&script, b"#!/bin/sh\necho hi\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).await.unwrap();
        }

        let resolved = find_task_executable(dir.path(), "pkg", "init").await.unwrap();
        assert_eq!(resolved.executable, script);
    }

    #[tokio::test]
    async fn missing_task_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = find_task_executable(dir.path(), "nope", "init").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn blocking_run_reports_invalid_task_name() {
        let module = TaskModule::new("/nonexistent");
        let data = json!({"transaction_id": "t1", "module": "task", "action": "run", "params": {"task": "bad name", "input": {}}});
        let request = ActionRequest::from_envelope(ReqType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let results = module.call_action(&request).await.unwrap();
        assert!(results.get("_error").is_some());
    }
}

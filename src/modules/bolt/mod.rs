//! Shared base for the bolt-family modules (`command`, `script`,
//! `download_file`, `apply`): the same blocking/non-blocking split and
//! output validation as external modules, with each subclass only
//! responsible for building a [`CommandObject`].

pub mod apply;
pub mod download_file;
pub mod script;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;

use crate::modules::ModuleError;
use crate::request::{ActionRequest, RequestType};
use crate::wrapper::ExecutionWrapperRequest;

/// The executable, arguments, environment, and stdin collected for a single
/// bolt-family invocation.
#[derive(Debug, Clone)]
pub struct CommandObject {
    /// Path to the executable to run.
    pub executable: PathBuf,
    /// Arguments passed to the executable.
    pub arguments: Vec<String>,
    /// Extra environment variables set for the child.
    pub environment: HashMap<String, String>,
    /// Content fed to the child's stdin.
    pub input: String,
}

/// The raw result of running a [`CommandObject`] to completion.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Process exit code.
    pub exitcode: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Run `cmd` inline, capturing its stdout/stderr, for a
/// [`RequestType::Blocking`] request.
///
/// # Errors
/// Returns [`ModuleError::Processing`] if the child cannot be spawned, or
/// [`ModuleError::OutputEncoding`] if its stdout is not valid UTF-8.
pub async fn run_sync(cmd: &CommandObject) -> Result<RunResult, ModuleError> {
    let mut command = Command::new(&cmd.executable);
    command.args(&cmd.arguments).envs(&cmd.environment).stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| spawn_error(&cmd.executable, &e))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(cmd.input.as_bytes()).await;
    }

    let output = child.wait_with_output().await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    let exitcode = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8(output.stdout).map_err(|_| ModuleError::OutputEncoding(cmd.executable.display().to_string()))?;
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Ok(RunResult { exitcode, stdout, stderr })
}

/// Spawn the execution wrapper to run `cmd` on a dedicated process group (so
/// the child survives an agent restart), write the wrapper's pid to
/// `results_dir/pid`, then await the wrapper's own exit and read back the
/// output files it wrote. Used for [`RequestType::NonBlocking`] requests;
/// the caller (the request processor's background worker) is already
/// running off the request-handling thread, so waiting here is fine — it is
/// this wait, not the wire response, that is asynchronous.
///
/// # Errors
/// Returns [`ModuleError::Processing`] if the wrapper binary cannot be
/// located or spawned, or if the output files it wrote cannot be read back.
pub async fn run_detached(cmd: &CommandObject, results_dir: &Path) -> Result<RunResult, ModuleError> {
    let wrapper_path = execution_wrapper_path()?;
    let wrapper_request = ExecutionWrapperRequest {
        executable: cmd.executable.display().to_string(),
        arguments: cmd.arguments.clone(),
        input: cmd.input.clone(),
        stdout: results_dir.join("stdout"),
        stderr: results_dir.join("stderr"),
        exitcode: results_dir.join("exitcode"),
    };
    let payload = serde_json::to_vec(&wrapper_request).map_err(|e| ModuleError::Processing(e.to_string()))?;

    let mut command = Command::new(&wrapper_path);
    command.envs(&cmd.environment).stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::null());
    detach_process_group(&mut command);
    let mut child = command.spawn().map_err(|e| spawn_error(&wrapper_path, &e))?;

    if let Some(pid) = child.id() {
        tokio::fs::write(results_dir.join("pid"), format!("{pid}\n")).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    }
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    }

    let status = child.wait().await.map_err(|e| ModuleError::Processing(e.to_string()))?;
    let exitcode = status.code().unwrap_or(-1);
    read_wrapper_output(results_dir, exitcode).await
}

#[cfg(unix)]
fn detach_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt as _;
    command.process_group(0);
}

#[cfg(not(unix))]
fn detach_process_group(_command: &mut Command) {}

async fn read_wrapper_output(results_dir: &Path, exitcode: i32) -> Result<RunResult, ModuleError> {
    let stdout = read_optional(&results_dir.join("stdout"), true).await?;
    let stderr = read_optional(&results_dir.join("stderr"), false).await?;
    Ok(RunResult { exitcode, stdout, stderr })
}

async fn read_optional(path: &Path, is_stdout: bool) -> Result<String, ModuleError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8(bytes).map_err(|_| {
            if is_stdout {
                ModuleError::OutputEncoding(path.display().to_string())
            } else {
                ModuleError::Processing(crate::locale::format_msg("'{1}' is not valid UTF-8", &[&path.display().to_string()]))
            }
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(ModuleError::Processing(e.to_string())),
    }
}

fn spawn_error(executable: &Path, source: &std::io::Error) -> ModuleError {
    ModuleError::Processing(crate::locale::format_msg(
        "Executable '{1}' failed to run: {2}",
        &[&executable.display().to_string(), &source.to_string()],
    ))
}

fn execution_wrapper_path() -> Result<PathBuf, ModuleError> {
    let exe = std::env::current_exe().map_err(|e| ModuleError::Processing(e.to_string()))?;
    let dir = exe.parent().ok_or_else(|| ModuleError::Processing("agent executable has no parent directory".to_owned()))?;
    Ok(dir.join("pxa-execution-wrapper"))
}

/// Turn a finished [`RunResult`] into the `{exitcode, stdout?, stderr?}`
/// results shape, omitting `stdout`/`stderr` when empty, matching
/// `BoltModule::processOutputAndUpdateMetadata` in the original agent.
#[must_use]
pub fn results_from_run(result: &RunResult) -> Value {
    let mut map = Map::new();
    map.insert("exitcode".into(), Value::from(result.exitcode));
    if !result.stdout.is_empty() {
        map.insert("stdout".into(), Value::String(result.stdout.clone()));
    }
    if !result.stderr.is_empty() {
        map.insert("stderr".into(), Value::String(result.stderr.clone()));
    }
    Value::Object(map)
}

/// Dispatch `cmd` according to `request`'s blocking/non-blocking kind,
/// returning the finished `{exitcode, stdout?, stderr?}` results either way.
/// For non-blocking requests this awaits the spawned wrapper, which is the
/// request processor's background worker's job, not the wire response's.
///
/// # Errors
/// Returns [`ModuleError`] if the command or wrapper cannot be run.
pub async fn dispatch(request: &ActionRequest, cmd: &CommandObject) -> Result<Value, ModuleError> {
    let result = match request.request_type() {
        RequestType::Blocking => run_sync(cmd).await?,
        RequestType::NonBlocking => {
            let results_dir = request.results_dir().ok_or_else(|| {
                ModuleError::Processing("non-blocking bolt action dispatched without a results directory".to_owned())
            })?;
            run_detached(cmd, &results_dir).await?
        }
    };
    Ok(results_from_run(&result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_sync_captures_stdout() {
        let cmd = CommandObject {
            executable: "/bin/echo".into(),
            arguments: vec!["hello".into()],
            environment: HashMap::new(),
            input: String::new(),
        };
        let result = run_sync(&cmd).await.unwrap();
        assert_eq!(result.exitcode, 0);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_sync_reports_spawn_failure() {
        let cmd = CommandObject {
            executable: "/no/such/executable-xyz".into(),
            arguments: vec![],
            environment: HashMap::new(),
            input: String::new(),
        };
        let error = run_sync(&cmd).await.unwrap_err();
        assert!(matches!(error, ModuleError::Processing(_)));
    }

    #[test]
    fn results_from_run_omits_empty_streams() {
        let result = RunResult { exitcode: 0, stdout: String::new(), stderr: String::new() };
        let value = results_from_run(&result);
        assert!(value.get("stdout").is_none());
        assert!(value.get("stderr").is_none());
        assert_eq!(value.get("exitcode"), Some(&Value::from(0)));
    }

    #[test]
    fn results_from_run_includes_nonempty_streams() {
        let result = RunResult { exitcode: 1, stdout: "out".into(), stderr: "err".into() };
        let value = results_from_run(&result);
        assert_eq!(value.get("stdout"), Some(&Value::String("out".into())));
        assert_eq!(value.get("stderr"), Some(&Value::String("err".into())));
    }
}

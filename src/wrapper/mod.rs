//! The JSON contract shared by the `pxa-execution-wrapper` and
//! `pxa-task-wrapper` companion binaries and the core that spawns them.
//!
//! The wrapper detaches a child process's lifetime from the agent's: it
//! redirects the child's stdio to files and atomically writes its exit code,
//! so a non-blocking action survives an agent restart.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Stdin contract for `pxa-execution-wrapper`, matching
/// `execution_wrapper.cc`'s input JSON exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionWrapperRequest {
    /// Path to the executable to run.
    pub executable: String,
    /// Arguments passed to the executable.
    pub arguments: Vec<String>,
    /// Content fed to the child's stdin.
    pub input: String,
    /// Path the child's stdout is redirected to.
    pub stdout: PathBuf,
    /// Path the child's stderr is redirected to.
    pub stderr: PathBuf,
    /// Path the child's exit code is atomically written to.
    pub exitcode: PathBuf,
}

/// Exit code the execution wrapper uses when the child process could not be
/// spawned at all (executable missing, not executable, …).
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

/// Stdin contract for `pxa-task-wrapper`: an inner task invocation plus the
/// same output-file triple as [`ExecutionWrapperRequest`], minus `pid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWrapperRequest {
    /// The task invocation itself.
    pub input: TaskInvocation,
    /// Where the task's stdout/stderr/exitcode are written.
    pub output_files: TaskOutputFiles,
}

/// The task name (`<module>` or `<module>::<task>`) and its input object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInvocation {
    /// The task name, e.g. `"package"` or `"package::status"`.
    pub task: String,
    /// The task's input parameters.
    pub input: serde_json::Value,
}

/// Output file paths for a task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputFiles {
    /// Path the task's stdout is redirected to.
    pub stdout: PathBuf,
    /// Path the task's stderr is redirected to.
    pub stderr: PathBuf,
    /// Path the task's exit code is atomically written to.
    pub exitcode: PathBuf,
}

/// Error kinds a task wrapper reports via `{"_error": {"kind": ..., "msg":
/// ...}}` on stdout, matching the four `set_error` call sites in the
/// original `task.cc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskErrorKind {
    /// The task name did not match `\A\w+(::\w+)?\z`.
    InvalidTask,
    /// No executable file matched the resolved task path.
    NotFound,
    /// The task's stdout was not valid UTF-8.
    OutputEncodingError,
    /// The child process could not be spawned.
    ExecFailed,
}

impl TaskErrorKind {
    /// The `kind` string reported on the wire, e.g.
    /// `"puppetlabs.tasks/invalid-task"`.
    #[must_use]
    pub fn wire_kind(self) -> String {
        let suffix = match self {
            Self::InvalidTask => "invalid-task",
            Self::NotFound => "not-found",
            Self::OutputEncodingError => "output-encoding-error",
            Self::ExecFailed => "exec-failed",
        };
        format!("puppetlabs.tasks/{suffix}")
    }
}

/// The `{"_error": {...}}` shape a task wrapper prints to stdout on
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorOutput {
    /// The nested error object.
    #[serde(rename = "_error")]
    pub error: TaskError,
}

/// The nested error object inside [`TaskErrorOutput`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    /// The wire error kind, e.g. `"puppetlabs.tasks/not-found"`.
    pub kind: String,
    /// A localized, human-readable message.
    pub msg: String,
}

impl TaskErrorOutput {
    /// Build the wire error shape for `kind` with a localized `msg`.
    #[must_use]
    pub fn new(kind: TaskErrorKind, msg: impl Into<String>) -> Self {
        Self {
            error: TaskError { kind: kind.wire_kind(), msg: msg.into() },
        }
    }
}

/// The `{"output": "..."}` shape a task wrapper prints to stdout on
/// success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSuccessOutput {
    /// The child process's stdout, verbatim.
    pub output: String,
}

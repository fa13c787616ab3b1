//! `pxa-task-wrapper`: runs a single task invocation to completion, writing
//! its stdout/stderr/exit code to the named files before exiting.
//!
//! Spawned detached from the agent process so a long-running task survives
//! an agent restart; the agent later reads the files back rather than
//! waiting on this process directly for crash-recovery purposes (though in
//! the common case it does await this process's own exit).

#![expect(clippy::print_stderr, reason = "standalone wrapper binary has no tracing/logging infrastructure of its own")]

use std::io::Read as _;
use std::path::PathBuf;

use pxa::modules::task::{find_task_executable, parse_task_name, run_resolved_task};
use pxa::wrapper::{TaskErrorKind, TaskErrorOutput, TaskWrapperRequest};

fn main() {
    if let Err(error) = run() {
        eprintln!("pxa-task-wrapper: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let request: TaskWrapperRequest = serde_json::from_str(&input)?;

    let tasks_dir = PathBuf::from(std::env::var("PXA_TASKS_DIR").unwrap_or_else(|_| "/opt/puppetlabs/pxa/tasks".to_owned()));

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let (stdout_json, stderr, exitcode) = runtime.block_on(resolve_and_run(&tasks_dir, &request.input.task, &request.input.input));

    atomic_write(&request.output_files.stdout, &stdout_json)?;
    atomic_write(&request.output_files.stderr, &stderr)?;
    atomic_write(&request.output_files.exitcode, &exitcode.to_string())?;
    Ok(())
}

async fn resolve_and_run(tasks_dir: &std::path::Path, taskname: &str, input: &serde_json::Value) -> (String, String, i32) {
    let Some((module, task)) = parse_task_name(taskname) else {
        let error = TaskErrorOutput::new(TaskErrorKind::InvalidTask, format!("Invalid task name '{taskname}'"));
        return (serde_json::to_string(&error).unwrap_or_default(), String::new(), 1);
    };

    let Ok(resolved) = find_task_executable(tasks_dir, &module, &task).await else {
        let error = TaskErrorOutput::new(TaskErrorKind::NotFound, format!("Task file for '{taskname}' is not present or not executable"));
        return (serde_json::to_string(&error).unwrap_or_default(), String::new(), 1);
    };

    match run_resolved_task(taskname, &resolved, input).await {
        Ok((output, stderr, exitcode)) => (output.to_string(), stderr, exitcode),
        Err(error) => {
            let error = TaskErrorOutput::new(TaskErrorKind::ExecFailed, format!("Task '{taskname}' failed to run: {error}"));
            (serde_json::to_string(&error).unwrap_or_default(), String::new(), 127)
        }
    }
}

fn atomic_write(path: &std::path::Path, body: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp-wrapper-write");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

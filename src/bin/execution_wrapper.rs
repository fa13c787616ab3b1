//! `pxa-execution-wrapper`: runs a single child process to completion,
//! redirecting its stdio to files and atomically recording its exit code, so
//! a non-blocking action survives an agent restart.

#![expect(clippy::print_stderr, reason = "standalone wrapper binary has no tracing/logging infrastructure of its own")]

use std::io::{Read as _, Write as _};
use std::process::Stdio;

use pxa::wrapper::{ExecutionWrapperRequest, SPAWN_FAILURE_EXIT_CODE};

fn main() {
    let mut input = String::new();
    if let Err(error) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("pxa-execution-wrapper: failed to read stdin: {error}");
        std::process::exit(1);
    }
    let request: ExecutionWrapperRequest = match serde_json::from_str(&input) {
        Ok(request) => request,
        Err(error) => {
            eprintln!("pxa-execution-wrapper: malformed request: {error}");
            std::process::exit(1);
        }
    };

    let exitcode = run(&request);
    if let Err(error) = write_exitcode(&request, exitcode) {
        eprintln!("pxa-execution-wrapper: failed to write exit code: {error}");
    }
    std::process::exit(exitcode);
}

fn run(request: &ExecutionWrapperRequest) -> i32 {
    match spawn_and_wait(request) {
        Ok(exitcode) => exitcode,
        Err(reason) => {
            let message = format!("Executable '{}' failed to run: {reason}", request.executable);
            let _ = write_file(&request.stderr, message.as_bytes());
            SPAWN_FAILURE_EXIT_CODE
        }
    }
}

fn spawn_and_wait(request: &ExecutionWrapperRequest) -> Result<i32, std::io::Error> {
    let mut child = std::process::Command::new(&request.executable)
        .args(&request.arguments)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(request.input.as_bytes());
    }

    let output = child.wait_with_output()?;
    write_file(&request.stdout, &output.stdout)?;
    write_file(&request.stderr, &output.stderr)?;
    Ok(output.status.code().unwrap_or(-1))
}

fn write_file(path: &std::path::Path, body: &[u8]) -> Result<(), std::io::Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        let mut file = std::fs::OpenOptions::new().write(true).create(true).truncate(true).mode(0o640).open(path)?;
        file.write_all(body)
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, body)
    }
}

fn write_exitcode(request: &ExecutionWrapperRequest, exitcode: i32) -> Result<(), std::io::Error> {
    let tmp = request.exitcode.with_extension("tmp-wrapper-write");
    write_file(&tmp, exitcode.to_string().as_bytes())?;
    std::fs::rename(&tmp, &request.exitcode)
}

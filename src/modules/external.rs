//! External modules: an executable discovered at load time, introspected by
//! running it with the single argument `metadata`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::bolt::{self, CommandObject, RunResult};
use super::{ActionSchema, Module, ModuleError};
use crate::locale::format_msg;
use crate::request::{ActionRequest, RequestType};
use crate::response::ModuleType;

#[derive(Debug, Deserialize)]
struct RawModuleMetadata {
    #[expect(dead_code, reason = "not surfaced on Module yet, but part of the validated metadata schema")]
    description: String,
    actions: Vec<RawActionMetadata>,
}

#[derive(Debug, Deserialize)]
struct RawActionMetadata {
    name: String,
    description: String,
    input: Value,
    results: Value,
}

/// A module backed by an external executable, introspected at load time via
/// `<path> metadata`.
pub struct ExternalModule {
    name: String,
    path: PathBuf,
    config: Option<Value>,
    actions: Vec<ActionSchema>,
}

impl ExternalModule {
    /// Run `path` with argument `metadata`, parse and validate its output,
    /// and build an [`ExternalModule`] exposing the actions it describes.
    ///
    /// # Errors
    /// Returns [`ModuleError::LoadError`] if the executable cannot be run,
    /// exits non-zero, or its stdout is not valid metadata JSON.
    pub async fn load(path: impl Into<PathBuf>, config: Option<Value>) -> Result<Self, ModuleError> {
        let path = path.into();
        let name = module_name_from_path(&path)?;
        let probe = CommandObject {
            executable: path.clone(),
            arguments: vec!["metadata".to_owned()],
            environment: HashMap::new(),
            input: String::new(),
        };
        let result = bolt::run_sync(&probe).await.map_err(|e| ModuleError::LoadError(e.to_string()))?;
        if result.exitcode != 0 {
            return Err(ModuleError::LoadError(format_msg(
                "module '{1}' failed to report its metadata: {2}",
                &[&name, &result.stderr],
            )));
        }
        let metadata: RawModuleMetadata = serde_json::from_str(&result.stdout)
            .map_err(|e| ModuleError::LoadError(format_msg("module '{1}' returned invalid metadata: {2}", &[&name, &e.to_string()])))?;
        let actions = metadata
            .actions
            .into_iter()
            .map(|a| ActionSchema { name: a.name, description: a.description, input: a.input, results: a.results })
            .collect();
        Ok(Self { name, path, config, actions })
    }

    fn invocation_payload(&self, request: &ActionRequest) -> String {
        let payload = json!({
            "input": request.params(),
            "configuration": self.config.clone().unwrap_or(Value::Null),
        });
        payload.to_string()
    }
}

#[async_trait]
impl Module for ExternalModule {
    fn name(&self) -> &str { &self.name }
    fn actions(&self) -> &[ActionSchema] { &self.actions }
    fn module_type(&self) -> ModuleType { ModuleType::External }
    fn config(&self) -> Option<&Value> { self.config.as_ref() }

    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError> {
        let cmd = CommandObject {
            executable: self.path.clone(),
            arguments: vec![request.action().to_owned()],
            environment: HashMap::new(),
            input: self.invocation_payload(request),
        };
        let result = match request.request_type() {
            RequestType::Blocking => bolt::run_sync(&cmd).await?,
            RequestType::NonBlocking => {
                let results_dir = request.results_dir().ok_or_else(|| {
                    ModuleError::Processing("non-blocking external action dispatched without a results directory".to_owned())
                })?;
                bolt::run_detached(&cmd, &results_dir).await?
            }
        };
        parse_module_output(request.action(), &result)
    }
}

fn parse_module_output(action: &str, result: &RunResult) -> Result<Value, ModuleError> {
    if result.stdout.trim().is_empty() {
        return Err(ModuleError::Processing(format_msg(
            "action '{1}' produced no output (exit code {2})",
            &[action, &result.exitcode.to_string()],
        )));
    }
    serde_json::from_str(&result.stdout)
        .map_err(|_| ModuleError::InvalidOutput { action: action.to_owned(), detail: "stdout is not valid JSON".to_owned() })
}

fn module_name_from_path(path: &Path) -> Result<String, ModuleError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_owned)
        .ok_or_else(|| ModuleError::LoadError(format!("cannot derive a module name from '{}'", path.display())))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::request::RequestType as ReqType;

    fn write_fake_module(dir: &std::path::Path, script: &str) -> PathBuf {
        let path = dir.join("fake_module");
        std::fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn loads_metadata_and_exposes_actions() {
        let dir = tempdir().unwrap();
        let script = "#!/bin/sh\necho '{\"description\":\"fake\",\"actions\":[{\"name\":\"run\",\"description\":\"run it\",\"input\":{},\"results\":{}}]}'\n";
        let path = write_fake_module(dir.path(), script);
        let module = ExternalModule::load(path, None).await.unwrap();
        assert!(module.has_action("run"));
        assert_eq!(module.module_type(), ModuleType::External);
    }

    #[tokio::test]
    async fn blocking_call_action_parses_json_stdout() {
        let dir = tempdir().unwrap();
        let script = "#!/bin/sh\nif [ \"$1\" = metadata ]; then\n  echo '{\"description\":\"fake\",\"actions\":[{\"name\":\"run\",\"description\":\"\",\"input\":{},\"results\":{}}]}'\nelse\n  echo '{\"outcome\":\"ok\"}'\nfi\n";
        let path = write_fake_module(dir.path(), script);
        let module = ExternalModule::load(path, None).await.unwrap();
        let data = json!({"transaction_id": "t1", "module": "fake_module", "action": "run"});
        let request = ActionRequest::from_envelope(ReqType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let results = module.call_action(&request).await.unwrap();
        assert_eq!(results.get("outcome"), Some(&Value::String("ok".into())));
    }

    #[tokio::test]
    async fn non_json_stdout_is_an_invalid_output_error() {
        let dir = tempdir().unwrap();
        let script = "#!/bin/sh\nif [ \"$1\" = metadata ]; then\n  echo '{\"description\":\"fake\",\"actions\":[{\"name\":\"run\",\"description\":\"\",\"input\":{},\"results\":{}}]}'\nelse\n  echo 'not json'\nfi\n";
        let path = write_fake_module(dir.path(), script);
        let module = ExternalModule::load(path, None).await.unwrap();
        let data = json!({"transaction_id": "t1", "module": "fake_module", "action": "run"});
        let request = ActionRequest::from_envelope(ReqType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let error = module.call_action(&request).await.unwrap_err();
        assert!(matches!(error, ModuleError::InvalidOutput { .. }));
    }
}

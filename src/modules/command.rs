//! The `command` bolt-family module: runs `params.command` through a shell.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::bolt::{self, CommandObject};
use super::{ActionSchema, Module, ModuleError};
use crate::request::ActionRequest;
use crate::response::ModuleType;

/// Runs an arbitrary shell command line and reports its exit code and
/// captured output.
pub struct CommandModule {
    actions: Vec<ActionSchema>,
}

impl CommandModule {
    /// Build the `command` module with its single `run` action registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: vec![ActionSchema {
                name: "run".to_owned(),
                description: "Run a shell command line".to_owned(),
                input: json!({
                    "type": "object",
                    "properties": { "command": { "type": "string" } },
                    "required": ["command"],
                }),
                results: json!({
                    "type": "object",
                    "properties": {
                        "exitcode": { "type": "integer" },
                        "stdout": { "type": "string" },
                        "stderr": { "type": "string" },
                    },
                    "required": ["exitcode"],
                }),
            }],
        }
    }

    fn build_command_object(request: &ActionRequest) -> Result<CommandObject, ModuleError> {
        let command_line = request
            .params()
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "run".to_owned(), detail: "missing 'command'".to_owned() })?;
        Ok(CommandObject {
            executable: "/bin/sh".into(),
            arguments: vec!["-c".to_owned(), command_line.to_owned()],
            environment: HashMap::new(),
            input: String::new(),
        })
    }
}

impl Default for CommandModule {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &str { "command" }
    fn actions(&self) -> &[ActionSchema] { &self.actions }
    fn module_type(&self) -> ModuleType { ModuleType::Internal }

    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError> {
        let cmd = Self::build_command_object(request)?;
        bolt::dispatch(request, &cmd).await
    }
}

#[cfg(test)]
mod tests {
    use crate::request::RequestType;

    use super::*;

    #[tokio::test]
    async fn runs_shell_command_and_captures_stdout() {
        let module = CommandModule::new();
        let data = json!({"transaction_id": "t1", "module": "command", "action": "run", "params": {"command": "echo hi"}});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let response = module.execute_action(&request).await;
        let results = response.metadata().get("results").unwrap();
        assert_eq!(results.get("exitcode"), Some(&Value::from(0)));
        assert_eq!(results.get("stdout").unwrap().as_str().unwrap().trim(), "hi");
    }

    #[tokio::test]
    async fn missing_command_is_an_execution_error() {
        let module = CommandModule::new();
        let data = json!({"transaction_id": "t1", "module": "command", "action": "run"});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let response = module.execute_action(&request).await;
        assert!(response.metadata().contains_key("execution_error"));
    }
}

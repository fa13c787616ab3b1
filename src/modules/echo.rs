//! The `echo` built-in module: returns its `argument` parameter verbatim.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{ActionSchema, Module, ModuleError};
use crate::request::ActionRequest;
use crate::response::ModuleType;

/// Echoes back its `argument` parameter as `{outcome: argument}`.
pub struct EchoModule {
    actions: Vec<ActionSchema>,
}

impl EchoModule {
    /// Build the `echo` module with its single `echo` action registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: vec![ActionSchema {
                name: "echo".to_owned(),
                description: "Echo the given argument back".to_owned(),
                input: json!({
                    "type": "object",
                    "properties": { "argument": { "type": "string" } },
                    "required": ["argument"],
                }),
                results: json!({
                    "type": "object",
                    "properties": { "outcome": { "type": "string" } },
                    "required": ["outcome"],
                }),
            }],
        }
    }
}

impl Default for EchoModule {
    fn default() -> Self { Self::new() }
}

#[async_trait]
impl Module for EchoModule {
    fn name(&self) -> &str { "echo" }
    fn actions(&self) -> &[ActionSchema] { &self.actions }
    fn module_type(&self) -> ModuleType { ModuleType::Internal }
    fn supports_async(&self) -> bool { false }

    async fn call_action(&self, request: &ActionRequest) -> Result<Value, ModuleError> {
        let argument = request
            .params()
            .get("argument")
            .and_then(Value::as_str)
            .ok_or_else(|| ModuleError::InvalidInput { action: "echo".to_owned(), detail: "missing 'argument'".to_owned() })?;
        Ok(json!({ "outcome": argument }))
    }
}

#[cfg(test)]
mod tests {
    use crate::request::RequestType;

    use super::*;

    #[tokio::test]
    async fn echoes_argument_back_as_outcome() {
        let module = EchoModule::new();
        let data = json!({"transaction_id": "t1", "module": "echo", "action": "echo", "params": {"argument": "maradona"}});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let response = module.execute_action(&request).await;
        assert_eq!(response.metadata().get("results"), Some(&json!({"outcome": "maradona"})));
    }

    #[tokio::test]
    async fn missing_argument_is_an_execution_error() {
        let module = EchoModule::new();
        let data = json!({"transaction_id": "t1", "module": "echo", "action": "echo"});
        let request = ActionRequest::from_envelope(RequestType::Blocking, "m1".into(), "client".into(), &data, vec![]).unwrap();
        let response = module.execute_action(&request).await;
        assert!(response.metadata().contains_key("execution_error"));
    }
}
